// 存储模块：封装 SQLite/Postgres 连接，向执行器暴露同步的预编译语句接口。

mod postgres;
mod sqlite;

use crate::config::DatabaseConfig;
use anyhow::{anyhow, Result};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use std::fmt;
use std::sync::Arc;

pub use postgres::PostgresConnector;
pub use sqlite::SqliteConnector;

pub type DbResult<T> = std::result::Result<T, DbError>;

/// 数据库错误分类，Display 原样输出驱动返回的消息。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    /// 无法建立连接。
    #[error("{0}")]
    Connection(String),
    /// SQL 语法错误、参数绑定不匹配或结果读取失败。
    #[error("{0}")]
    Statement(String),
    /// 执行期被数据库约束拒绝。
    #[error("{0}")]
    Constraint(String),
}

impl DbError {
    pub fn message(&self) -> &str {
        match self {
            DbError::Connection(message)
            | DbError::Statement(message)
            | DbError::Constraint(message) => message,
        }
    }
}

/// 绑定到预编译语句上的参数值。
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i32),
    Bytes(Vec<u8>),
    Double(f64),
}

/// 结果集中的原始列值。
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Text(String),
    Blob(Vec<u8>),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("null"),
            SqlValue::Integer(value) => write!(f, "{value}"),
            SqlValue::Real(value) => write!(f, "{value}"),
            SqlValue::Boolean(value) => write!(f, "{value}"),
            SqlValue::Text(value) => f.write_str(value),
            SqlValue::Blob(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            SqlValue::Date(value) => write!(f, "{}", value.format("%Y-%m-%d")),
            SqlValue::Timestamp(value) => f.write_str(&format_timestamp(value)),
        }
    }
}

/// 时间戳文本：`YYYY-MM-DD hh:mm:ss.f`，小数部分去掉末尾的 0 但至少保留一位。
pub fn format_timestamp(value: &NaiveDateTime) -> String {
    let nanos = value.nanosecond() % 1_000_000_000;
    let fraction = format!("{nanos:09}");
    let fraction = fraction.trim_end_matches('0');
    let fraction = if fraction.is_empty() { "0" } else { fraction };
    format!("{}.{fraction}", value.format("%Y-%m-%d %H:%M:%S"))
}

/// 列的声明类型，驱动给出的类型名统一归一化到这里。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    BigInt,
    Integer,
    SmallInt,
    TinyInt,
    Double,
    Float,
    Boolean,
    Char,
    VarChar,
    NChar,
    NVarChar,
    Date,
    Timestamp,
    Binary,
    Other(String),
}

impl SqlType {
    pub fn from_declared(name: &str) -> Self {
        let normalized = normalize_type_name(name);
        match normalized.as_str() {
            "BIGINT" | "INT8" | "BIGSERIAL" | "UNSIGNED BIG INT" => SqlType::BigInt,
            "INTEGER" | "INT" | "INT4" | "SERIAL" | "MEDIUMINT" => SqlType::Integer,
            "SMALLINT" | "INT2" | "SMALLSERIAL" => SqlType::SmallInt,
            "TINYINT" => SqlType::TinyInt,
            "DOUBLE" | "DOUBLE PRECISION" | "FLOAT8" => SqlType::Double,
            "FLOAT" | "FLOAT4" | "REAL" => SqlType::Float,
            "BOOLEAN" | "BOOL" => SqlType::Boolean,
            "CHAR" | "CHARACTER" | "BPCHAR" => SqlType::Char,
            "VARCHAR" | "CHARACTER VARYING" | "VARYING CHARACTER" | "TEXT" => SqlType::VarChar,
            "NCHAR" | "NATIONAL CHARACTER" | "NATIVE CHARACTER" | "NATIONAL CHAR" => {
                SqlType::NChar
            }
            "NVARCHAR" | "NATIONAL VARCHAR" | "NATIONAL CHARACTER VARYING" => SqlType::NVarChar,
            "DATE" => SqlType::Date,
            "TIMESTAMP"
            | "DATETIME"
            | "TIMESTAMPTZ"
            | "TIMESTAMP WITHOUT TIME ZONE"
            | "TIMESTAMP WITH TIME ZONE" => SqlType::Timestamp,
            "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" | "LONGVARBINARY" => SqlType::Binary,
            _ => SqlType::Other(normalized),
        }
    }
}

fn normalize_type_name(name: &str) -> String {
    // 去掉长度/精度修饰，例如 VARCHAR(20)、TIMESTAMP(3) WITH TIME ZONE。
    let mut stripped = String::with_capacity(name.len());
    let mut depth = 0usize;
    for ch in name.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => stripped.push(ch),
            _ => {}
        }
    }
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    pub sql_type: SqlType,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
        }
    }
}

/// 物化后的查询结果：列元数据 + 按结果集顺序排列的行。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl ResultSet {
    pub fn new(columns: Vec<ColumnMeta>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<SqlValue>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// 单次调用独占的数据库连接，语义对齐 JDBC 的 autocommit/commit/rollback。
pub trait Connection {
    fn set_auto_commit(&mut self, enabled: bool) -> DbResult<()>;
    fn auto_commit(&self) -> bool;
    fn commit(&mut self) -> DbResult<()>;
    fn rollback(&mut self) -> DbResult<()>;

    fn query(&mut self, sql: &str, params: &[SqlParam]) -> DbResult<ResultSet>;
    fn update(&mut self, sql: &str, params: &[SqlParam]) -> DbResult<usize>;
}

/// 连接工厂：每次调用打开一个新连接，不做池化。
pub trait Connector: Send + Sync {
    fn connect(&self) -> DbResult<Box<dyn Connection>>;
}

/// 根据 backend 配置构建连接工厂。
pub fn build_connector(config: &DatabaseConfig) -> Result<Arc<dyn Connector>> {
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => Ok(Arc::new(SqliteConnector::new(config.url.trim()))),
        "postgres" | "postgresql" | "pg" => Ok(Arc::new(PostgresConnector::new(
            &config.url,
            &config.user,
            &config.password,
            config.connect_timeout_s,
        )?)),
        other => Err(anyhow!("未知数据库后端: {other}")),
    }
}
