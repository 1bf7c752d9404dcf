// SQLite 连接实现：每次调用打开文件数据库，用 BEGIN/COMMIT/ROLLBACK 模拟 autocommit 开关。
use crate::storage::{
    ColumnMeta, Connection, Connector, DbError, DbResult, ResultSet, SqlParam, SqlType, SqlValue,
};
use rusqlite::types::{Value as LiteValue, ValueRef};
use rusqlite::{params_from_iter, ErrorCode};
use std::path::PathBuf;
use tracing::debug;

const MEMORY_PATH: &str = ":memory:";

pub struct SqliteConnector {
    db_path: PathBuf,
}

impl SqliteConnector {
    pub fn new(db_path: &str) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/webapp.db")
        } else {
            PathBuf::from(db_path)
        };
        Self { db_path: path }
    }

    fn ensure_db_dir(&self) -> DbResult<()> {
        if self.db_path.as_os_str() == MEMORY_PATH {
            return Ok(());
        }
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                DbError::Connection(format!("{}: {err}", parent.display()))
            })?;
        }
        Ok(())
    }
}

impl Connector for SqliteConnector {
    fn connect(&self) -> DbResult<Box<dyn Connection>> {
        self.ensure_db_dir()?;
        let conn = rusqlite::Connection::open(&self.db_path).map_err(|err| match err {
            rusqlite::Error::SqliteFailure(_, _) => DbError::Connection(err.to_string()),
            other => map_error(other),
        })?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        debug!("sqlite 连接已打开: {}", self.db_path.display());
        Ok(Box::new(SqliteConnection {
            conn,
            auto_commit: true,
        }))
    }
}

pub struct SqliteConnection {
    conn: rusqlite::Connection,
    auto_commit: bool,
}

impl SqliteConnection {
    fn begin(&self) -> DbResult<()> {
        self.conn.execute_batch("BEGIN").map_err(map_error)
    }

    fn finish(&self, statement: &str) -> DbResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch(statement).map_err(map_error)?;
        }
        Ok(())
    }
}

impl Connection for SqliteConnection {
    fn set_auto_commit(&mut self, enabled: bool) -> DbResult<()> {
        if enabled == self.auto_commit {
            return Ok(());
        }
        if enabled {
            // 打开 autocommit 时提交仍在进行的事务。
            self.finish("COMMIT")?;
        } else {
            self.begin()?;
        }
        self.auto_commit = enabled;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    fn commit(&mut self) -> DbResult<()> {
        if self.auto_commit {
            return Err(DbError::Statement(
                "cannot commit while autocommit is enabled".to_string(),
            ));
        }
        self.finish("COMMIT")?;
        self.begin()
    }

    fn rollback(&mut self) -> DbResult<()> {
        if self.auto_commit {
            return Err(DbError::Statement(
                "cannot roll back while autocommit is enabled".to_string(),
            ));
        }
        self.finish("ROLLBACK")?;
        self.begin()
    }

    fn query(&mut self, sql: &str, params: &[SqlParam]) -> DbResult<ResultSet> {
        let mut stmt = self.conn.prepare(sql).map_err(map_error)?;
        let declared = stmt
            .columns()
            .iter()
            .map(|column| {
                (
                    column.name().to_string(),
                    column.decl_type().map(str::to_string),
                )
            })
            .collect::<Vec<_>>();
        let values = params.iter().map(to_lite_value).collect::<Vec<_>>();
        let mut rows = stmt
            .query(params_from_iter(values.iter()))
            .map_err(map_error)?;

        let mut raw_rows = Vec::new();
        while let Some(row) = rows.next().map_err(map_error)? {
            let mut values = Vec::with_capacity(declared.len());
            for index in 0..declared.len() {
                let value = row.get_ref(index).map_err(map_error)?;
                values.push(from_value_ref(value));
            }
            raw_rows.push(values);
        }

        let columns = declared
            .into_iter()
            .enumerate()
            .map(|(index, (name, decl_type))| {
                let sql_type = match decl_type {
                    Some(decl_type) => SqlType::from_declared(&decl_type),
                    None => infer_type(&raw_rows, index),
                };
                ColumnMeta::new(name, sql_type)
            })
            .collect();
        let mut result = ResultSet::new(columns);
        for row in raw_rows {
            result.push_row(row);
        }
        Ok(result)
    }

    fn update(&mut self, sql: &str, params: &[SqlParam]) -> DbResult<usize> {
        let values = params.iter().map(to_lite_value).collect::<Vec<_>>();
        self.conn
            .execute(sql, params_from_iter(values.iter()))
            .map_err(map_error)
    }
}

fn to_lite_value(param: &SqlParam) -> LiteValue {
    match param {
        SqlParam::Text(text) => LiteValue::Text(text.clone()),
        SqlParam::Int(value) => LiteValue::Integer(i64::from(*value)),
        SqlParam::Bytes(bytes) => LiteValue::Blob(bytes.clone()),
        SqlParam::Double(value) => LiteValue::Real(*value),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(value) => SqlValue::Integer(value),
        ValueRef::Real(value) => SqlValue::Real(value),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

/// 表达式列没有声明类型，按首个非空值的存储类别推断。
fn infer_type(rows: &[Vec<SqlValue>], index: usize) -> SqlType {
    let first = rows
        .iter()
        .filter_map(|row| row.get(index))
        .find(|value| !value.is_null());
    match first {
        Some(SqlValue::Integer(_)) => SqlType::Integer,
        Some(SqlValue::Real(_)) => SqlType::Double,
        Some(SqlValue::Blob(_)) => SqlType::Binary,
        Some(_) => SqlType::VarChar,
        None => SqlType::Other("NULL".to_string()),
    }
}

fn map_error(err: rusqlite::Error) -> DbError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            DbError::Constraint(err.to_string())
        }
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::PermissionDenied
            ) =>
        {
            DbError::Connection(err.to_string())
        }
        _ => DbError::Statement(err.to_string()),
    }
}
