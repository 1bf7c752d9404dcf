// Postgres 连接实现：tokio-postgres 异步客户端经 block_on 暴露为同步接口，每次调用独立建连。
use crate::storage::{
    ColumnMeta, Connection, Connector, DbError, DbResult, ResultSet, SqlParam, SqlType, SqlValue,
};
use anyhow::{anyhow, Result};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, Statement};
use tracing::{debug, warn};

type BoxError = Box<dyn StdError + Sync + Send>;

pub struct PostgresConnector {
    config: tokio_postgres::Config,
    fallback_runtime: OnceLock<Arc<FallbackRuntime>>,
}

impl PostgresConnector {
    pub fn new(url: &str, user: &str, password: &str, connect_timeout_s: u64) -> Result<Self> {
        let cleaned = url.trim();
        let cleaned = cleaned.strip_prefix("jdbc:").unwrap_or(cleaned);
        if cleaned.is_empty() {
            return Err(anyhow!("postgres url is empty"));
        }
        let mut config = cleaned.parse::<tokio_postgres::Config>()?;
        if !user.trim().is_empty() {
            config.user(user.trim());
        }
        if !password.is_empty() {
            config.password(password);
        }
        config.connect_timeout(Duration::from_secs(connect_timeout_s.max(1)));
        Ok(Self {
            config,
            fallback_runtime: OnceLock::new(),
        })
    }

    /// 仅在调用方不处于 tokio 上下文时才创建。
    fn fallback_runtime(&self) -> DbResult<Arc<FallbackRuntime>> {
        if let Some(runtime) = self.fallback_runtime.get() {
            return Ok(runtime.clone());
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|err| {
                DbError::Connection(format!("create tokio runtime for postgres: {err}"))
            })?;
        let runtime = Arc::new(FallbackRuntime(Some(runtime)));
        // 并发初始化时以先写入者为准，多出来的运行时随 Arc 一起释放。
        Ok(self.fallback_runtime.get_or_init(|| runtime).clone())
    }
}

/// 私有运行时，释放时用 shutdown_background，在异步上下文中丢弃也不会 panic。
struct FallbackRuntime(Option<Runtime>);

impl FallbackRuntime {
    fn runtime(&self) -> Option<&Runtime> {
        self.0.as_ref()
    }
}

impl Drop for FallbackRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

impl Connector for PostgresConnector {
    fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let runtime = match Handle::try_current() {
            Ok(_) => None,
            Err(_) => Some(self.fallback_runtime()?),
        };
        let (client, connection) = block_on(runtime.as_deref(), self.config.connect(NoTls))?
            .map_err(|err| DbError::Connection(driver_message(&err)))?;
        let driver = async move {
            if let Err(err) = connection.await {
                warn!("postgres 连接异常断开: {err}");
            }
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(driver);
            }
            Err(_) => {
                if let Some(fallback) = runtime.as_deref().and_then(|rt| rt.runtime()) {
                    fallback.spawn(driver);
                }
            }
        }
        debug!("postgres 连接已打开");
        Ok(Box::new(PostgresConnection {
            client,
            runtime,
            auto_commit: true,
            in_transaction: false,
        }))
    }
}

fn block_on<F>(runtime: Option<&FallbackRuntime>, fut: F) -> DbResult<F::Output>
where
    F: Future,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(tokio::task::block_in_place(|| handle.block_on(fut)))
        }
        Ok(_) => Err(DbError::Connection(
            "postgres backend requires a multi-threaded tokio runtime".to_string(),
        )),
        Err(_) => runtime
            .and_then(|fallback| fallback.runtime())
            .map(|rt| rt.block_on(fut))
            .ok_or_else(|| {
                DbError::Connection("no tokio runtime available for postgres".to_string())
            }),
    }
}

pub struct PostgresConnection {
    client: Client,
    runtime: Option<Arc<FallbackRuntime>>,
    auto_commit: bool,
    in_transaction: bool,
}

impl PostgresConnection {
    fn wait<F: Future>(&self, fut: F) -> DbResult<F::Output> {
        block_on(self.runtime.as_deref(), fut)
    }

    fn batch(&mut self, statement: &str) -> DbResult<()> {
        self.wait(self.client.batch_execute(statement))?
            .map_err(map_error)
    }

    fn begin(&mut self) -> DbResult<()> {
        self.batch("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    fn finish(&mut self, statement: &str) -> DbResult<()> {
        if self.in_transaction {
            self.in_transaction = false;
            self.batch(statement)?;
        }
        Ok(())
    }

    fn read_value(
        &self,
        row: &Row,
        index: usize,
        ty: &Type,
        text_statements: &mut HashMap<u32, Statement>,
    ) -> DbResult<SqlValue> {
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(index)
                .map(|value| value.map(SqlValue::Boolean))
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(index)
                .map(|value| value.map(|value| SqlValue::Integer(i64::from(value))))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(index)
                .map(|value| value.map(|value| SqlValue::Integer(i64::from(value))))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(index)
                .map(|value| value.map(SqlValue::Integer))
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(index)
                .map(|value| value.map(|value| SqlValue::Real(f64::from(value))))
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(index)
                .map(|value| value.map(SqlValue::Real))
        } else if *ty == Type::BYTEA {
            row.try_get::<_, Option<Vec<u8>>>(index)
                .map(|value| value.map(SqlValue::Blob))
        } else if *ty == Type::DATE {
            row.try_get::<_, Option<NaiveDate>>(index)
                .map(|value| value.map(SqlValue::Date))
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<NaiveDateTime>>(index)
                .map(|value| value.map(SqlValue::Timestamp))
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<DateTime<Utc>>>(index)
                .map(|value| value.map(|value| SqlValue::Timestamp(value.naive_utc())))
        } else if *ty == Type::NUMERIC {
            match row.try_get::<_, Option<Decimal>>(index) {
                Ok(value) => Ok(value.map(|value| SqlValue::Text(value.to_string()))),
                // NaN 或超出 Decimal 精度的值交给服务端转文本。
                Err(_) => return self.server_text(row, index, ty, text_statements),
            }
        } else if <String as FromSql>::accepts(ty) {
            row.try_get::<_, Option<String>>(index)
                .map(|value| value.map(SqlValue::Text))
        } else {
            return self.server_text(row, index, ty, text_statements);
        };
        value
            .map(|value| value.unwrap_or(SqlValue::Null))
            .map_err(map_error)
    }

    /// 其余类型把二进制值原样回传给服务端，由该类型自己的输出函数转成文本。
    fn server_text(
        &self,
        row: &Row,
        index: usize,
        ty: &Type,
        text_statements: &mut HashMap<u32, Statement>,
    ) -> DbResult<SqlValue> {
        let Some(raw) = row
            .try_get::<_, Option<RawValue>>(index)
            .map_err(map_error)?
        else {
            return Ok(SqlValue::Null);
        };
        let stmt = match text_statements.get(&ty.oid()) {
            Some(stmt) => stmt.clone(),
            None => {
                let stmt = self
                    .wait(self.client.prepare_typed("SELECT $1::text", &[ty.clone()]))?
                    .map_err(map_error)?;
                text_statements.insert(ty.oid(), stmt.clone());
                stmt
            }
        };
        let text_row = self
            .wait(self.client.query_one(&stmt, &[&raw]))?
            .map_err(map_error)?;
        text_row
            .try_get::<_, Option<String>>(0)
            .map(|value| value.map(SqlValue::Text).unwrap_or(SqlValue::Null))
            .map_err(map_error)
    }
}

impl Connection for PostgresConnection {
    fn set_auto_commit(&mut self, enabled: bool) -> DbResult<()> {
        if enabled == self.auto_commit {
            return Ok(());
        }
        if enabled {
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
        let sql = rewrite_placeholders(sql);
        let stmt = self
            .wait(self.client.prepare(&sql))?
            .map_err(map_error)?;
        let columns = stmt
            .columns()
            .iter()
            .map(|column| {
                ColumnMeta::new(column.name(), SqlType::from_declared(column.type_().name()))
            })
            .collect::<Vec<_>>();
        let types = stmt
            .columns()
            .iter()
            .map(|column| column.type_().clone())
            .collect::<Vec<_>>();
        let bound = bind_values(params);
        let refs = bound
            .iter()
            .map(|value| value.as_ref() as &(dyn ToSql + Sync))
            .collect::<Vec<_>>();
        let rows = self
            .wait(self.client.query(&stmt, &refs))?
            .map_err(map_error)?;

        let mut text_statements = HashMap::new();
        let mut result = ResultSet::new(columns);
        for row in &rows {
            let mut values = Vec::with_capacity(types.len());
            for (index, ty) in types.iter().enumerate() {
                values.push(self.read_value(row, index, ty, &mut text_statements)?);
            }
            result.push_row(values);
        }
        Ok(result)
    }

    fn update(&mut self, sql: &str, params: &[SqlParam]) -> DbResult<usize> {
        let sql = rewrite_placeholders(sql);
        let bound = bind_values(params);
        let refs = bound
            .iter()
            .map(|value| value.as_ref() as &(dyn ToSql + Sync))
            .collect::<Vec<_>>();
        let affected = self
            .wait(self.client.execute(sql.as_str(), &refs))?
            .map_err(map_error)?;
        Ok(affected as usize)
    }
}

/// `?` 占位符改写为 `$1..$n`；引号、标识符与注释内的 `?` 保持原样，`??` 表示字面量 `?`。
fn rewrite_placeholders(sql: &str) -> String {
    let mut output = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut index = 0usize;
    while let Some(ch) = chars.next() {
        match ch {
            '\'' | '"' => {
                // 连续两个引号是转义，会在下一轮重新进入引号状态。
                output.push(ch);
                for inner in chars.by_ref() {
                    output.push(inner);
                    if inner == ch {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                output.push(ch);
                for inner in chars.by_ref() {
                    output.push(inner);
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                output.push(ch);
                if let Some(star) = chars.next() {
                    output.push(star);
                }
                let mut previous = '\0';
                for inner in chars.by_ref() {
                    output.push(inner);
                    if previous == '*' && inner == '/' {
                        break;
                    }
                    previous = inner;
                }
            }
            '?' if chars.peek() == Some(&'?') => {
                chars.next();
                output.push('?');
            }
            '?' => {
                index += 1;
                output.push('$');
                output.push_str(&index.to_string());
            }
            _ => output.push(ch),
        }
    }
    output
}

fn bind_values(params: &[SqlParam]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .iter()
        .map(|param| -> Box<dyn ToSql + Sync + Send> {
            match param {
                SqlParam::Text(text) => Box::new(text.clone()),
                SqlParam::Int(value) => Box::new(IntParam(*value)),
                SqlParam::Bytes(bytes) => Box::new(bytes.clone()),
                SqlParam::Double(value) => Box::new(DoubleParam(*value)),
            }
        })
        .collect()
}

/// 整数参数按服务端推断的列类型编码，int2 需要检查范围。
#[derive(Debug)]
struct IntParam(i32);

impl ToSql for IntParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        if *ty == Type::INT2 {
            i16::try_from(self.0)?.to_sql(ty, out)
        } else if *ty == Type::INT8 {
            i64::from(self.0).to_sql(ty, out)
        } else if *ty == Type::FLOAT8 {
            f64::from(self.0).to_sql(ty, out)
        } else if *ty == Type::NUMERIC {
            Decimal::from(self.0).to_sql(ty, out)
        } else {
            self.0.to_sql(ty, out)
        }
    }

    fn accepts(ty: &Type) -> bool {
        <i16 as ToSql>::accepts(ty)
            || <i32 as ToSql>::accepts(ty)
            || <i64 as ToSql>::accepts(ty)
            || <Decimal as ToSql>::accepts(ty)
            || *ty == Type::FLOAT8
    }

    to_sql_checked!();
}

#[derive(Debug)]
struct DoubleParam(f64);

impl ToSql for DoubleParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        if *ty == Type::FLOAT4 {
            let narrowed = self.0 as f32;
            if self.0.is_finite() && !narrowed.is_finite() {
                return Err(format!("value {} is out of range for type real", self.0).into());
            }
            narrowed.to_sql(ty, out)
        } else if *ty == Type::NUMERIC {
            Decimal::try_from(self.0)?.to_sql(ty, out)
        } else {
            self.0.to_sql(ty, out)
        }
    }

    fn accepts(ty: &Type) -> bool {
        <f32 as ToSql>::accepts(ty) || <f64 as ToSql>::accepts(ty) || <Decimal as ToSql>::accepts(ty)
    }

    to_sql_checked!();
}

/// 列值的原始二进制帧，只用于回传给服务端转文本。
#[derive(Debug)]
struct RawValue(Vec<u8>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        Ok(RawValue(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

impl ToSql for RawValue {
    fn to_sql(&self, _ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        out.extend_from_slice(&self.0);
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// 服务端错误取其原始消息；客户端错误附上完整的 source 链。
fn driver_message(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => error_chain(err),
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn map_error(err: tokio_postgres::Error) -> DbError {
    let message = driver_message(&err);
    if err.is_closed() {
        return DbError::Connection(message);
    }
    let is_constraint = err
        .code()
        .map(|state| state.code().starts_with("23"))
        .unwrap_or(false);
    if is_constraint {
        DbError::Constraint(message)
    } else {
        DbError::Statement(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jdbc_prefix_is_accepted() {
        let connector =
            PostgresConnector::new("jdbc:postgresql://localhost:5432/university", "app", "pw", 3)
                .expect("parse url");
        assert_eq!(connector.config.get_user(), Some("app"));
        assert_eq!(connector.config.get_dbname(), Some("university"));
    }

    #[test]
    fn empty_url_is_rejected() {
        assert!(PostgresConnector::new("  ", "", "", 3).is_err());
    }

    #[test]
    fn postgres_type_names_map_to_sql_types() {
        assert_eq!(SqlType::from_declared(Type::INT8.name()), SqlType::BigInt);
        assert_eq!(SqlType::from_declared(Type::INT4.name()), SqlType::Integer);
        assert_eq!(SqlType::from_declared(Type::FLOAT8.name()), SqlType::Double);
        assert_eq!(SqlType::from_declared(Type::BPCHAR.name()), SqlType::Char);
        assert_eq!(SqlType::from_declared(Type::BYTEA.name()), SqlType::Binary);
        assert_eq!(
            SqlType::from_declared(Type::TIMESTAMPTZ.name()),
            SqlType::Timestamp
        );
    }

    #[test]
    fn question_marks_become_numbered_placeholders() {
        assert_eq!(
            rewrite_placeholders("select password from Instructor where ID = ?"),
            "select password from Instructor where ID = $1"
        );
        assert_eq!(
            rewrite_placeholders("insert into t (a, b, c) values (?, ?, ?)"),
            "insert into t (a, b, c) values ($1, $2, $3)"
        );
    }

    #[test]
    fn quoted_and_commented_question_marks_are_kept() {
        assert_eq!(
            rewrite_placeholders("select '?', 'it''s ?', \"col?\" from t where a = ?"),
            "select '?', 'it''s ?', \"col?\" from t where a = $1"
        );
        assert_eq!(
            rewrite_placeholders("select 1 -- why?\nwhere a = ? /* b = ? */ and c = ?"),
            "select 1 -- why?\nwhere a = $1 /* b = ? */ and c = $2"
        );
        assert_eq!(
            rewrite_placeholders("select data ?? 'key' from t where id = ?"),
            "select data ? 'key' from t where id = $1"
        );
    }

    #[test]
    fn int_params_follow_inferred_column_type() {
        let mut buf = BytesMut::new();
        assert!(<IntParam as ToSql>::accepts(&Type::INT8));
        assert!(<IntParam as ToSql>::accepts(&Type::NUMERIC));
        IntParam(5)
            .to_sql_checked(&Type::INT8, &mut buf)
            .expect("widen to int8");
        assert_eq!(buf.len(), 8);

        buf.clear();
        IntParam(7)
            .to_sql_checked(&Type::INT2, &mut buf)
            .expect("narrow to int2");
        assert_eq!(buf.len(), 2);

        assert!(IntParam(70_000)
            .to_sql_checked(&Type::INT2, &mut BytesMut::new())
            .is_err());
        assert!(IntParam(1)
            .to_sql_checked(&Type::TEXT, &mut BytesMut::new())
            .is_err());
    }

    #[test]
    fn double_params_follow_inferred_column_type() {
        let mut buf = BytesMut::new();
        DoubleParam(2.5)
            .to_sql_checked(&Type::FLOAT4, &mut buf)
            .expect("narrow to float4");
        assert_eq!(buf.len(), 4);
        DoubleParam(65000.5)
            .to_sql_checked(&Type::NUMERIC, &mut BytesMut::new())
            .expect("numeric");
        assert!(DoubleParam(1e300)
            .to_sql_checked(&Type::FLOAT4, &mut BytesMut::new())
            .is_err());
    }

    #[derive(Debug, thiserror::Error)]
    #[error("error serializing parameter 0")]
    struct SerializeFailure(#[source] std::num::TryFromIntError);

    #[test]
    fn client_errors_keep_their_cause() {
        let cause = i16::try_from(70_000i32).expect_err("out of range");
        let message = error_chain(&SerializeFailure(cause));
        assert!(message.starts_with("error serializing parameter 0: "));
        assert!(message.contains("out of range"));
    }

    #[test]
    fn fallback_runtime_drops_inside_async_context() {
        let connector =
            PostgresConnector::new("postgresql://localhost/university", "", "", 1).expect("parse");
        connector.fallback_runtime().expect("create runtime");
        let outer = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("outer runtime");
        outer.block_on(async move {
            drop(connector);
        });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connector_inside_runtime_owns_no_runtime() {
        let connector =
            PostgresConnector::new("postgresql://localhost/university", "", "", 1).expect("parse");
        assert!(connector.fallback_runtime.get().is_none());
        drop(connector);
    }
}
