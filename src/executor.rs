// 查询执行器：每次调用独立建连，关闭 autocommit 后绑定参数并执行，提交或回滚后恢复 autocommit。
use crate::envelope::{error_envelope, ok_envelope, Envelope};
use crate::result_json::result_set_to_json;
use crate::storage::{Connection, Connector, DbError, DbResult, ResultSet, SqlParam, SqlValue};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub const NO_RECORDS_UPDATED: &str = "No records updated";

/// 参数的声明类型，绑定时按它分派而不是按值的实际类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Int,
    Bytea,
    Double,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::String => "STRING",
            ParamType::Int => "INT",
            ParamType::Bytea => "BYTEA",
            ParamType::Double => "DOUBLE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    Int(i32),
    Bytes(Vec<u8>),
    Double(f64),
}

impl ParamValue {
    fn kind(&self) -> &'static str {
        match self {
            ParamValue::Text(_) => "string",
            ParamValue::Int(_) => "integer",
            ParamValue::Bytes(_) => "byte array",
            ParamValue::Double(_) => "double",
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Double(value)
    }
}

impl From<Vec<u8>> for ParamValue {
    fn from(value: Vec<u8>) -> Self {
        ParamValue::Bytes(value)
    }
}

/// 按位置把声明类型与值配对；数量不一致或类型不符时绑定失败。
pub fn bind_params(types: &[ParamType], values: &[ParamValue]) -> DbResult<Vec<SqlParam>> {
    if types.len() != values.len() {
        return Err(DbError::Statement(format!(
            "parameter count mismatch: {} declared types for {} values",
            types.len(),
            values.len()
        )));
    }
    types
        .iter()
        .zip(values.iter())
        .enumerate()
        .map(|(index, (param_type, value))| {
            let bound = match (param_type, value) {
                (ParamType::String, ParamValue::Text(text)) => SqlParam::Text(text.clone()),
                (ParamType::Int, ParamValue::Int(number)) => SqlParam::Int(*number),
                (ParamType::Double, ParamValue::Double(number)) => SqlParam::Double(*number),
                (ParamType::Bytea, ParamValue::Bytes(bytes)) => SqlParam::Bytes(bytes.clone()),
                (param_type, value) => {
                    return Err(DbError::Statement(format!(
                        "parameter {}: declared {param_type} but value is {}",
                        index + 1,
                        value.kind()
                    )))
                }
            };
            Ok(bound)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Update,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Rows(ResultSet),
    UpdateCount(usize),
}

#[derive(Clone)]
pub struct QueryExecutor {
    connector: Arc<dyn Connector>,
}

impl QueryExecutor {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub fn execute(
        &self,
        query: &str,
        types: &[ParamType],
        values: &[ParamValue],
        kind: StatementKind,
    ) -> DbResult<Outcome> {
        match kind {
            StatementKind::Query => self.query(query, types, values).map(Outcome::Rows),
            StatementKind::Update => self
                .update(query, types, values)
                .map(Outcome::UpdateCount),
        }
    }

    pub fn query(
        &self,
        query: &str,
        types: &[ParamType],
        values: &[ParamValue],
    ) -> DbResult<ResultSet> {
        self.run_in_transaction(|conn| {
            let params = bind_params(types, values)?;
            conn.query(query, &params)
        })
    }

    pub fn update(
        &self,
        query: &str,
        types: &[ParamType],
        values: &[ParamValue],
    ) -> DbResult<usize> {
        self.run_in_transaction(|conn| {
            let params = bind_params(types, values)?;
            conn.update(query, &params)
        })
    }

    /// 列表形式的行。失败时返回错误而不是空结果。
    pub fn execute_query_list(
        &self,
        query: &str,
        types: &[ParamType],
        values: &[ParamValue],
    ) -> DbResult<Vec<Vec<SqlValue>>> {
        self.query(query, types, values)
            .map(|result| result.rows)
            .map_err(|err| {
                warn!("SQL 查询失败: {err}");
                err
            })
    }

    /// 查询并转换为 `{status:true, data:[...]}`，任何失败都转换为错误信封。
    pub fn execute_query_json(
        &self,
        query: &str,
        types: &[ParamType],
        values: &[ParamValue],
    ) -> Envelope {
        let result = self.run_in_transaction(|conn| {
            let params = bind_params(types, values)?;
            let rows = conn.query(query, &params)?;
            result_set_to_json(&rows)
        });
        match result {
            Ok(rows) => Envelope::with_data(rows),
            Err(err) => {
                warn!("SQL 查询失败: {err}");
                error_envelope(err.message())
            }
        }
    }

    /// 更新语句：影响行数大于 0 时 status 为 true。
    pub fn execute_update_json(
        &self,
        query: &str,
        types: &[ParamType],
        values: &[ParamValue],
    ) -> Envelope {
        match self.update(query, types, values) {
            Ok(0) => error_envelope(NO_RECORDS_UPDATED),
            Ok(_) => ok_envelope(),
            Err(err) => {
                warn!("SQL 更新失败: {err}");
                error_envelope(err.message())
            }
        }
    }

    fn run_in_transaction<T, F>(&self, work: F) -> DbResult<T>
    where
        F: FnOnce(&mut dyn Connection) -> DbResult<T>,
    {
        let mut conn = self.connector.connect()?;
        conn.set_auto_commit(false)?;

        let outcome = match work(conn.as_mut()) {
            Ok(value) => conn.commit().map(|()| value),
            Err(err) => Err(err),
        };
        let outcome = match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                if let Err(rollback_err) = conn.rollback() {
                    warn!("事务回滚失败: {rollback_err}");
                }
                Err(err)
            }
        };

        // 无论提交还是回滚，释放连接前都恢复 autocommit。
        let restored = conn.set_auto_commit(true);
        debug!("连接释放，autocommit={}", conn.auto_commit());
        match (outcome, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(restore_err)) => {
                warn!("恢复 autocommit 失败: {restore_err}");
                Err(err)
            }
        }
    }
}
