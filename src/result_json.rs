// 结果集转 JSON：按列声明类型选择读取方式与输出的 JSON 类型。
//
// 有两处有损转换与旧版行为保持一致：整数列统一经 32 位读取（BIGINT 超出范围会回绕），
// 二进制列按 UTF-8 有损解码为字符串。
use crate::envelope::JsonRow;
use crate::storage::{
    format_timestamp, ColumnMeta, DbError, DbResult, ResultSet, SqlType, SqlValue,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// 逐行转换，保持行顺序与列顺序；空值输出为显式的 null。
pub fn result_set_to_json(result: &ResultSet) -> DbResult<Vec<JsonRow>> {
    let mut rows = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let mut record = JsonRow::new();
        for (column, value) in result.columns.iter().zip(row.iter()) {
            // 同名列后者覆盖前者。
            record.insert(column.name.clone(), column_to_json(column, value)?);
        }
        rows.push(record);
    }
    Ok(rows)
}

pub fn column_to_json(column: &ColumnMeta, value: &SqlValue) -> DbResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let converted = match &column.sql_type {
        SqlType::BigInt | SqlType::Integer | SqlType::SmallInt | SqlType::TinyInt => {
            Value::from(read_int(column, value)?)
        }
        SqlType::Double | SqlType::Float => Value::from(read_double(column, value)?),
        SqlType::Boolean => Value::Bool(read_bool(column, value)?),
        SqlType::Char | SqlType::VarChar | SqlType::NChar | SqlType::NVarChar => {
            Value::String(value.to_string())
        }
        SqlType::Date => Value::String(read_date(column, value)?.format("%Y-%m-%d").to_string()),
        SqlType::Timestamp => Value::String(format_timestamp(&read_timestamp(column, value)?)),
        SqlType::Binary => Value::String(read_bytes_as_text(column, value)?),
        SqlType::Other(_) => Value::String(value.to_string()),
    };
    Ok(converted)
}

fn read_int(column: &ColumnMeta, value: &SqlValue) -> DbResult<i32> {
    match value {
        SqlValue::Integer(number) => Ok(*number as i32),
        SqlValue::Real(number) => Ok(*number as i32),
        SqlValue::Boolean(flag) => Ok(i32::from(*flag)),
        SqlValue::Text(text) => {
            let trimmed = text.trim();
            if let Ok(number) = trimmed.parse::<i64>() {
                return Ok(number as i32);
            }
            trimmed
                .parse::<f64>()
                .map(|number| number as i32)
                .map_err(|_| unreadable(column, value, "integer"))
        }
        _ => Err(unreadable(column, value, "integer")),
    }
}

fn read_double(column: &ColumnMeta, value: &SqlValue) -> DbResult<f64> {
    match value {
        SqlValue::Real(number) => Ok(*number),
        SqlValue::Integer(number) => Ok(*number as f64),
        SqlValue::Boolean(flag) => Ok(if *flag { 1.0 } else { 0.0 }),
        SqlValue::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| unreadable(column, value, "double")),
        _ => Err(unreadable(column, value, "double")),
    }
}

fn read_bool(column: &ColumnMeta, value: &SqlValue) -> DbResult<bool> {
    match value {
        SqlValue::Boolean(flag) => Ok(*flag),
        SqlValue::Integer(number) => Ok(*number != 0),
        SqlValue::Real(number) => Ok(*number != 0.0),
        SqlValue::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(unreadable(column, value, "boolean")),
        },
        _ => Err(unreadable(column, value, "boolean")),
    }
}

fn read_date(column: &ColumnMeta, value: &SqlValue) -> DbResult<NaiveDate> {
    match value {
        SqlValue::Date(date) => Ok(*date),
        SqlValue::Timestamp(timestamp) => Ok(timestamp.date()),
        SqlValue::Integer(millis) => DateTime::from_timestamp_millis(*millis)
            .map(|timestamp| timestamp.date_naive())
            .ok_or_else(|| unreadable(column, value, "date")),
        SqlValue::Text(text) => {
            let trimmed = text.trim();
            let head = trimmed.get(..10).unwrap_or(trimmed);
            NaiveDate::parse_from_str(head, "%Y-%m-%d")
                .map_err(|_| unreadable(column, value, "date"))
        }
        _ => Err(unreadable(column, value, "date")),
    }
}

fn read_timestamp(column: &ColumnMeta, value: &SqlValue) -> DbResult<NaiveDateTime> {
    match value {
        SqlValue::Timestamp(timestamp) => Ok(*timestamp),
        SqlValue::Date(date) => date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| unreadable(column, value, "timestamp")),
        SqlValue::Integer(millis) => DateTime::from_timestamp_millis(*millis)
            .map(|timestamp| timestamp.naive_utc())
            .ok_or_else(|| unreadable(column, value, "timestamp")),
        SqlValue::Text(text) => {
            let trimmed = text.trim();
            TIMESTAMP_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
                .or_else(|| {
                    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                        .ok()
                        .and_then(|date| date.and_hms_opt(0, 0, 0))
                })
                .ok_or_else(|| unreadable(column, value, "timestamp"))
        }
        _ => Err(unreadable(column, value, "timestamp")),
    }
}

fn read_bytes_as_text(column: &ColumnMeta, value: &SqlValue) -> DbResult<String> {
    match value {
        SqlValue::Blob(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        SqlValue::Text(text) => Ok(text.clone()),
        _ => Err(unreadable(column, value, "bytes")),
    }
}

fn unreadable(column: &ColumnMeta, value: &SqlValue, target: &str) -> DbError {
    let kind = match value {
        SqlValue::Null => "null",
        SqlValue::Integer(_) => "integer",
        SqlValue::Real(_) => "real",
        SqlValue::Boolean(_) => "boolean",
        SqlValue::Text(_) => "text",
        SqlValue::Blob(_) => "blob",
        SqlValue::Date(_) => "date",
        SqlValue::Timestamp(_) => "timestamp",
    };
    DbError::Statement(format!(
        "column '{}': cannot read {kind} value as {target}",
        column.name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn single_column(sql_type: SqlType, value: SqlValue) -> Value {
        let column = ColumnMeta::new("col", sql_type);
        column_to_json(&column, &value).expect("convert column")
    }

    #[test]
    fn rows_keep_order_and_count() {
        let mut result = ResultSet::new(vec![
            ColumnMeta::new("ID", SqlType::VarChar),
            ColumnMeta::new("salary", SqlType::Double),
        ]);
        for (id, salary) in [("10101", 65000.0), ("12121", 90000.0), ("15151", 40000.0)] {
            result.push_row(vec![SqlValue::Text(id.to_string()), SqlValue::Real(salary)]);
        }
        let rows = result_set_to_json(&result).expect("convert");
        assert_eq!(rows.len(), 3);
        let ids = rows.iter().map(|row| row["ID"].clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec![json!("10101"), json!("12121"), json!("15151")]);
        assert_eq!(rows[1]["salary"], json!(90000.0));
    }

    #[test]
    fn null_values_are_explicit() {
        let mut result = ResultSet::new(vec![
            ColumnMeta::new("ID", SqlType::VarChar),
            ColumnMeta::new("dept_name", SqlType::VarChar),
        ]);
        result.push_row(vec![SqlValue::Text("98345".to_string()), SqlValue::Null]);
        let rows = result_set_to_json(&result).expect("convert");
        assert!(rows[0].contains_key("dept_name"));
        assert_eq!(rows[0]["dept_name"], Value::Null);
    }

    #[test]
    fn keys_follow_column_order() {
        let mut result = ResultSet::new(vec![
            ColumnMeta::new("zeta", SqlType::Integer),
            ColumnMeta::new("alpha", SqlType::Integer),
        ]);
        result.push_row(vec![SqlValue::Integer(1), SqlValue::Integer(2)]);
        let rows = result_set_to_json(&result).expect("convert");
        let keys = rows[0].keys().cloned().collect::<Vec<_>>();
        assert_eq!(keys, vec!["zeta".to_string(), "alpha".to_string()]);
    }

    #[test]
    fn bigint_values_wrap_through_32_bit_accessor() {
        // 2^31 超出 i32 范围，按旧版行为回绕为 -2^31。修正这里会改变对外输出。
        assert_eq!(
            single_column(SqlType::BigInt, SqlValue::Integer(1 << 31)),
            json!(-2147483648)
        );
        assert_eq!(
            single_column(SqlType::BigInt, SqlValue::Integer(42)),
            json!(42)
        );
        assert_eq!(
            single_column(SqlType::SmallInt, SqlValue::Text(" 7 ".to_string())),
            json!(7)
        );
    }

    #[test]
    fn binary_columns_decode_lossily() {
        assert_eq!(
            single_column(SqlType::Binary, SqlValue::Blob(vec![b'h', b'i', 0xff])),
            json!("hi\u{fffd}")
        );
    }

    #[test]
    fn booleans_and_floats_use_native_json_types() {
        assert_eq!(
            single_column(SqlType::Boolean, SqlValue::Integer(1)),
            json!(true)
        );
        assert_eq!(
            single_column(SqlType::Boolean, SqlValue::Boolean(false)),
            json!(false)
        );
        assert_eq!(single_column(SqlType::Float, SqlValue::Real(2.5)), json!(2.5));
        assert_eq!(single_column(SqlType::Double, SqlValue::Integer(3)), json!(3.0));
    }

    #[test]
    fn dates_and_timestamps_render_as_text() {
        assert_eq!(
            single_column(SqlType::Date, SqlValue::Text("2009-09-01".to_string())),
            json!("2009-09-01")
        );
        assert_eq!(
            single_column(
                SqlType::Timestamp,
                SqlValue::Text("2009-09-01 10:30:00".to_string())
            ),
            json!("2009-09-01 10:30:00.0")
        );
        assert_eq!(
            single_column(SqlType::Timestamp, SqlValue::Integer(0)),
            json!("1970-01-01 00:00:00.0")
        );
    }

    #[test]
    fn unknown_types_fall_back_to_text() {
        assert_eq!(
            single_column(SqlType::Other("NUMERIC".to_string()), SqlValue::Real(3.5)),
            json!("3.5")
        );
        assert_eq!(
            single_column(SqlType::VarChar, SqlValue::Integer(12)),
            json!("12")
        );
    }

    #[test]
    fn unreadable_values_are_statement_errors() {
        let column = ColumnMeta::new("credits", SqlType::Integer);
        let err = column_to_json(&column, &SqlValue::Text("four".to_string()))
            .expect_err("not a number");
        assert!(matches!(err, DbError::Statement(_)));
        assert!(err.message().contains("credits"));
    }
}
