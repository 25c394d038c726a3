use bytes::BytesMut;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type as PgType};

/// A single scalar that can be bound as a Postgres statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Numeric(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    pub fn raw_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "Null",
            SqlValue::Bool(_) => "Bool",
            SqlValue::SmallInt(_) => "SmallInt",
            SqlValue::Int(_) => "Int",
            SqlValue::BigInt(_) => "BigInt",
            SqlValue::Double(_) => "Double",
            SqlValue::Numeric(_) => "Numeric",
            SqlValue::Text(_) => "Text",
            SqlValue::Bytes(_) => "Bytes",
            SqlValue::Json(_) => "Json",
            SqlValue::Timestamp(_) => "Timestamp",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// Integers are written at the width the server asked for, so an `Int` bound to a
/// BIGINT column does not fail with a wire size mismatch.
fn integer_to_sql(
    value: i64,
    ty: &PgType,
    out: &mut BytesMut,
) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
    match *ty {
        PgType::INT2 => i16::try_from(value)?.to_sql(ty, out),
        PgType::INT4 => i32::try_from(value)?.to_sql(ty, out),
        PgType::NUMERIC => Decimal::from(value).to_sql(ty, out),
        PgType::FLOAT8 => (value as f64).to_sql(ty, out),
        _ => value.to_sql(ty, out),
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &PgType,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(value) => value.to_sql(ty, out),
            SqlValue::SmallInt(value) => integer_to_sql(i64::from(*value), ty, out),
            SqlValue::Int(value) => integer_to_sql(i64::from(*value), ty, out),
            SqlValue::BigInt(value) => integer_to_sql(*value, ty, out),
            SqlValue::Double(value) => match *ty {
                PgType::NUMERIC => Decimal::try_from(*value)?.to_sql(ty, out),
                _ => value.to_sql(ty, out),
            },
            SqlValue::Numeric(value) => value.to_sql(ty, out),
            SqlValue::Text(value) => value.to_sql(ty, out),
            SqlValue::Bytes(value) => value.to_sql(ty, out),
            SqlValue::Json(value) => value.to_sql(ty, out),
            SqlValue::Timestamp(value) => value.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &PgType) -> bool {
        true
    }

    to_sql_checked!();
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<i16> for SqlValue {
    fn from(value: i16) -> Self {
        SqlValue::SmallInt(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::BigInt(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Double(value)
    }
}

impl From<Decimal> for SqlValue {
    fn from(value: Decimal) -> Self {
        SqlValue::Numeric(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        SqlValue::Bytes(value)
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        SqlValue::Json(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Conversion out of a decoded column value.
pub trait FromSqlValue: Sized {
    fn from_sql_value(value: &SqlValue) -> Option<Self>;

    /// Value used when the column is NULL or missing. Only `Option<T>` has one.
    fn from_null() -> Option<Self> {
        None
    }
}

impl FromSqlValue for bool {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl FromSqlValue for i64 {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::SmallInt(value) => Some(i64::from(*value)),
            SqlValue::Int(value) => Some(i64::from(*value)),
            SqlValue::BigInt(value) => Some(*value),
            _ => None,
        }
    }
}

impl FromSqlValue for i32 {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        i64::from_sql_value(value).and_then(|value| i32::try_from(value).ok())
    }
}

impl FromSqlValue for f64 {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Double(value) => Some(*value),
            _ => None,
        }
    }
}

impl FromSqlValue for Decimal {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Numeric(value) => Some(*value),
            _ => None,
        }
    }
}

impl FromSqlValue for String {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Text(value) => Some(value.clone()),
            _ => None,
        }
    }
}

impl FromSqlValue for Vec<u8> {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Bytes(value) => Some(value.clone()),
            _ => None,
        }
    }
}

impl FromSqlValue for Value {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Json(value) => Some(value.clone()),
            _ => None,
        }
    }
}

impl FromSqlValue for DateTime<Utc> {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Timestamp(value) => Some(*value),
            _ => None,
        }
    }
}

impl<T: FromSqlValue> FromSqlValue for Option<T> {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        if value.is_null() {
            return Some(None);
        }
        T::from_sql_value(value).map(Some)
    }

    fn from_null() -> Option<Self> {
        Some(None)
    }
}
