use std::collections::HashMap;

use crate::{
    database::value::{FromSqlValue, SqlValue},
    error::BulkWriteError,
};

/// One row to write, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: HashMap<String, SqlValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column)
    }

    /// The value for `column` unless it is absent or NULL.
    pub fn defined(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column).filter(|value| !value.is_null())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<SqlValue>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Record {
            values: iter.into_iter().map(|(column, value)| (column.into(), value.into())).collect(),
        }
    }
}

/// A row echoed back by the database, columns in the order the server sent them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReturnedRow {
    columns: Vec<(String, SqlValue)>,
}

impl ReturnedRow {
    pub fn push(&mut self, column: impl Into<String>, value: SqlValue) {
        self.columns.push((column.into(), value));
    }

    pub fn value(&self, column: &str) -> Option<&SqlValue> {
        self.columns.iter().find(|(name, _)| name == column).map(|(_, value)| value)
    }

    pub fn get<T: FromSqlValue>(&self, column: &str) -> Result<T, BulkWriteError> {
        let decoded = match self.value(column) {
            None | Some(SqlValue::Null) => T::from_null(),
            Some(value) => T::from_sql_value(value),
        };

        decoded.ok_or_else(|| match self.value(column) {
            None => BulkWriteError::RowDecode(format!("column {column} is not in the row")),
            Some(value) => BulkWriteError::RowDecode(format!(
                "column {column} holds a {} which can not be converted",
                value.raw_name()
            )),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, SqlValue)> for ReturnedRow {
    fn from_iter<I: IntoIterator<Item = (K, SqlValue)>>(iter: I) -> Self {
        ReturnedRow {
            columns: iter.into_iter().map(|(name, value)| (name.into(), value)).collect(),
        }
    }
}

/// Outcome of a write: the returned rows when returning columns were requested,
/// otherwise the affected row count reported by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteResult {
    Rows(Vec<ReturnedRow>),
    Affected(u64),
}

impl WriteResult {
    pub(crate) fn empty(returning: bool) -> Self {
        if returning {
            WriteResult::Rows(vec![])
        } else {
            WriteResult::Affected(0)
        }
    }

    /// Appends another chunk's outcome, keeping chunk order.
    pub fn extend(&mut self, other: WriteResult) {
        match (self, other) {
            (WriteResult::Rows(rows), WriteResult::Rows(more)) => rows.extend(more),
            (WriteResult::Affected(count), WriteResult::Affected(more)) => *count += more,
            (WriteResult::Affected(count), WriteResult::Rows(more)) => *count += more.len() as u64,
            // a row list can not absorb a bare count, the rows stay authoritative
            (WriteResult::Rows(_), WriteResult::Affected(_)) => {}
        }
    }

    pub fn rows(&self) -> Option<&[ReturnedRow]> {
        match self {
            WriteResult::Rows(rows) => Some(rows),
            WriteResult::Affected(_) => None,
        }
    }

    pub fn into_rows(self) -> Option<Vec<ReturnedRow>> {
        match self {
            WriteResult::Rows(rows) => Some(rows),
            WriteResult::Affected(_) => None,
        }
    }

    pub fn affected(&self) -> u64 {
        match self {
            WriteResult::Rows(rows) => rows.len() as u64,
            WriteResult::Affected(count) => *count,
        }
    }
}
