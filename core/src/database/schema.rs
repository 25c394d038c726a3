use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};
use tokio_postgres::types::Type as PgType;

use crate::error::BulkWriteError;

/// Postgres truncates identifiers beyond this length (NAMEDATALEN - 1).
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// A table, schema, column or constraint name that is safe to render into SQL.
///
/// The only way to put a runtime string into statement text is through an
/// `Identifier`, and it is always rendered double-quoted with embedded quotes
/// doubled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    pub fn new(name: impl Into<String>) -> Result<Self, BulkWriteError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_IDENTIFIER_LENGTH || name.contains('\0') {
            return Err(BulkWriteError::InvalidIdentifier(name));
        }
        Ok(Identifier(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0.replace('"', "\"\""))
    }
}

impl TryFrom<String> for Identifier {
    type Error = BulkWriteError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identifier::new(value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Column types a table descriptor can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    SmallInt,
    Integer,
    BigInt,
    Double,
    Numeric,
    Text,
    Varchar,
    Bytea,
    Jsonb,
    Timestamptz,
}

impl ColumnType {
    /// Wire type used when streaming rows with binary COPY.
    pub fn to_pg_type(&self) -> PgType {
        match self {
            ColumnType::Bool => PgType::BOOL,
            ColumnType::SmallInt => PgType::INT2,
            ColumnType::Integer => PgType::INT4,
            ColumnType::BigInt => PgType::INT8,
            ColumnType::Double => PgType::FLOAT8,
            ColumnType::Numeric => PgType::NUMERIC,
            ColumnType::Text => PgType::TEXT,
            ColumnType::Varchar => PgType::VARCHAR,
            ColumnType::Bytea => PgType::BYTEA,
            ColumnType::Jsonb => PgType::JSONB,
            ColumnType::Timestamptz => PgType::TIMESTAMPTZ,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: Identifier,

    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

fn default_id_column() -> Identifier {
    Identifier("id".to_string())
}

/// Explicit descriptor of the table a writer targets. Column order here is the
/// order columns are rendered in every statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Identifier>,

    pub name: Identifier,

    /// Column matched by updates and `find_by_id`.
    #[serde(default = "default_id_column")]
    pub id_column: Identifier,

    pub columns: Vec<ColumnDefinition>,
}

impl TableSchema {
    pub fn new(name: &str) -> Result<Self, BulkWriteError> {
        Ok(TableSchema {
            schema: None,
            name: Identifier::new(name)?,
            id_column: default_id_column(),
            columns: vec![],
        })
    }

    pub fn with_schema(mut self, schema: &str) -> Result<Self, BulkWriteError> {
        self.schema = Some(Identifier::new(schema)?);
        Ok(self)
    }

    pub fn with_id_column(mut self, column: &str) -> Result<Self, BulkWriteError> {
        self.id_column = Identifier::new(column)?;
        Ok(self)
    }

    pub fn column(mut self, name: &str, column_type: ColumnType) -> Result<Self, BulkWriteError> {
        let name = Identifier::new(name)?;
        if self.columns.iter().any(|column| column.name == name) {
            return Err(self.invalid(format!("column {name} is declared twice")));
        }
        self.columns.push(ColumnDefinition { name, column_type });
        Ok(self)
    }

    /// `schema.table` as written by a human, used in logs and error messages.
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.to_string(),
        }
    }

    /// `"schema"."table"` ready to be rendered into a statement.
    pub fn quoted_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema.quoted(), self.name.quoted()),
            None => self.name.quoted(),
        }
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|column| column.name.as_str() == name)
    }

    /// Allow-list check: only declared columns ever reach statement text.
    pub fn require_column(&self, name: &str) -> Result<&ColumnDefinition, BulkWriteError> {
        self.find_column(name).ok_or_else(|| BulkWriteError::UnknownColumn {
            table: self.qualified_name(),
            column: name.to_string(),
        })
    }

    /// Checks a descriptor built by hand or loaded from YAML.
    pub fn validate(&self) -> Result<(), BulkWriteError> {
        if self.columns.is_empty() {
            return Err(self.invalid("no columns declared".to_string()));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(self.invalid(format!("column {} is declared twice", column.name)));
            }
        }

        if self.find_column(self.id_column.as_str()).is_none() {
            return Err(self.invalid(format!("id column {} is not declared", self.id_column)));
        }

        Ok(())
    }

    fn invalid(&self, reason: String) -> BulkWriteError {
        BulkWriteError::InvalidSchema { table: self.qualified_name(), reason }
    }
}
