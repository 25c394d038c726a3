//! Parametrized statement rendering for the raw write paths.
//!
//! Statement text is assembled by [`StatementBuilder`], which only accepts
//! static SQL fragments, [`Identifier`]s and bound values. Values always travel
//! as positional `$n` parameters and never become part of the SQL text.

use std::fmt;

use crate::{
    config::Returning,
    database::{
        record::Record,
        schema::{Identifier, TableSchema},
        value::SqlValue,
    },
    error::BulkWriteError,
};

/// Which uniqueness rule makes an insert skip a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictSpec {
    ByConstraintName(String),
    ByFieldList(Vec<String>),
}

impl fmt::Display for ConflictSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictSpec::ByConstraintName(name) => write!(f, "ON CONSTRAINT {}", name),
            ConflictSpec::ByFieldList(fields) => write!(f, "({})", fields.join(", ")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementVerb {
    Insert,
    Update,
    Delete,
    Select,
}

impl fmt::Display for StatementVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatementVerb::Insert => write!(f, "INSERT"),
            StatementVerb::Update => write!(f, "UPDATE"),
            StatementVerb::Delete => write!(f, "DELETE"),
            StatementVerb::Select => write!(f, "SELECT"),
        }
    }
}

/// Describes a statement without any of its values, safe to log and to carry
/// in errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementShape {
    pub verb: StatementVerb,
    pub table: String,
    /// Inserted, updated or selected columns in render order.
    pub columns: Vec<String>,
    /// Column compared in the WHERE clause, if any.
    pub filter_column: Option<String>,
    /// Number of VALUES tuples for inserts, compared values for deletes, 1 otherwise.
    pub rows: usize,
    pub conflict: Option<ConflictSpec>,
    pub returning: Vec<String>,
}

impl StatementShape {
    fn new(verb: StatementVerb, table: &TableSchema) -> Self {
        StatementShape {
            verb,
            table: table.qualified_name(),
            columns: vec![],
            filter_column: None,
            rows: 1,
            conflict: None,
            returning: vec![],
        }
    }
}

impl fmt::Display for StatementShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({}) x{}", self.verb, self.table, self.columns.join(", "), self.rows)?;
        if let Some(filter) = &self.filter_column {
            write!(f, " WHERE {}", filter)?;
        }
        if let Some(conflict) = &self.conflict {
            write!(f, " ON CONFLICT {} DO NOTHING", conflict)?;
        }
        if !self.returning.is_empty() {
            write!(f, " RETURNING {}", self.returning.join(", "))?;
        }
        Ok(())
    }
}

/// SQL text, its positional bind values and a value free description.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    sql: String,
    params: Vec<SqlValue>,
    shape: StatementShape,
}

impl BoundStatement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn shape(&self) -> &StatementShape {
        &self.shape
    }

    pub fn returns_rows(&self) -> bool {
        !self.shape.returning.is_empty() || self.shape.verb == StatementVerb::Select
    }
}

#[derive(Debug, Default)]
pub struct StatementBuilder {
    sql: String,
    params: Vec<SqlValue>,
}

impl StatementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Static SQL only, runtime strings have to go through `identifier` or `param`.
    pub fn keyword(&mut self, sql: &'static str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn identifier(&mut self, identifier: &Identifier) -> &mut Self {
        self.sql.push_str(&identifier.quoted());
        self
    }

    pub fn table(&mut self, table: &TableSchema) -> &mut Self {
        self.sql.push_str(&table.quoted_name());
        self
    }

    /// `("a", "b", ...)`
    pub fn identifier_list(&mut self, identifiers: &[&Identifier]) -> &mut Self {
        self.sql.push('(');
        for (i, identifier) in identifiers.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.identifier(identifier);
        }
        self.sql.push(')');
        self
    }

    pub fn param(&mut self, value: SqlValue) -> &mut Self {
        self.params.push(value);
        self.sql.push('$');
        self.sql.push_str(&self.params.len().to_string());
        self
    }

    pub fn finish(self, shape: StatementShape) -> BoundStatement {
        BoundStatement { sql: self.sql, params: self.params, shape }
    }

    fn into_parts(self) -> (String, Vec<SqlValue>) {
        (self.sql, self.params)
    }
}

/// Every column a record carries must be declared on the table.
fn check_record_columns(table: &TableSchema, record: &Record) -> Result<(), BulkWriteError> {
    for column in record.columns() {
        table.require_column(column)?;
    }
    Ok(())
}

/// Columns at least one record of the batch defines, in table order.
pub fn batch_columns<'a>(
    table: &'a TableSchema,
    records: &[Record],
) -> Result<Vec<&'a Identifier>, BulkWriteError> {
    for record in records {
        check_record_columns(table, record)?;
    }

    let columns: Vec<&Identifier> = table
        .columns
        .iter()
        .map(|column| &column.name)
        .filter(|name| records.iter().any(|record| record.defined(name.as_str()).is_some()))
        .collect();

    if columns.is_empty() {
        return Err(BulkWriteError::EmptyColumnSet);
    }

    Ok(columns)
}

/// Renders `("col1", "col2", ...)`.
pub fn build_field_list(columns: &[&Identifier]) -> Result<String, BulkWriteError> {
    if columns.is_empty() {
        return Err(BulkWriteError::EmptyColumnSet);
    }

    let mut builder = StatementBuilder::new();
    builder.identifier_list(columns);
    Ok(builder.into_parts().0)
}

fn push_values(builder: &mut StatementBuilder, records: &[Record], columns: &[&Identifier]) {
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            builder.keyword(", ");
        }
        builder.keyword("(");
        for (j, column) in columns.iter().enumerate() {
            if j > 0 {
                builder.keyword(", ");
            }
            match record.defined(column.as_str()) {
                Some(value) => builder.param(value.clone()),
                None => builder.keyword("DEFAULT"),
            };
        }
        builder.keyword(")");
    }
}

/// Renders the VALUES tuples for `records` and the values they bind.
///
/// A column a record leaves undefined is rendered as `DEFAULT` and binds
/// nothing, so the placeholder count always equals the bind list length.
pub fn build_values_clause(
    records: &[Record],
    columns: &[&Identifier],
) -> Result<(String, Vec<SqlValue>), BulkWriteError> {
    if columns.is_empty() {
        return Err(BulkWriteError::EmptyColumnSet);
    }

    let mut builder = StatementBuilder::new();
    push_values(&mut builder, records, columns);
    Ok(builder.into_parts())
}

enum ConflictTarget<'a> {
    Constraint(Identifier),
    Fields(Vec<&'a Identifier>),
}

fn resolve_conflict_target<'a>(
    table: &'a TableSchema,
    spec: &ConflictSpec,
) -> Result<ConflictTarget<'a>, BulkWriteError> {
    match spec {
        ConflictSpec::ByConstraintName(name) => Identifier::new(name.as_str())
            .map(ConflictTarget::Constraint)
            .map_err(|_| {
                BulkWriteError::ConflictSpecInvalid(format!("bad constraint name {name:?}"))
            }),
        ConflictSpec::ByFieldList(fields) => {
            if fields.is_empty() {
                return Err(BulkWriteError::ConflictSpecInvalid("empty field list".to_string()));
            }
            fields
                .iter()
                .map(|field| {
                    table.find_column(field).map(|column| &column.name).ok_or_else(|| {
                        BulkWriteError::ConflictSpecInvalid(format!(
                            "field {field} does not exist on table {}",
                            table.qualified_name()
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(ConflictTarget::Fields)
        }
    }
}

fn push_conflict_target(builder: &mut StatementBuilder, target: &ConflictTarget) {
    match target {
        ConflictTarget::Constraint(name) => {
            builder.keyword("ON CONSTRAINT ").identifier(name);
        }
        ConflictTarget::Fields(fields) => {
            builder.identifier_list(fields);
        }
    }
}

/// Renders the conflict target alone: `("email")` or `ON CONSTRAINT "users_email_key"`.
pub fn build_conflict_target(
    table: &TableSchema,
    spec: &ConflictSpec,
) -> Result<String, BulkWriteError> {
    let target = resolve_conflict_target(table, spec)?;
    let mut builder = StatementBuilder::new();
    push_conflict_target(&mut builder, &target);
    Ok(builder.into_parts().0)
}

/// Renders `ON CONFLICT <target> DO NOTHING`. Exactly one target form is emitted.
pub fn build_conflict_clause(
    table: &TableSchema,
    spec: &ConflictSpec,
) -> Result<String, BulkWriteError> {
    let target = resolve_conflict_target(table, spec)?;
    let mut builder = StatementBuilder::new();
    builder.keyword("ON CONFLICT ");
    push_conflict_target(&mut builder, &target);
    builder.keyword(" DO NOTHING");
    Ok(builder.into_parts().0)
}

fn resolve_returning<'a>(
    table: &'a TableSchema,
    returning: &Returning,
) -> Result<Vec<&'a Identifier>, BulkWriteError> {
    returning
        .column_names()
        .into_iter()
        .map(|name| table.require_column(name).map(|column| &column.name))
        .collect()
}

fn push_returning(builder: &mut StatementBuilder, columns: &[&Identifier]) {
    if columns.is_empty() {
        return;
    }
    builder.keyword(" RETURNING ");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            builder.keyword(", ");
        }
        builder.identifier(column);
    }
}

fn names(columns: &[&Identifier]) -> Vec<String> {
    columns.iter().map(|column| column.to_string()).collect()
}

/// `INSERT INTO t (cols) VALUES (...), (...) [ON CONFLICT ... DO NOTHING] [RETURNING ...]`
pub fn build_insert(
    table: &TableSchema,
    records: &[Record],
    conflict: Option<&ConflictSpec>,
    returning: &Returning,
) -> Result<BoundStatement, BulkWriteError> {
    let columns = batch_columns(table, records)?;
    let target = conflict.map(|spec| resolve_conflict_target(table, spec)).transpose()?;
    let returning_columns = resolve_returning(table, returning)?;

    let mut builder = StatementBuilder::new();
    builder.keyword("INSERT INTO ").table(table).keyword(" ").identifier_list(&columns);
    builder.keyword(" VALUES ");
    push_values(&mut builder, records, &columns);

    if let Some(target) = &target {
        builder.keyword(" ON CONFLICT ");
        push_conflict_target(&mut builder, target);
        builder.keyword(" DO NOTHING");
    }
    push_returning(&mut builder, &returning_columns);

    let mut shape = StatementShape::new(StatementVerb::Insert, table);
    shape.columns = names(&columns);
    shape.rows = records.len();
    shape.conflict = conflict.cloned();
    shape.returning = names(&returning_columns);

    Ok(builder.finish(shape))
}

/// `UPDATE t SET "a" = $1, ... WHERE "id" = $n [RETURNING ...]`
///
/// Every column the record carries is set, NULL included, except the id column
/// which is only used for matching.
pub fn build_update(
    table: &TableSchema,
    record: &Record,
    record_index: usize,
    returning: &Returning,
) -> Result<BoundStatement, BulkWriteError> {
    check_record_columns(table, record)?;

    let id_column = &table.id_column;
    let id = record.defined(id_column.as_str()).cloned().ok_or_else(|| {
        BulkWriteError::MissingIdentifierValue { column: id_column.to_string(), record_index }
    })?;

    let set_columns: Vec<&Identifier> = table
        .columns
        .iter()
        .map(|column| &column.name)
        .filter(|name| *name != id_column && record.get(name.as_str()).is_some())
        .collect();

    if set_columns.is_empty() {
        return Err(BulkWriteError::EmptyColumnSet);
    }
    let returning_columns = resolve_returning(table, returning)?;

    let mut builder = StatementBuilder::new();
    builder.keyword("UPDATE ").table(table).keyword(" SET ");
    for (i, column) in set_columns.iter().enumerate() {
        if i > 0 {
            builder.keyword(", ");
        }
        let value = record.get(column.as_str()).cloned().unwrap_or(SqlValue::Null);
        builder.identifier(column).keyword(" = ").param(value);
    }
    builder.keyword(" WHERE ").identifier(id_column).keyword(" = ").param(id);
    push_returning(&mut builder, &returning_columns);

    let mut shape = StatementShape::new(StatementVerb::Update, table);
    shape.columns = names(&set_columns);
    shape.filter_column = Some(id_column.to_string());
    shape.returning = names(&returning_columns);

    Ok(builder.finish(shape))
}

/// `DELETE FROM t WHERE "col" IN ($1, $2, ...)`
pub fn build_delete(
    table: &TableSchema,
    column: &str,
    values: Vec<SqlValue>,
) -> Result<BoundStatement, BulkWriteError> {
    if values.is_empty() {
        return Err(BulkWriteError::EmptyInput);
    }
    let column = &table.require_column(column)?.name;

    let mut shape = StatementShape::new(StatementVerb::Delete, table);
    shape.filter_column = Some(column.to_string());
    shape.rows = values.len();

    let mut builder = StatementBuilder::new();
    builder.keyword("DELETE FROM ").table(table).keyword(" WHERE ").identifier(column);
    builder.keyword(" IN (");
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            builder.keyword(", ");
        }
        builder.param(value);
    }
    builder.keyword(")");

    Ok(builder.finish(shape))
}

/// Selects every declared column of the row whose id column equals `id`.
pub fn build_find_by_id(
    table: &TableSchema,
    id: SqlValue,
) -> Result<BoundStatement, BulkWriteError> {
    let columns: Vec<&Identifier> = table.columns.iter().map(|column| &column.name).collect();
    if columns.is_empty() {
        return Err(BulkWriteError::EmptyColumnSet);
    }

    let mut builder = StatementBuilder::new();
    builder.keyword("SELECT ");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            builder.keyword(", ");
        }
        builder.identifier(column);
    }
    builder.keyword(" FROM ").table(table).keyword(" WHERE ").identifier(&table.id_column);
    builder.keyword(" = ").param(id).keyword(" LIMIT 1");

    let mut shape = StatementShape::new(StatementVerb::Select, table);
    shape.columns = names(&columns);
    shape.filter_column = Some(table.id_column.to_string());

    Ok(builder.finish(shape))
}

/// `COPY t ("a", "b") FROM STDIN WITH (FORMAT binary)`
pub fn build_copy_in(table: &TableSchema, columns: &[&Identifier]) -> String {
    let mut builder = StatementBuilder::new();
    builder.keyword("COPY ").table(table).keyword(" ").identifier_list(columns);
    builder.keyword(" FROM STDIN WITH (FORMAT binary)");
    builder.into_parts().0
}
