//! In-memory `SqlExecutor` used by the unit tests.
//!
//! It reads the statements the builder renders (VALUES tuples, SET lists, the
//! shape) and applies them to plain row vectors, honouring ON CONFLICT targets,
//! unique constraints, serial columns and buffered transactions.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::database::{
    executor::{ExecutorError, SqlExecutor, SqlTransaction},
    record::{Record, ReturnedRow, WriteResult},
    schema::TableSchema,
    sql_builder::{BoundStatement, ConflictSpec, StatementShape, StatementVerb},
    value::SqlValue,
};

type Row = HashMap<String, SqlValue>;
type FailurePredicate = Box<dyn Fn(&BoundStatement) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<String, Vec<Row>>,
    serials: HashMap<String, i64>,
}

#[derive(Default)]
struct State {
    tables: Tables,
    statements: Vec<StatementShape>,
    last_sql: Option<String>,
    bulk_inserts: usize,
    begun: usize,
    commits: usize,
    rollbacks: usize,
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    /// table -> serial column
    serial_columns: HashMap<String, String>,
    /// table -> (constraint name, columns)
    unique: HashMap<String, Vec<(String, Vec<String>)>>,
}

#[derive(Default)]
pub struct MemoryExecutor {
    catalog: Arc<Catalog>,
    state: Arc<Mutex<State>>,
    fail: Arc<Mutex<Option<FailurePredicate>>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_serial(mut self, table: &str, column: &str) -> Self {
        Arc::make_mut(&mut self.catalog)
            .serial_columns
            .insert(table.to_string(), column.to_string());
        self
    }

    pub fn with_unique(mut self, table: &str, constraint: &str, columns: &[&str]) -> Self {
        Arc::make_mut(&mut self.catalog)
            .unique
            .entry(table.to_string())
            .or_default()
            .push((constraint.to_string(), columns.iter().map(|c| c.to_string()).collect()));
        self
    }

    /// Every statement matching `predicate` fails with `ExecutorError::Rejected`.
    pub fn fail_when(&self, predicate: impl Fn(&BoundStatement) -> bool + Send + Sync + 'static) {
        *self.fail.lock().unwrap() = Some(Box::new(predicate));
    }

    pub fn rows(&self, table: &str) -> Vec<ReturnedRow> {
        let state = self.state.lock().unwrap();
        let columns = self.column_order(&state.tables, table);
        state
            .tables
            .rows
            .get(table)
            .map(|rows| rows.iter().map(|row| project(row, &columns)).collect())
            .unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<StatementShape> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn last_sql(&self) -> Option<String> {
        self.state.lock().unwrap().last_sql.clone()
    }

    pub fn bulk_inserts(&self) -> usize {
        self.state.lock().unwrap().bulk_inserts
    }

    pub fn begun(&self) -> usize {
        self.state.lock().unwrap().begun
    }

    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }

    fn column_order(&self, tables: &Tables, table: &str) -> Vec<String> {
        let mut columns: Vec<String> = tables
            .rows
            .get(table)
            .into_iter()
            .flatten()
            .flat_map(|row| row.keys().cloned())
            .collect();
        columns.sort();
        columns.dedup();
        if let Some(serial) = self.catalog.serial_columns.get(table) {
            columns.retain(|column| column != serial);
            columns.insert(0, serial.clone());
        }
        columns
    }

    /// Logs the statement, then checks the failure predicate.
    fn admit(&self, state: &mut State, statement: &BoundStatement) -> Result<(), ExecutorError> {
        state.statements.push(statement.shape().clone());
        state.last_sql = Some(statement.sql().to_string());
        match self.fail.lock().unwrap().as_ref() {
            Some(predicate) if predicate(statement) => {
                Err(ExecutorError::Rejected(format!("injected failure on {}", statement.shape())))
            }
            _ => Ok(()),
        }
    }

    fn run(&self, statement: &BoundStatement) -> Result<(u64, Vec<ReturnedRow>), ExecutorError> {
        let mut state = self.state.lock().unwrap();
        self.admit(&mut state, statement)?;
        let mut tables = state.tables.clone();
        let outcome = apply(&self.catalog, &mut tables, statement)?;
        state.tables = tables;
        Ok(outcome)
    }
}

fn project(row: &Row, columns: &[String]) -> ReturnedRow {
    columns
        .iter()
        .map(|column| (column.clone(), row.get(column).cloned().unwrap_or(SqlValue::Null)))
        .collect()
}

fn param(statement: &BoundStatement, token: &str) -> Result<SqlValue, ExecutorError> {
    token
        .strip_prefix('$')
        .and_then(|n| n.parse::<usize>().ok())
        .and_then(|n| n.checked_sub(1))
        .and_then(|n| statement.params().get(n))
        .cloned()
        .ok_or_else(|| ExecutorError::Rejected(format!("bad placeholder {token}")))
}

/// Splits the VALUES section of a rendered insert into tuples of tokens.
fn value_tuples(sql: &str) -> Result<Vec<Vec<&str>>, ExecutorError> {
    let start = sql
        .find(" VALUES ")
        .map(|i| i + " VALUES ".len())
        .ok_or_else(|| ExecutorError::Rejected("insert without VALUES".to_string()))?;
    let rest = &sql[start..];
    let end = [" ON CONFLICT", " RETURNING"]
        .iter()
        .filter_map(|marker| rest.find(marker))
        .min()
        .unwrap_or(rest.len());
    let body = rest[..end].trim_start_matches('(').trim_end_matches(')');
    Ok(body.split("), (").map(|tuple| tuple.split(", ").collect()).collect())
}

fn conflict_columns(
    catalog: &Catalog,
    shape: &StatementShape,
) -> Result<Option<Vec<String>>, ExecutorError> {
    match &shape.conflict {
        None => Ok(None),
        Some(ConflictSpec::ByFieldList(fields)) => Ok(Some(fields.clone())),
        Some(ConflictSpec::ByConstraintName(name)) => catalog
            .unique
            .get(&shape.table)
            .and_then(|constraints| constraints.iter().find(|(n, _)| n == name))
            .map(|(_, columns)| Some(columns.clone()))
            .ok_or_else(|| {
                ExecutorError::Rejected(format!("constraint \"{name}\" does not exist"))
            }),
    }
}

fn collides(rows: &[Row], candidate: &Row, columns: &[String]) -> bool {
    rows.iter().any(|row| {
        columns.iter().all(|column| match (row.get(column), candidate.get(column)) {
            (Some(a), Some(b)) => !a.is_null() && a == b,
            _ => false,
        })
    })
}

fn apply(
    catalog: &Catalog,
    tables: &mut Tables,
    statement: &BoundStatement,
) -> Result<(u64, Vec<ReturnedRow>), ExecutorError> {
    let shape = statement.shape();
    let mut returned = vec![];

    match shape.verb {
        StatementVerb::Insert => {
            let conflict = conflict_columns(catalog, shape)?;
            let unique = catalog.unique.get(&shape.table).cloned().unwrap_or_default();
            let serial = catalog.serial_columns.get(&shape.table);
            let mut count = 0;

            for tuple in value_tuples(statement.sql())? {
                if tuple.len() != shape.columns.len() {
                    return Err(ExecutorError::Rejected("tuple width mismatch".to_string()));
                }
                let mut row = Row::new();
                for (column, token) in shape.columns.iter().zip(tuple) {
                    let value =
                        if token == "DEFAULT" { SqlValue::Null } else { param(statement, token)? };
                    row.insert(column.clone(), value);
                }

                let rows = tables.rows.entry(shape.table.clone()).or_default();
                if let Some(columns) = &conflict {
                    if collides(rows, &row, columns) {
                        continue;
                    }
                }
                if let Some((name, _)) =
                    unique.iter().find(|(_, columns)| collides(rows, &row, columns))
                {
                    return Err(ExecutorError::Rejected(format!(
                        "duplicate key value violates unique constraint \"{name}\""
                    )));
                }

                if let Some(serial) = serial {
                    if row.get(serial).map_or(true, SqlValue::is_null) {
                        let next = tables.serials.entry(shape.table.clone()).or_insert(0);
                        *next += 1;
                        row.insert(serial.clone(), SqlValue::BigInt(*next));
                    }
                }

                returned.push(project(&row, &shape.returning));
                tables.rows.entry(shape.table.clone()).or_default().push(row);
                count += 1;
            }

            Ok((count, returned))
        }
        StatementVerb::Update => {
            let filter = shape.filter_column.clone().unwrap_or_default();
            let params = statement.params();
            let id = params.last().cloned().unwrap_or(SqlValue::Null);
            let mut count = 0;

            for row in tables.rows.entry(shape.table.clone()).or_default() {
                if row.get(&filter) == Some(&id) {
                    for (column, value) in shape.columns.iter().zip(params) {
                        row.insert(column.clone(), value.clone());
                    }
                    returned.push(project(row, &shape.returning));
                    count += 1;
                }
            }

            Ok((count, returned))
        }
        StatementVerb::Delete => {
            let filter = shape.filter_column.clone().unwrap_or_default();
            let rows = tables.rows.entry(shape.table.clone()).or_default();
            let before = rows.len();
            rows.retain(|row| {
                !row.get(&filter).is_some_and(|value| statement.params().contains(value))
            });
            Ok(((before - rows.len()) as u64, returned))
        }
        StatementVerb::Select => {
            let filter = shape.filter_column.clone().unwrap_or_default();
            let id = statement.params().first().cloned().unwrap_or(SqlValue::Null);
            let found = tables
                .rows
                .get(&shape.table)
                .into_iter()
                .flatten()
                .find(|row| row.get(&filter) == Some(&id))
                .map(|row| project(row, &shape.columns));
            returned.extend(found);
            Ok((returned.len() as u64, returned))
        }
    }
}

#[async_trait]
impl SqlExecutor for MemoryExecutor {
    async fn query(&self, statement: &BoundStatement) -> Result<Vec<ReturnedRow>, ExecutorError> {
        self.run(statement).map(|(_, rows)| rows)
    }

    async fn execute(&self, statement: &BoundStatement) -> Result<u64, ExecutorError> {
        self.run(statement).map(|(count, _)| count)
    }

    async fn begin(&self) -> Result<Box<dyn SqlTransaction>, ExecutorError> {
        let mut state = self.state.lock().unwrap();
        state.begun += 1;
        Ok(Box::new(MemoryTransaction {
            executor: MemoryExecutor {
                catalog: self.catalog.clone(),
                state: self.state.clone(),
                fail: self.fail.clone(),
            },
            working: Mutex::new(state.tables.clone()),
        }))
    }

    async fn bulk_insert(
        &self,
        _table: &TableSchema,
        _records: &[Record],
        statement: &BoundStatement,
    ) -> Result<WriteResult, ExecutorError> {
        self.state.lock().unwrap().bulk_inserts += 1;
        let (count, rows) = self.run(statement)?;
        if statement.returns_rows() {
            Ok(WriteResult::Rows(rows))
        } else {
            Ok(WriteResult::Affected(count))
        }
    }
}

/// Applies statements to a private copy of the tables, published on commit.
struct MemoryTransaction {
    executor: MemoryExecutor,
    working: Mutex<Tables>,
}

impl MemoryTransaction {
    fn run(&self, statement: &BoundStatement) -> Result<(u64, Vec<ReturnedRow>), ExecutorError> {
        {
            let mut state = self.executor.state.lock().unwrap();
            self.executor.admit(&mut state, statement)?;
        }
        let mut working = self.working.lock().unwrap();
        apply(&self.executor.catalog, &mut working, statement)
    }
}

#[async_trait]
impl SqlTransaction for MemoryTransaction {
    async fn query(&self, statement: &BoundStatement) -> Result<Vec<ReturnedRow>, ExecutorError> {
        self.run(statement).map(|(_, rows)| rows)
    }

    async fn execute(&self, statement: &BoundStatement) -> Result<u64, ExecutorError> {
        self.run(statement).map(|(count, _)| count)
    }

    async fn commit(self: Box<Self>) -> Result<(), ExecutorError> {
        let working = self.working.into_inner().unwrap();
        let mut state = self.executor.state.lock().unwrap();
        state.tables = working;
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ExecutorError> {
        self.executor.state.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}
