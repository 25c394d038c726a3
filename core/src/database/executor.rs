use async_trait::async_trait;
use bb8::RunError;

use crate::database::{
    record::{Record, ReturnedRow, WriteResult},
    schema::TableSchema,
    sql_builder::BoundStatement,
};

#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error("PgError {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Connection pool error: {0}")]
    ConnectionPool(#[from] RunError<tokio_postgres::Error>),

    #[error("Unsupported column type {0} in returned row")]
    UnsupportedColumnType(String),

    #[error("Transaction has already been committed or rolled back")]
    TransactionFinished,

    #[error("{0}")]
    Rejected(String),
}

/// The database capability every writer is handed. Nothing in this crate keeps
/// a global connection, callers inject an implementation.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn query(&self, statement: &BoundStatement) -> Result<Vec<ReturnedRow>, ExecutorError>;

    async fn execute(&self, statement: &BoundStatement) -> Result<u64, ExecutorError>;

    async fn begin(&self) -> Result<Box<dyn SqlTransaction>, ExecutorError>;

    /// Vendor fast path for one chunk. `statement` is the multi-row insert the
    /// writer rendered for `records`; implementations may run it as is or load
    /// the same rows some faster way when nothing has to be returned.
    async fn bulk_insert(
        &self,
        _table: &TableSchema,
        _records: &[Record],
        statement: &BoundStatement,
    ) -> Result<WriteResult, ExecutorError> {
        self.write(statement).await
    }

    async fn write(&self, statement: &BoundStatement) -> Result<WriteResult, ExecutorError> {
        if statement.returns_rows() {
            Ok(WriteResult::Rows(self.query(statement).await?))
        } else {
            Ok(WriteResult::Affected(self.execute(statement).await?))
        }
    }
}

/// An open transaction. `commit` and `rollback` consume it, so a finished
/// transaction can not be used again.
#[async_trait]
pub trait SqlTransaction: Send + Sync {
    async fn query(&self, statement: &BoundStatement) -> Result<Vec<ReturnedRow>, ExecutorError>;

    async fn execute(&self, statement: &BoundStatement) -> Result<u64, ExecutorError>;

    async fn commit(self: Box<Self>) -> Result<(), ExecutorError>;

    async fn rollback(self: Box<Self>) -> Result<(), ExecutorError>;

    async fn write(&self, statement: &BoundStatement) -> Result<WriteResult, ExecutorError> {
        if statement.returns_rows() {
            Ok(WriteResult::Rows(self.query(statement).await?))
        } else {
            Ok(WriteResult::Affected(self.execute(statement).await?))
        }
    }
}

/// Where a chunk loop sends its statements: the pool, or a caller owned transaction.
#[derive(Clone, Copy)]
pub(crate) enum WriteTarget<'a> {
    Executor(&'a dyn SqlExecutor),
    Transaction(&'a dyn SqlTransaction),
}

impl WriteTarget<'_> {
    pub(crate) async fn write(
        &self,
        statement: &BoundStatement,
    ) -> Result<WriteResult, ExecutorError> {
        match self {
            WriteTarget::Executor(executor) => executor.write(statement).await,
            WriteTarget::Transaction(transaction) => transaction.write(statement).await,
        }
    }

    /// Inside a transaction the fast path is skipped, the chunk has to be part
    /// of the caller's unit of work.
    pub(crate) async fn bulk_insert(
        &self,
        table: &TableSchema,
        records: &[Record],
        statement: &BoundStatement,
    ) -> Result<WriteResult, ExecutorError> {
        match self {
            WriteTarget::Executor(executor) => {
                executor.bulk_insert(table, records, statement).await
            }
            WriteTarget::Transaction(transaction) => transaction.write(statement).await,
        }
    }

    pub(crate) async fn query(
        &self,
        statement: &BoundStatement,
    ) -> Result<Vec<ReturnedRow>, ExecutorError> {
        match self {
            WriteTarget::Executor(executor) => executor.query(statement).await,
            WriteTarget::Transaction(transaction) => transaction.query(statement).await,
        }
    }
}
