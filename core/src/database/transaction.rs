use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::{
    config::WriteOptions,
    database::{
        bulk_writer::{delete_rows, insert_chunks, insert_ignore_chunks, update_rows},
        executor::{SqlExecutor, SqlTransaction, WriteTarget},
        record::{Record, ReturnedRow, WriteResult},
        schema::TableSchema,
        sql_builder::{BoundStatement, ConflictSpec},
        value::SqlValue,
    },
    error::BulkWriteError,
};

/// Handle given to a transaction callback.
pub struct TransactionScope {
    transaction: Box<dyn SqlTransaction>,
    table: Option<Arc<TableSchema>>,
}

impl TransactionScope {
    /// Direct access to the transaction for statements the writers do not cover.
    pub fn transaction(&self) -> &dyn SqlTransaction {
        self.transaction.as_ref()
    }

    pub async fn write(&self, statement: &BoundStatement) -> Result<WriteResult, BulkWriteError> {
        self.transaction
            .write(statement)
            .await
            .map_err(|source| BulkWriteError::execution(0, statement.shape(), source))
    }

    /// Writers for the table the transaction was opened for, if any.
    pub fn table(&self) -> Option<ScopedTable<'_>> {
        self.table.as_deref().map(|table| self.for_table(table))
    }

    pub fn for_table<'t>(&'t self, table: &'t TableSchema) -> ScopedTable<'t> {
        ScopedTable { transaction: self.transaction.as_ref(), table }
    }
}

/// Table scoped writers bound to an open transaction.
pub struct ScopedTable<'t> {
    transaction: &'t dyn SqlTransaction,
    table: &'t TableSchema,
}

impl ScopedTable<'_> {
    fn target(&self) -> WriteTarget<'_> {
        WriteTarget::Transaction(self.transaction)
    }

    pub async fn insert_or_batch(
        &self,
        records: &[Record],
        options: &WriteOptions,
    ) -> Result<WriteResult, BulkWriteError> {
        insert_chunks(self.target(), self.table, records, options).await
    }

    pub async fn insert_ignore_on_conflict(
        &self,
        records: &[Record],
        conflict: &ConflictSpec,
        options: &WriteOptions,
    ) -> Result<Option<Vec<ReturnedRow>>, BulkWriteError> {
        insert_ignore_chunks(self.target(), self.table, records, conflict, options).await
    }

    pub async fn update(
        &self,
        records: &[Record],
        options: &WriteOptions,
    ) -> Result<WriteResult, BulkWriteError> {
        update_rows(self.transaction, self.table, records, &options.returning).await
    }

    pub async fn delete(&self, column: &str, values: Vec<SqlValue>) -> Result<u64, BulkWriteError> {
        delete_rows(self.target(), self.table, column, values).await
    }
}

/// Runs `callback` inside one transaction.
///
/// Begun -> Committed when the callback returns `Ok`, Begun -> RolledBack when it
/// returns `Err`; the callback error is surfaced either way. There is no retry.
pub async fn run_in_transaction<F, T>(
    executor: &dyn SqlExecutor,
    table: Option<Arc<TableSchema>>,
    callback: F,
) -> Result<T, BulkWriteError>
where
    F: for<'s> FnOnce(&'s TransactionScope) -> BoxFuture<'s, Result<T, BulkWriteError>> + Send,
    T: Send,
{
    let transaction = executor.begin().await.map_err(BulkWriteError::Transaction)?;
    debug!("Transaction begun");

    let scope = TransactionScope { transaction, table };
    let outcome = callback(&scope).await;
    let TransactionScope { transaction, .. } = scope;

    match outcome {
        Ok(value) => {
            transaction.commit().await.map_err(BulkWriteError::Transaction)?;
            debug!("Transaction committed");
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = transaction.rollback().await {
                warn!("Rollback after failed transaction also failed: {}", rollback_err);
            } else {
                debug!("Transaction rolled back: {}", err);
            }
            Err(err)
        }
    }
}
