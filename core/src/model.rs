use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{
    database::{
        bulk_writer::BulkWriter,
        executor::SqlExecutor,
        record::{Record, ReturnedRow},
        schema::TableSchema,
        transaction::{run_in_transaction, TransactionScope},
        value::SqlValue,
    },
    error::BulkWriteError,
};

/// A row type bound to one table.
///
/// Implementors describe the table and how to move between the model and its
/// column values; everything else is provided.
#[async_trait]
pub trait Model: Sized + Send + 'static {
    fn schema() -> TableSchema;

    /// Columns left out of the record (or set to null) fall back to the column
    /// `DEFAULT` on insert.
    fn into_record(self) -> Record;

    fn from_row(row: ReturnedRow) -> Result<Self, BulkWriteError>;

    fn query_builder(executor: Arc<dyn SqlExecutor>) -> BulkWriter {
        BulkWriter::new(executor, Self::schema())
    }

    fn modelize(rows: Vec<ReturnedRow>) -> Result<Vec<Self>, BulkWriteError> {
        rows.into_iter().map(Self::from_row).collect()
    }

    async fn find_by_id<I>(
        executor: Arc<dyn SqlExecutor>,
        id: I,
    ) -> Result<Option<Self>, BulkWriteError>
    where
        I: Into<SqlValue> + Send,
    {
        let row = Self::query_builder(executor).find_by_id(id).await?;
        row.map(Self::from_row).transpose()
    }

    /// Runs `callback` in a transaction scoped to this model's table.
    async fn transaction<F, T>(
        executor: Arc<dyn SqlExecutor>,
        callback: F,
    ) -> Result<T, BulkWriteError>
    where
        F: for<'s> FnOnce(&'s TransactionScope) -> BoxFuture<'s, Result<T, BulkWriteError>> + Send,
        T: Send,
    {
        run_in_transaction(executor.as_ref(), Some(Arc::new(Self::schema())), callback).await
    }
}
