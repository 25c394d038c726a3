use std::{marker::PhantomData, sync::Arc};

use crate::{
    config::{Returning, WriteOptions},
    database::{
        bulk_writer::BulkWriter,
        executor::SqlExecutor,
        record::{ReturnedRow, WriteResult},
        sql_builder::ConflictSpec,
        value::SqlValue,
    },
    error::BulkWriteError,
    model::Model,
    observer::{TracingObserver, WriteObserver, WriteOperation},
};

/// Insert, update and delete for one model. Every outcome is reported to the
/// observer, then returned unchanged.
pub struct SimpleCrud<M> {
    writer: BulkWriter,
    observer: Arc<dyn WriteObserver>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> SimpleCrud<M> {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        SimpleCrud {
            writer: M::query_builder(executor),
            observer: Arc::new(TracingObserver),
            _model: PhantomData,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn WriteObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn writer(&self) -> &BulkWriter {
        &self.writer
    }

    fn report<T>(
        &self,
        operation: WriteOperation,
        outcome: Result<T, BulkWriteError>,
        rows: impl FnOnce(&T) -> u64,
    ) -> Result<T, BulkWriteError> {
        let table = self.writer.table().qualified_name();
        match &outcome {
            Ok(value) => self.observer.on_success(operation, &table, rows(value)),
            Err(error) => self.observer.on_failure(operation, &table, error),
        }
        outcome
    }

    pub async fn insert(
        &self,
        models: Vec<M>,
        options: &WriteOptions,
    ) -> Result<WriteResult, BulkWriteError> {
        let records: Vec<_> = models.into_iter().map(M::into_record).collect();
        let outcome = self.writer.insert_or_batch(&records, options).await;
        self.report(WriteOperation::Insert, outcome, WriteResult::affected)
    }

    pub async fn update(&self, models: Vec<M>) -> Result<WriteResult, BulkWriteError> {
        let records: Vec<_> = models.into_iter().map(M::into_record).collect();
        let outcome = self.writer.update_or_batch(&records, &Returning::None).await;
        self.report(WriteOperation::Update, outcome, WriteResult::affected)
    }

    /// Deletes every row whose `column` holds one of `values`.
    pub async fn delete(&self, values: Vec<SqlValue>, column: &str) -> Result<u64, BulkWriteError> {
        let outcome = self.writer.delete(column, values).await;
        self.report(WriteOperation::Delete, outcome, |deleted| *deleted)
    }

    pub async fn insert_ignore_on_conflict(
        &self,
        models: Vec<M>,
        conflict: &ConflictSpec,
        options: &WriteOptions,
    ) -> Result<Option<Vec<ReturnedRow>>, BulkWriteError> {
        let records: Vec<_> = models.into_iter().map(M::into_record).collect();
        let outcome = self
            .writer
            .postgres_insert_or_batch_ignore_on_conflict(&records, conflict, options)
            .await;
        self.report(WriteOperation::InsertIgnoreOnConflict, outcome, |rows| {
            rows.as_ref().map_or(0, |rows| rows.len() as u64)
        })
    }
}
