use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use tracing::debug;

use crate::{
    config::{Returning, WriteOptions},
    database::{
        batch_planner::BatchPlan,
        executor::{SqlExecutor, SqlTransaction, WriteTarget},
        record::{Record, ReturnedRow, WriteResult},
        schema::TableSchema,
        sql_builder::{
            build_delete, build_find_by_id, build_insert, build_update, BoundStatement,
            ConflictSpec,
        },
        transaction::{run_in_transaction, TransactionScope},
        value::SqlValue,
    },
    error::BulkWriteError,
};

/// Renders one insert per batch up front so a bad record fails the call before
/// the first statement is sent.
fn plan_inserts<'r>(
    table: &TableSchema,
    records: &'r [Record],
    conflict: Option<&ConflictSpec>,
    options: &WriteOptions,
) -> Result<(BatchPlan, Vec<(&'r [Record], BoundStatement)>), BulkWriteError> {
    if records.is_empty() {
        return Err(BulkWriteError::EmptyInput);
    }

    let plan = BatchPlan::new(records.len(), options)?;
    let statements = plan
        .batches(records)
        .map(|batch| {
            build_insert(table, batch.items, conflict, &options.returning)
                .map(|statement| (batch.items, statement))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((plan, statements))
}

/// Chunks run one after another; the first failure stops the loop and chunks
/// already written stay written.
pub(crate) async fn insert_chunks(
    target: WriteTarget<'_>,
    table: &TableSchema,
    records: &[Record],
    options: &WriteOptions,
) -> Result<WriteResult, BulkWriteError> {
    let (plan, statements) = plan_inserts(table, records, None, options)?;
    let mut result = WriteResult::empty(options.returning.is_requested());

    for (index, (chunk, statement)) in statements.iter().enumerate() {
        debug!("{} - writing chunk {}/{}", table.qualified_name(), index + 1, statements.len());

        let outcome = if plan.is_chunked() {
            target.bulk_insert(table, chunk, statement).await
        } else {
            target.write(statement).await
        };

        result.extend(outcome.map_err(|e| BulkWriteError::execution(index, statement.shape(), e))?);
    }

    Ok(result)
}

pub(crate) async fn insert_ignore_chunks(
    target: WriteTarget<'_>,
    table: &TableSchema,
    records: &[Record],
    conflict: &ConflictSpec,
    options: &WriteOptions,
) -> Result<Option<Vec<ReturnedRow>>, BulkWriteError> {
    let (_, statements) = plan_inserts(table, records, Some(conflict), options)?;
    let mut result = WriteResult::empty(options.returning.is_requested());

    for (index, (_, statement)) in statements.iter().enumerate() {
        debug!(
            "{} - writing chunk {}/{} ignoring conflicts",
            table.qualified_name(),
            index + 1,
            statements.len()
        );

        let outcome = target.write(statement).await;
        result.extend(outcome.map_err(|e| BulkWriteError::execution(index, statement.shape(), e))?);
    }

    if options.returning.is_requested() {
        Ok(result.into_rows())
    } else {
        Ok(None)
    }
}

fn build_updates(
    table: &TableSchema,
    records: &[Record],
    returning: &Returning,
) -> Result<Vec<BoundStatement>, BulkWriteError> {
    if records.is_empty() {
        return Err(BulkWriteError::EmptyInput);
    }

    records
        .iter()
        .enumerate()
        .map(|(index, record)| build_update(table, record, index, returning))
        .collect()
}

/// Dispatches every update on the transaction at once and waits for all of
/// them. The error of the lowest failing record index is returned.
async fn execute_updates(
    transaction: &dyn SqlTransaction,
    statements: &[BoundStatement],
    returning: bool,
) -> Result<WriteResult, BulkWriteError> {
    let outcomes = join_all(statements.iter().map(|statement| transaction.write(statement))).await;

    let mut result = WriteResult::empty(returning);
    for (index, (statement, outcome)) in statements.iter().zip(outcomes).enumerate() {
        result.extend(outcome.map_err(|e| BulkWriteError::execution(index, statement.shape(), e))?);
    }

    Ok(result)
}

pub(crate) async fn update_rows(
    transaction: &dyn SqlTransaction,
    table: &TableSchema,
    records: &[Record],
    returning: &Returning,
) -> Result<WriteResult, BulkWriteError> {
    let statements = build_updates(table, records, returning)?;
    execute_updates(transaction, &statements, returning.is_requested()).await
}

pub(crate) async fn delete_rows(
    target: WriteTarget<'_>,
    table: &TableSchema,
    column: &str,
    values: Vec<SqlValue>,
) -> Result<u64, BulkWriteError> {
    let statement = build_delete(table, column, values)?;
    target
        .write(&statement)
        .await
        .map(|result| result.affected())
        .map_err(|e| BulkWriteError::execution(0, statement.shape(), e))
}

/// Write coordinator for one table.
#[derive(Clone)]
pub struct BulkWriter {
    executor: Arc<dyn SqlExecutor>,
    table: Arc<TableSchema>,
}

impl BulkWriter {
    pub fn new(executor: Arc<dyn SqlExecutor>, table: TableSchema) -> Self {
        BulkWriter { executor, table: Arc::new(table) }
    }

    pub fn table(&self) -> &TableSchema {
        &self.table
    }

    fn target(&self) -> WriteTarget<'_> {
        WriteTarget::Executor(self.executor.as_ref())
    }

    /// Inserts `records`, through the bulk insert fast path one chunk at a time
    /// when the plan chunks, or as a single multi-row insert otherwise.
    pub async fn insert_or_batch(
        &self,
        records: &[Record],
        options: &WriteOptions,
    ) -> Result<WriteResult, BulkWriteError> {
        insert_chunks(self.target(), &self.table, records, options).await
    }

    /// Inserts `records` with `ON CONFLICT ... DO NOTHING`. Rows skipped by a
    /// conflict are not errors; with returning columns only the rows that landed
    /// come back. Returns `None` when no returning columns were requested.
    pub async fn postgres_insert_or_batch_ignore_on_conflict(
        &self,
        records: &[Record],
        conflict: &ConflictSpec,
        options: &WriteOptions,
    ) -> Result<Option<Vec<ReturnedRow>>, BulkWriteError> {
        insert_ignore_chunks(self.target(), &self.table, records, conflict, options).await
    }

    /// Same as [`BulkWriter::insert_or_batch`] but part of a caller owned transaction.
    pub async fn insert_or_batch_in(
        &self,
        scope: &TransactionScope,
        records: &[Record],
        options: &WriteOptions,
    ) -> Result<WriteResult, BulkWriteError> {
        let target = WriteTarget::Transaction(scope.transaction());
        insert_chunks(target, &self.table, records, options).await
    }

    pub async fn insert_ignore_on_conflict_in(
        &self,
        scope: &TransactionScope,
        records: &[Record],
        conflict: &ConflictSpec,
        options: &WriteOptions,
    ) -> Result<Option<Vec<ReturnedRow>>, BulkWriteError> {
        let target = WriteTarget::Transaction(scope.transaction());
        insert_ignore_chunks(target, &self.table, records, conflict, options).await
    }

    /// Updates each record matched by the table id column, all inside one
    /// transaction. Any failure rolls every update back.
    pub async fn update_or_batch(
        &self,
        records: &[Record],
        returning: &Returning,
    ) -> Result<WriteResult, BulkWriteError> {
        let statements = build_updates(&self.table, records, returning)?;
        let returning = returning.is_requested();

        run_in_transaction(self.executor.as_ref(), Some(self.table.clone()), move |scope| {
            Box::pin(async move {
                execute_updates(scope.transaction(), &statements, returning).await
            })
        })
        .await
    }

    pub async fn delete(&self, column: &str, values: Vec<SqlValue>) -> Result<u64, BulkWriteError> {
        delete_rows(self.target(), &self.table, column, values).await
    }

    pub async fn find_by_id(
        &self,
        id: impl Into<SqlValue>,
    ) -> Result<Option<ReturnedRow>, BulkWriteError> {
        let statement = build_find_by_id(&self.table, id.into())?;
        let rows = self
            .target()
            .query(&statement)
            .await
            .map_err(|e| BulkWriteError::execution(0, statement.shape(), e))?;
        Ok(rows.into_iter().next())
    }

    /// Runs `callback` in a transaction whose scope writes to this writer's table.
    pub async fn transaction<F, T>(&self, callback: F) -> Result<T, BulkWriteError>
    where
        F: for<'s> FnOnce(&'s TransactionScope) -> BoxFuture<'s, Result<T, BulkWriteError>> + Send,
        T: Send,
    {
        run_in_transaction(self.executor.as_ref(), Some(self.table.clone()), callback).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{executor::ExecutorError, memory::MemoryExecutor, schema::ColumnType};

    fn users() -> TableSchema {
        TableSchema::new("users")
            .unwrap()
            .column("id", ColumnType::BigInt)
            .unwrap()
            .column("email", ColumnType::Text)
            .unwrap()
            .column("name", ColumnType::Text)
            .unwrap()
    }

    fn user(i: usize) -> Record {
        Record::new().set("email", format!("user{i}@x.io")).set("name", format!("user {i}"))
    }

    fn writer(executor: &Arc<MemoryExecutor>) -> BulkWriter {
        BulkWriter::new(executor.clone(), users())
    }

    fn memory() -> Arc<MemoryExecutor> {
        Arc::new(
            MemoryExecutor::new()
                .with_serial("users", "id")
                .with_unique("users", "users_email_key", &["email"]),
        )
    }

    async fn seed(writer: &BulkWriter, count: usize) {
        let records: Vec<Record> = (0..count).map(user).collect();
        writer.insert_or_batch(&records, &WriteOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_empty_input_issues_nothing() {
        let executor = memory();

        let result = writer(&executor).insert_or_batch(&[], &WriteOptions::default()).await;

        assert!(matches!(result, Err(BulkWriteError::EmptyInput)));
        assert!(executor.statements().is_empty());
        assert_eq!(executor.bulk_inserts(), 0);
    }

    #[tokio::test]
    async fn test_insert_single_statement_below_chunk_size() {
        let executor = memory();
        let records: Vec<Record> = (0..5).map(user).collect();

        let result = writer(&executor)
            .insert_or_batch(&records, &WriteOptions::default().with_chunk_size(5))
            .await
            .unwrap();

        assert_eq!(result, WriteResult::Affected(5));
        assert_eq!(executor.statements().len(), 1);
        assert_eq!(executor.bulk_inserts(), 0);
    }

    #[tokio::test]
    async fn test_insert_chunked_uses_bulk_path_and_keeps_order() {
        let executor = memory();
        let records: Vec<Record> = (0..11).map(user).collect();
        let options = WriteOptions::default()
            .with_chunk_size(5)
            .with_returning(Returning::Columns(vec!["id".to_string(), "email".to_string()]));

        let result = writer(&executor).insert_or_batch(&records, &options).await.unwrap();

        assert_eq!(executor.bulk_inserts(), 3);
        let rows = result.into_rows().unwrap();
        assert_eq!(rows.len(), 11);
        let emails: Vec<String> = rows.iter().map(|row| row.get("email").unwrap()).collect();
        let expected: Vec<String> = (0..11).map(|i| format!("user{i}@x.io")).collect();
        assert_eq!(emails, expected);
        assert_eq!(rows[10].get::<i64>("id").unwrap(), 11);
    }

    #[tokio::test]
    async fn test_insert_chunk_size_plus_one_writes_last_record() {
        let executor = memory();
        let records: Vec<Record> = (0..4).map(user).collect();

        writer(&executor)
            .insert_or_batch(&records, &WriteOptions::default().with_chunk_size(3))
            .await
            .unwrap();

        let shapes = executor.statements();
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[0].rows, 3);
        assert_eq!(shapes[1].rows, 1);
        assert!(executor
            .rows("users")
            .iter()
            .any(|row| row.value("email") == Some(&SqlValue::from("user3@x.io"))));
    }

    #[tokio::test]
    async fn test_insert_failure_stops_remaining_chunks_without_rollback() {
        let executor = memory();
        executor.fail_when(|statement| {
            statement.params().contains(&SqlValue::from("user4@x.io"))
        });
        let records: Vec<Record> = (0..9).map(user).collect();

        let result = writer(&executor)
            .insert_or_batch(&records, &WriteOptions::default().with_chunk_size(3))
            .await;

        match result {
            Err(BulkWriteError::ExecutionFailure { chunk, shape, source }) => {
                assert_eq!(chunk, 1);
                assert_eq!(shape.rows, 3);
                assert!(matches!(source, ExecutorError::Rejected(_)));
            }
            other => panic!("expected an execution failure, got {other:?}"),
        }
        // chunk 0 stays, chunk 2 never ran
        assert_eq!(executor.rows("users").len(), 3);
        assert_eq!(executor.statements().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_column_fails_before_any_statement() {
        let executor = memory();
        let mut records: Vec<Record> = (0..6).map(user).collect();
        records[5].insert("nickname", "x");

        let result = writer(&executor)
            .insert_or_batch(&records, &WriteOptions::default().with_chunk_size(2))
            .await;

        assert!(matches!(result, Err(BulkWriteError::UnknownColumn { .. })));
        assert!(executor.statements().is_empty());
    }

    #[tokio::test]
    async fn test_ignore_on_conflict_by_field_list() {
        let executor = memory();
        let writer = writer(&executor);
        let conflict = ConflictSpec::ByFieldList(vec!["email".to_string()]);
        let options = WriteOptions::default().with_returning(Returning::Column("id".to_string()));

        let first = writer
            .postgres_insert_or_batch_ignore_on_conflict(&[user(1)], &conflict, &options)
            .await
            .unwrap()
            .unwrap();
        let second = writer
            .postgres_insert_or_batch_ignore_on_conflict(&[user(1)], &conflict, &options)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(executor.rows("users").len(), 1);
        assert!(executor.last_sql().unwrap().contains("ON CONFLICT (\"email\") DO NOTHING"));
    }

    #[tokio::test]
    async fn test_ignore_on_conflict_by_constraint() {
        let executor = memory();
        let conflict = ConflictSpec::ByConstraintName("users_email_key".to_string());
        let records = vec![user(1), user(2), user(1)];

        let result = writer(&executor)
            .postgres_insert_or_batch_ignore_on_conflict(
                &records,
                &conflict,
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(executor.rows("users").len(), 2);
        let sql = executor.last_sql().unwrap();
        assert!(sql.contains("ON CONFLICT ON CONSTRAINT \"users_email_key\" DO NOTHING"));
        assert!(!sql.contains("(\"email\") DO NOTHING"));
    }

    #[tokio::test]
    async fn test_ignore_on_conflict_accumulates_returning_across_chunks() {
        let executor = memory();
        let writer = writer(&executor);
        let conflict = ConflictSpec::ByFieldList(vec!["email".to_string()]);
        writer
            .insert_or_batch(&[user(2), user(5)], &WriteOptions::default())
            .await
            .unwrap();

        let records: Vec<Record> = (0..7).map(user).collect();
        let options = WriteOptions::default()
            .with_chunk_size(3)
            .with_returning(Returning::Column("email".to_string()));

        let rows = writer
            .postgres_insert_or_batch_ignore_on_conflict(&records, &conflict, &options)
            .await
            .unwrap()
            .unwrap();

        let landed: Vec<String> = rows.iter().map(|row| row.get("email").unwrap()).collect();
        assert_eq!(
            landed,
            vec!["user0@x.io", "user1@x.io", "user3@x.io", "user4@x.io", "user6@x.io"]
        );
        // raw conflict path never takes the bulk fast path
        assert_eq!(executor.bulk_inserts(), 0);
        assert_eq!(executor.rows("users").len(), 7);
    }

    #[tokio::test]
    async fn test_ignore_on_conflict_invalid_spec() {
        let executor = memory();
        let conflict = ConflictSpec::ByFieldList(vec!["phone".to_string()]);

        let result = writer(&executor)
            .postgres_insert_or_batch_ignore_on_conflict(
                &[user(1)],
                &conflict,
                &WriteOptions::default(),
            )
            .await;

        assert!(matches!(result, Err(BulkWriteError::ConflictSpecInvalid(_))));
        assert!(executor.statements().is_empty());
    }

    #[tokio::test]
    async fn test_update_or_batch_commits_all() {
        let executor = memory();
        let writer = writer(&executor);
        seed(&writer, 3).await;

        let updates: Vec<Record> = (1..=3i64)
            .map(|id| Record::new().set("id", id).set("name", format!("renamed {id}")))
            .collect();

        let result = writer.update_or_batch(&updates, &Returning::None).await.unwrap();

        assert_eq!(result, WriteResult::Affected(3));
        assert_eq!(executor.commits(), 1);
        let rows = executor.rows("users");
        assert!(rows.iter().all(|row| row.get::<String>("name").unwrap().starts_with("renamed")));
    }

    #[tokio::test]
    async fn test_update_or_batch_rolls_back_everything_on_failure() {
        let executor = memory();
        let writer = writer(&executor);
        seed(&writer, 3).await;
        executor.fail_when(|statement| statement.params().contains(&SqlValue::from("boom")));

        let updates = vec![
            Record::new().set("id", 1i64).set("name", "first"),
            Record::new().set("id", 2i64).set("name", "boom"),
            Record::new().set("id", 3i64).set("name", "third"),
        ];

        let result = writer.update_or_batch(&updates, &Returning::None).await;

        assert!(matches!(
            result,
            Err(BulkWriteError::ExecutionFailure {
                chunk: 1,
                source: ExecutorError::Rejected(_),
                ..
            })
        ));
        assert_eq!(executor.commits(), 0);
        assert_eq!(executor.rollbacks(), 1);
        let names: Vec<String> =
            executor.rows("users").iter().map(|row| row.get("name").unwrap()).collect();
        assert_eq!(names, vec!["user 0", "user 1", "user 2"]);
    }

    #[tokio::test]
    async fn test_update_or_batch_missing_identifier_fails_before_begin() {
        let executor = memory();

        let updates =
            vec![Record::new().set("id", 1i64).set("name", "a"), Record::new().set("name", "b")];
        let result = writer(&executor).update_or_batch(&updates, &Returning::None).await;

        assert!(matches!(
            result,
            Err(BulkWriteError::MissingIdentifierValue { record_index: 1, .. })
        ));
        assert_eq!(executor.begun(), 0);
    }

    #[tokio::test]
    async fn test_update_or_batch_returning() {
        let executor = memory();
        let writer = writer(&executor);
        writer.insert_or_batch(&[user(0), user(1)], &WriteOptions::default()).await.unwrap();

        let updates = vec![
            Record::new().set("id", 2i64).set("name", "two"),
            Record::new().set("id", 1i64).set("name", "one"),
        ];
        let returning = Returning::Columns(vec!["id".to_string(), "name".to_string()]);
        let result = writer.update_or_batch(&updates, &returning).await.unwrap();

        let rows = result.into_rows().unwrap();
        assert_eq!(rows[0].get::<i64>("id").unwrap(), 2);
        assert_eq!(rows[1].get::<String>("name").unwrap(), "one");
    }

    #[tokio::test]
    async fn test_delete_and_find_by_id() {
        let executor = memory();
        let writer = writer(&executor);
        seed(&writer, 4).await;

        let deleted = writer
            .delete("email", vec![SqlValue::from("user0@x.io"), SqlValue::from("user2@x.io")])
            .await
            .unwrap();

        assert_eq!(deleted, 2);
        assert!(writer.find_by_id(1i64).await.unwrap().is_none());
        let row = writer.find_by_id(2i64).await.unwrap().unwrap();
        assert_eq!(row.get::<String>("email").unwrap(), "user1@x.io");
    }

    #[tokio::test]
    async fn test_scoped_writes_share_one_transaction() {
        let executor = memory();
        let writer = writer(&executor);
        executor.fail_when(|statement| statement.params().contains(&SqlValue::from("user9@x.io")));

        let result = writer
            .transaction(|scope| {
                Box::pin(async move {
                    let Some(users) = scope.table() else {
                        return Err(BulkWriteError::EmptyInput);
                    };
                    users.insert_or_batch(&[user(1), user(2)], &WriteOptions::default()).await?;
                    users.insert_or_batch(&[user(9)], &WriteOptions::default()).await
                })
            })
            .await;

        assert!(matches!(result, Err(BulkWriteError::ExecutionFailure { .. })));
        assert!(executor.rows("users").is_empty());
    }

    #[tokio::test]
    async fn test_writer_joins_caller_transaction() {
        let executor = memory();
        let writer = writer(&executor);
        let conflict = ConflictSpec::ByFieldList(vec!["email".to_string()]);

        let ignored = writer
            .transaction(|scope| {
                let writer = writer.clone();
                let conflict = conflict.clone();
                Box::pin(async move {
                    let options = WriteOptions::default();
                    writer.insert_or_batch_in(scope, &[user(1), user(2)], &options).await?;
                    writer
                        .insert_ignore_on_conflict_in(
                            scope,
                            &[user(2), user(3)],
                            &conflict,
                            &options,
                        )
                        .await
                })
            })
            .await
            .unwrap();

        assert!(ignored.is_none());
        assert_eq!(executor.rows("users").len(), 3);
        assert_eq!(executor.bulk_inserts(), 0);
        assert_eq!(executor.commits(), 1);
    }
}
