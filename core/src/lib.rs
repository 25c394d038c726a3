mod config;
pub use config::{
    connection_string, read_config, BulkWriteConfig, ReadConfigError, Returning, WriteOptions,
};

mod database;
pub use database::{
    batch_planner::{Batch, BatchMode, BatchPlan, Batches, ChunkBoundaries},
    bulk_writer::BulkWriter,
    executor::{ExecutorError, SqlExecutor, SqlTransaction},
    postgres::client::{
        PgType, PostgresConnectionError, PostgresExecutor, PostgresTransaction, ToSql,
    },
    record::{Record, ReturnedRow, WriteResult},
    schema::{ColumnDefinition, ColumnType, Identifier, TableSchema},
    sql_builder::{
        batch_columns, build_conflict_clause, build_conflict_target, build_delete, build_field_list,
        build_find_by_id, build_insert, build_update, build_values_clause, BoundStatement,
        ConflictSpec, StatementBuilder, StatementShape, StatementVerb,
    },
    transaction::{run_in_transaction, ScopedTable, TransactionScope},
    value::{FromSqlValue, SqlValue},
};

mod error;
pub use error::BulkWriteError;

mod logger;
pub use logger::{setup_info_logger, setup_logger};

mod model;
pub use model::Model;

mod crud;
pub use crud::SimpleCrud;

mod observer;
pub use observer::{TracingObserver, WriteObserver, WriteOperation};

// export 3rd party dependencies
pub use async_trait::async_trait;
pub use futures::{future::BoxFuture, FutureExt};
pub use tracing::level_filters::LevelFilter;
