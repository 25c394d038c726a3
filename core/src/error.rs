use crate::database::{executor::ExecutorError, sql_builder::StatementShape};

#[derive(thiserror::Error, Debug)]
pub enum BulkWriteError {
    #[error("No records were given to write")]
    EmptyInput,

    #[error("The batch does not define any column to write")]
    EmptyColumnSet,

    #[error("Record {record_index} has no value for identifier column {column}")]
    MissingIdentifierValue { column: String, record_index: usize },

    #[error("Invalid conflict spec: {0}")]
    ConflictSpecInvalid(String),

    #[error("Column {column} does not exist on table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Invalid identifier {0:?}, identifiers must be 1 to 63 bytes without NUL")]
    InvalidIdentifier(String),

    #[error("Invalid table schema for {table}: {reason}")]
    InvalidSchema { table: String, reason: String },

    #[error("Chunk size must be greater than 0")]
    InvalidChunkSize,

    /// Carries the statement shape only, bound values never reach the message.
    #[error("Chunk {chunk} failed while executing {shape}: {source}")]
    ExecutionFailure {
        chunk: usize,
        shape: StatementShape,
        #[source]
        source: ExecutorError,
    },

    #[error("Transaction error: {0}")]
    Transaction(#[source] ExecutorError),

    #[error("Could not decode row: {0}")]
    RowDecode(String),
}

impl BulkWriteError {
    pub(crate) fn execution(chunk: usize, shape: &StatementShape, source: ExecutorError) -> Self {
        BulkWriteError::ExecutionFailure { chunk, shape: shape.clone(), source }
    }
}
