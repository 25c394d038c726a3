use std::fmt;

use tracing::{error, info};

use crate::error::BulkWriteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    Insert,
    InsertIgnoreOnConflict,
    Update,
    Delete,
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteOperation::Insert => "insert",
            WriteOperation::InsertIgnoreOnConflict => "insert ignore on conflict",
            WriteOperation::Update => "update",
            WriteOperation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Hook the CRUD helper reports every outcome to before handing it back.
pub trait WriteObserver: Send + Sync {
    fn on_success(&self, _operation: WriteOperation, _table: &str, _rows: u64) {}

    fn on_failure(&self, operation: WriteOperation, table: &str, error: &BulkWriteError);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl WriteObserver for TracingObserver {
    fn on_success(&self, operation: WriteOperation, table: &str, rows: u64) {
        info!("{} - {} wrote {} rows", table, operation, rows);
    }

    fn on_failure(&self, operation: WriteOperation, table: &str, error: &BulkWriteError) {
        error!("{} - {} failed: {}", table, operation, error);
    }
}
