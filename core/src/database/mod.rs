pub mod batch_planner;
pub mod bulk_writer;
pub mod executor;
#[cfg(test)]
pub(crate) mod memory;
pub mod postgres;
pub mod record;
pub mod schema;
pub mod sql_builder;
pub mod transaction;
pub mod value;
