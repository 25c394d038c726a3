use std::{env, time::Duration};

use async_trait::async_trait;
use bb8::{Pool, PooledConnection, RunError};
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::pin_mut;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::{task, time::timeout};
pub use tokio_postgres::types::{ToSql, Type as PgType};
use tokio_postgres::{binary_copy::BinaryCopyInWriter, config::SslMode, Client, Config, Row};
use tracing::{debug, error};

use crate::{
    config::connection_string,
    database::{
        executor::{ExecutorError, SqlExecutor, SqlTransaction},
        record::{Record, ReturnedRow, WriteResult},
        schema::{ColumnDefinition, TableSchema},
        sql_builder::{build_copy_in, BoundStatement},
        value::SqlValue,
    },
};

/// Chunks larger than this go through binary COPY when nothing is returned.
const COPY_THRESHOLD: usize = 100;

type PgPool = Pool<PostgresConnectionManager<MakeTlsConnector>>;
type PgConnection = PooledConnection<'static, PostgresConnectionManager<MakeTlsConnector>>;

#[derive(thiserror::Error, Debug)]
pub enum PostgresConnectionError {
    #[error("The database connection string is wrong please check your environment: {0}")]
    DatabaseConnectionConfigWrong(#[from] env::VarError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] tokio_postgres::Error),

    #[error("Connection pool runtime error: {0}")]
    ConnectionPoolRuntimeError(#[from] RunError<tokio_postgres::Error>),

    #[error("Can not connect to the database please make sure your connection string is correct")]
    CanNotConnectToDatabase,

    #[error("Could not parse connection string make sure it is correctly formatted")]
    CouldNotParseConnectionString,

    #[error("Could not create tls connector")]
    CouldNotCreateTlsConnector,
}

fn params(statement: &BoundStatement) -> Vec<&(dyn ToSql + Sync)> {
    statement.params().iter().map(|param| param as &(dyn ToSql + Sync)).collect()
}

fn decode_value(row: &Row, idx: usize, ty: &PgType) -> Result<SqlValue, ExecutorError> {
    let value = match *ty {
        PgType::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        PgType::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(SqlValue::SmallInt),
        PgType::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(SqlValue::Int),
        PgType::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::BigInt),
        PgType::FLOAT4 => {
            row.try_get::<_, Option<f32>>(idx)?.map(|value| SqlValue::Double(f64::from(value)))
        }
        PgType::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::Double),
        PgType::NUMERIC => row.try_get::<_, Option<Decimal>>(idx)?.map(SqlValue::Numeric),
        PgType::TEXT | PgType::VARCHAR | PgType::BPCHAR | PgType::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
        }
        PgType::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Bytes),
        PgType::JSON | PgType::JSONB => row.try_get::<_, Option<Value>>(idx)?.map(SqlValue::Json),
        PgType::TIMESTAMPTZ => {
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?.map(SqlValue::Timestamp)
        }
        PgType::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|value| SqlValue::Timestamp(value.and_utc())),
        _ => return Err(ExecutorError::UnsupportedColumnType(ty.name().to_string())),
    };

    Ok(value.unwrap_or(SqlValue::Null))
}

fn decode_row(row: &Row) -> Result<ReturnedRow, ExecutorError> {
    let mut decoded = ReturnedRow::default();
    for (idx, column) in row.columns().iter().enumerate() {
        decoded.push(column.name(), decode_value(row, idx, column.type_())?);
    }
    Ok(decoded)
}

async fn query_on(
    client: &Client,
    statement: &BoundStatement,
) -> Result<Vec<ReturnedRow>, ExecutorError> {
    debug!("Query: {}", statement.shape());
    let rows = client.query(statement.sql(), &params(statement)).await?;
    rows.iter().map(decode_row).collect()
}

async fn execute_on(client: &Client, statement: &BoundStatement) -> Result<u64, ExecutorError> {
    debug!("Execute: {}", statement.shape());
    Ok(client.execute(statement.sql(), &params(statement)).await?)
}

pub struct PostgresExecutor {
    pool: PgPool,
}

impl PostgresExecutor {
    /// Connects using `DATABASE_URL`.
    pub async fn new() -> Result<Self, PostgresConnectionError> {
        let connection_str = connection_string()?;
        Self::connect(&connection_str).await
    }

    pub async fn connect(connection_str: &str) -> Result<Self, PostgresConnectionError> {
        async fn _connect(
            connection_str: &str,
            disable_ssl: bool,
        ) -> Result<PostgresExecutor, PostgresConnectionError> {
            let mut config: Config = connection_str
                .parse()
                .map_err(|_| PostgresConnectionError::CouldNotParseConnectionString)?;

            if disable_ssl {
                config.ssl_mode(SslMode::Disable);
            }

            let connector = TlsConnector::builder()
                .build()
                .map_err(|_| PostgresConnectionError::CouldNotCreateTlsConnector)?;
            let tls_connector = MakeTlsConnector::new(connector);

            let (client, connection) =
                match timeout(Duration::from_millis(5000), config.connect(tls_connector.clone()))
                    .await
                {
                    Ok(Ok((client, connection))) => (client, connection),
                    Ok(Err(e)) => {
                        // retry without ssl if ssl has been attempted and failed
                        if !disable_ssl &&
                            config.get_ssl_mode() != SslMode::Disable &&
                            !connection_str.contains("sslmode=require")
                        {
                            return Box::pin(_connect(connection_str, true)).await;
                        }
                        error!("Error connecting to database: {}", e);
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                    Err(e) => {
                        error!("Timeout connecting to database: {}", e);
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                };

            let connection_handle = task::spawn(connection);

            if client.query_one("SELECT 1", &[]).await.is_err() {
                return Err(PostgresConnectionError::CanNotConnectToDatabase);
            }

            drop(client);
            match connection_handle.await {
                Ok(Ok(())) => (),
                Ok(Err(_)) | Err(_) => return Err(PostgresConnectionError::CanNotConnectToDatabase),
            }

            let manager = PostgresConnectionManager::new(config, tls_connector);
            let pool = Pool::builder().build(manager).await?;

            Ok(PostgresExecutor { pool })
        }

        _connect(connection_str, false).await
    }

    /// COPY needs a value for every column, so it is only used when no record
    /// falls back to a column DEFAULT and nothing has to be returned.
    fn can_copy(statement: &BoundStatement, records: &[Record]) -> bool {
        let shape = statement.shape();
        shape.returning.is_empty() &&
            shape.conflict.is_none() &&
            records.len() > COPY_THRESHOLD &&
            records.iter().all(|record| {
                shape.columns.iter().all(|column| record.defined(column).is_some())
            })
    }

    async fn bulk_insert_via_copy(
        &self,
        table: &TableSchema,
        records: &[Record],
        statement: &BoundStatement,
    ) -> Result<u64, ExecutorError> {
        let columns = statement
            .shape()
            .columns
            .iter()
            .map(|name| {
                table.find_column(name).ok_or_else(|| {
                    ExecutorError::Rejected(format!(
                        "column {name} is not declared on {}",
                        table.qualified_name()
                    ))
                })
            })
            .collect::<Result<Vec<&ColumnDefinition>, _>>()?;

        let names: Vec<_> = columns.iter().map(|column| &column.name).collect();
        let column_types: Vec<PgType> =
            columns.iter().map(|column| column.column_type.to_pg_type()).collect();
        let stmt = build_copy_in(table, &names);

        debug!("Bulk insert statement: {}", stmt);

        let conn = self.pool.get().await?;
        let sink = conn.copy_in(&stmt).await?;

        let writer = BinaryCopyInWriter::new(sink, &column_types);
        pin_mut!(writer);

        let null = SqlValue::Null;
        for record in records {
            let row: Vec<&(dyn ToSql + Sync)> = names
                .iter()
                .map(|name| match record.get(name.as_str()) {
                    Some(value) => value as &(dyn ToSql + Sync),
                    None => &null as &(dyn ToSql + Sync),
                })
                .collect();
            writer.as_mut().write(&row).await?;
        }

        Ok(writer.finish().await?)
    }
}

#[async_trait]
impl SqlExecutor for PostgresExecutor {
    async fn query(&self, statement: &BoundStatement) -> Result<Vec<ReturnedRow>, ExecutorError> {
        let conn = self.pool.get().await?;
        query_on(&conn, statement).await
    }

    async fn execute(&self, statement: &BoundStatement) -> Result<u64, ExecutorError> {
        let conn = self.pool.get().await?;
        execute_on(&conn, statement).await
    }

    async fn begin(&self) -> Result<Box<dyn SqlTransaction>, ExecutorError> {
        let conn = self.pool.get_owned().await?;
        conn.batch_execute("BEGIN").await?;
        Ok(Box::new(PostgresTransaction { conn: Some(conn) }))
    }

    /// Uses binary COPY when possible, the rendered multi-row insert otherwise.
    async fn bulk_insert(
        &self,
        table: &TableSchema,
        records: &[Record],
        statement: &BoundStatement,
    ) -> Result<WriteResult, ExecutorError> {
        if Self::can_copy(statement, records) {
            let count = self.bulk_insert_via_copy(table, records, statement).await?;
            return Ok(WriteResult::Affected(count));
        }

        self.write(statement).await
    }
}

/// Owns its pooled connection for the lifetime of the transaction.
pub struct PostgresTransaction {
    conn: Option<PgConnection>,
}

impl PostgresTransaction {
    fn client(&self) -> Result<&Client, ExecutorError> {
        self.conn.as_deref().ok_or(ExecutorError::TransactionFinished)
    }

    async fn finish(mut self: Box<Self>, sql: &str) -> Result<(), ExecutorError> {
        let conn = self.conn.take().ok_or(ExecutorError::TransactionFinished)?;
        conn.batch_execute(sql).await?;
        Ok(())
    }
}

#[async_trait]
impl SqlTransaction for PostgresTransaction {
    async fn query(&self, statement: &BoundStatement) -> Result<Vec<ReturnedRow>, ExecutorError> {
        query_on(self.client()?, statement).await
    }

    async fn execute(&self, statement: &BoundStatement) -> Result<u64, ExecutorError> {
        execute_on(self.client()?, statement).await
    }

    async fn commit(self: Box<Self>) -> Result<(), ExecutorError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), ExecutorError> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PostgresTransaction {
    /// A transaction dropped while still open must not go back to the pool
    /// mid-transaction.
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.batch_execute("ROLLBACK").await {
                        error!("Could not roll back abandoned transaction: {}", e);
                    }
                });
            }
            Err(_) => error!("Abandoned transaction dropped outside a tokio runtime"),
        }
    }
}
