use crate::domain::{
    RepositoryError, RepositoryResult, SensorReadingRepository, ValidatedReading,
    SENSOR_READINGS_TABLE,
};
use crate::postgres::PostgresConnection;
use async_trait::async_trait;
use std::error::Error as _;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;
use tracing::{debug, instrument, warn};

/// PostgreSQL implementation of SensorReadingRepository trait
///
/// Owns the connection exclusively. Each batch is written inside one
/// transaction; dropping the transaction on error rolls it back.
pub struct PostgresSensorReadingRepository {
    connection: Mutex<PostgresConnection>,
    insert_sql: String,
}

impl PostgresSensorReadingRepository {
    pub fn new(connection: PostgresConnection) -> Self {
        Self {
            connection: Mutex::new(connection),
            insert_sql: insert_statement(SENSOR_READINGS_TABLE),
        }
    }
}

fn insert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {} (device_id, timestamp_utc, temperature_celsius, humidity_percent, processing_timestamp_utc)
         VALUES ($1, $2, $3, $4, $5)",
        table
    )
}

// A write that fails because the session went away is a connectivity
// problem, not a rejected batch.
fn classify(err: tokio_postgres::Error) -> RepositoryError {
    if is_connection_loss(&err) {
        RepositoryError::NotConnected(err.to_string())
    } else {
        RepositoryError::WriteFailed(err.into())
    }
}

fn is_connection_loss(err: &tokio_postgres::Error) -> bool {
    if err.is_closed() {
        return true;
    }
    if let Some(code) = err.code() {
        return [
            SqlState::ADMIN_SHUTDOWN,
            SqlState::CRASH_SHUTDOWN,
            SqlState::CANNOT_CONNECT_NOW,
            SqlState::CONNECTION_EXCEPTION,
            SqlState::CONNECTION_FAILURE,
        ]
        .contains(code);
    }
    err.source().is_some_and(|source| source.is::<std::io::Error>())
}

async fn write_batch(
    client: &mut Client,
    insert_sql: &str,
    readings: &[ValidatedReading],
) -> RepositoryResult<u64> {
    let transaction = client.transaction().await.map_err(classify)?;
    let statement = transaction.prepare(insert_sql).await.map_err(classify)?;

    let mut inserted = 0;
    for reading in readings {
        inserted += transaction
            .execute(
                &statement,
                &[
                    &reading.device_id(),
                    &reading.timestamp_utc(),
                    &reading.temperature_celsius(),
                    &reading.humidity_percent(),
                    &reading.processing_timestamp_utc(),
                ],
            )
            .await
            .map_err(classify)?;
    }

    transaction.commit().await.map_err(classify)?;
    Ok(inserted)
}

#[async_trait]
impl SensorReadingRepository for PostgresSensorReadingRepository {
    #[instrument(skip(self, readings), fields(batch_size = readings.len()))]
    async fn insert_batch(&self, readings: &[ValidatedReading]) -> RepositoryResult<u64> {
        if readings.is_empty() {
            debug!("no readings to insert, skipping");
            return Ok(0);
        }

        let mut connection = self.connection.lock().await;
        // A session that looks alive may still have been severed server side;
        // it gets one reconnect and one retry. A session opened just now does not.
        let fresh_session = !connection.is_connected();
        let client = connection.ensure_connected().await?;

        let first_attempt = write_batch(client, &self.insert_sql, readings).await;
        let inserted = match first_attempt {
            Err(RepositoryError::NotConnected(reason)) if !fresh_session => {
                warn!(error = %reason, "database session lost during write, reconnecting");
                connection.disconnect();
                let client = connection.ensure_connected().await?;
                write_batch(client, &self.insert_sql, readings).await?
            }
            result => result?,
        };

        debug!(rows_inserted = inserted, "successfully inserted reading batch");
        Ok(inserted)
    }
}
