use crate::domain::{RepositoryResult, ValidatedReading};
use async_trait::async_trait;

/// Name of the table validated readings are written to
pub const SENSOR_READINGS_TABLE: &str = "sensor_readings";

/// Repository trait for persisting batches of validated readings
/// Infrastructure layer (e.g., PostgreSQL) implements this trait
///
/// Implementations must be all-or-nothing per call: either every reading in
/// the slice becomes visible, or none does and an error is returned.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SensorReadingRepository: Send + Sync {
    /// Insert a batch of readings, returning the number of rows written
    ///
    /// Returns `RepositoryError::NotConnected` when the store cannot be reached
    /// after one reconnect attempt, `RepositoryError::WriteFailed` otherwise.
    async fn insert_batch(&self, readings: &[ValidatedReading]) -> RepositoryResult<u64>;
}
