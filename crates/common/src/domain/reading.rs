use crate::domain::ValidationError;
use chrono::{DateTime, Utc};
use std::ops::RangeInclusive;

/// Payload field names shared by the validator, the sink and the demo producer
pub mod fields {
    pub const DEVICE_ID: &str = "device_id";
    pub const TIMESTAMP_UTC: &str = "timestamp_utc";
    pub const TEMPERATURE_CELSIUS: &str = "temperature_celsius";
    pub const HUMIDITY_PERCENT: &str = "humidity_percent";

    /// Required fields in the order they are checked
    pub const REQUIRED: [&str; 4] = [DEVICE_ID, TIMESTAMP_UTC, TEMPERATURE_CELSIUS, HUMIDITY_PERCENT];
}

/// Accepted temperature range in degrees Celsius (inclusive)
pub const TEMPERATURE_RANGE: RangeInclusive<f64> = -50.0..=100.0;

/// Accepted relative humidity range in percent (inclusive)
pub const HUMIDITY_RANGE: RangeInclusive<f64> = 0.0..=100.0;

/// A sensor reading that passed validation.
///
/// Fields are private: `ValidatedReading::new` is the only way to build one,
/// so every instance satisfies the field constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedReading {
    device_id: String,
    timestamp_utc: DateTime<Utc>,
    temperature_celsius: f64,
    humidity_percent: f64,
    processing_timestamp_utc: DateTime<Utc>,
}

impl ValidatedReading {
    pub fn new(
        device_id: String,
        timestamp_utc: DateTime<Utc>,
        temperature_celsius: f64,
        humidity_percent: f64,
        processing_timestamp_utc: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if device_id.is_empty() {
            return Err(ValidationError::InvalidField {
                field: fields::DEVICE_ID,
                reason: "device_id is empty".to_string(),
            });
        }

        check_range(fields::TEMPERATURE_CELSIUS, temperature_celsius, &TEMPERATURE_RANGE)?;
        check_range(fields::HUMIDITY_PERCENT, humidity_percent, &HUMIDITY_RANGE)?;

        Ok(Self {
            device_id,
            timestamp_utc,
            temperature_celsius,
            humidity_percent,
            processing_timestamp_utc,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        self.timestamp_utc
    }

    pub fn temperature_celsius(&self) -> f64 {
        self.temperature_celsius
    }

    pub fn humidity_percent(&self) -> f64 {
        self.humidity_percent
    }

    pub fn processing_timestamp_utc(&self) -> DateTime<Utc> {
        self.processing_timestamp_utc
    }
}

// NaN fails `contains`, so it is reported as out of range
fn check_range(
    field: &'static str,
    value: f64,
    range: &RangeInclusive<f64>,
) -> Result<(), ValidationError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}
