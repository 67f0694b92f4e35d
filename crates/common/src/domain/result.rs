use thiserror::Error;

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Reasons a sensor payload is rejected by validation.
///
/// All variants are non-retriable: redelivering the same payload cannot fix it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Field {field} value {value} out of range ({min} to {max})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

impl ValidationError {
    /// Name of the offending field, if the rejection is tied to one
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::MalformedPayload(_) => None,
            Self::MissingField(field) => Some(*field),
            Self::InvalidField { field, .. } => Some(*field),
            Self::OutOfRange { field, .. } => Some(*field),
        }
    }

    /// Short machine-readable classification used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedPayload(_) => "malformed_payload",
            Self::MissingField(_) => "missing_field",
            Self::InvalidField { .. } => "invalid_field",
            Self::OutOfRange { .. } => "out_of_range",
        }
    }
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    /// The store could not be reached, even after the inline reconnect attempt
    #[error("Database not connected: {0}")]
    NotConnected(String),

    #[error("Batch write failed: {0}")]
    WriteFailed(#[from] anyhow::Error),
}

impl RepositoryError {
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected(_))
    }
}
