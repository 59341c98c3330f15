use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecayError {
    #[error("Invalid seed for entity '{name}': {reason}")]
    InvalidSeed { name: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation '{operation}' timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("Scheduler error: {0}")]
    SchedulerError(String),
}

impl DecayError {
    pub(crate) fn invalid_seed(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidSeed {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DecayError>;
