//! Error taxonomy shared by the engine, the bus and the stores.

use thiserror::Error;

/// Errors raised inside the irrigation core.
///
/// None of these cross a tick or dispatch boundary: callers turn them into a
/// failed execution log entry or a dropped-and-logged message.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Malformed schedule or device input.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Device or schedule missing at execution time.
    #[error("not found: {0}")]
    NotFound(String),
    /// The bus refused an outbound publish.
    #[error("transport unavailable: {0}")]
    Transport(String),
    /// A store read or write failed.
    #[error("persistence failed: {0}")]
    Persistence(String),
    /// Inbound payload could not be parsed or routed.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// Startup configuration is missing or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The periodic job runner could not be built or controlled.
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl From<diesel::result::Error> for EngineError {
    fn from(err: diesel::result::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<diesel::r2d2::PoolError> for EngineError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        EngineError::Persistence(format!("database connection error: {}", err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::MalformedMessage(err.to_string())
    }
}

impl From<crate::bus::mqtt::MqttError> for EngineError {
    fn from(err: crate::bus::mqtt::MqttError) -> Self {
        EngineError::Transport(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
