use thiserror::Error;

/// Result type alias for event operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or coding events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Construction input was rejected.
    #[error("invalid event: {reason}")]
    InvalidEvent {
        /// Why the event was rejected.
        reason: String,
    },

    /// A trigger could not be built from the given schedule.
    #[error("invalid trigger: {reason}")]
    InvalidTrigger {
        /// Why the trigger was rejected.
        reason: String,
    },

    /// Serialization failed.
    #[error("failed to encode event: {0}")]
    Encode(String),

    /// Deserialization failed.
    #[error("failed to decode event: {0}")]
    Decode(String),
}
