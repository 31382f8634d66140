//! Error types for the engine

use std::any::Any;

use evsched_transport::TransportError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineState;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable reason carried by an RPC error reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    /// No method with the requested name.
    MethodNotFound,
    /// Arguments did not fit the method.
    InvalidArguments,
    /// The method returned an error or panicked.
    ExecutionFailed,
}

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    /// An event could not be built.
    #[error("invalid event: {0}")]
    InvalidEvent(#[source] evsched_event::Error),

    /// No handler is registered for a dispatched event type.
    #[error("no handler registered for event type {event_type}")]
    UnhandledEvent {
        /// The event type that went unhandled.
        event_type: String,
    },

    /// An RPC call named a method that is not registered.
    #[error("rpc method {method} not found")]
    MethodNotFound {
        /// The requested method.
        method: String,
    },

    /// A local handler returned an error or panicked.
    #[error("handler for {event_type} failed: {message}")]
    HandlerExecution {
        /// Type of the event being handled.
        event_type: String,
        /// Rendered error.
        message: String,
    },

    /// An RPC method returned an error or panicked.
    #[error("rpc method {method} failed: {message}")]
    RpcExecution {
        /// The method that failed.
        method: String,
        /// Why it failed.
        code: FaultCode,
        /// Rendered error.
        message: String,
    },

    /// An inbound frame could not be decoded.
    #[error("malformed inbound frame: {0}")]
    TransportDecode(#[source] evsched_event::Error),

    /// The transport could not be opened.
    #[error("transport unavailable: {0}")]
    TransportFatal(#[from] TransportError),

    /// The operation is not allowed in the engine's current state.
    #[error("cannot {operation} while engine is {state:?}")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,
        /// State at the time of the attempt.
        state: EngineState,
    },

    /// The engine was configured inconsistently.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl From<evsched_event::Error> for Error {
    fn from(err: evsched_event::Error) -> Self {
        match err {
            evsched_event::Error::Decode(_) => Self::TransportDecode(err),
            _ => Self::InvalidEvent(err),
        }
    }
}

/// Render a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string())
}
