//! Priority event scheduler with a pub/sub RPC layer
//!
//! An [`Engine`] drains a time- and priority-ordered queue of events into a
//! bounded worker pool, dispatching each to the handler registered for its
//! type. With a [`Transport`](evsched_transport::Transport) attached it also
//! exchanges events with other engines and serves remote calls to its
//! [`RpcMethod`]s.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builder for the engine
pub mod builder;

/// Configuration types
pub mod config;

/// Context shared with handlers
pub mod context;

/// Engine - lifecycle and loops
pub mod engine;

/// Error types
pub mod error;

/// Local event handlers
pub mod handlers;

/// Priority and outbound queues
pub mod queue;

/// Remote-callable methods
pub mod rpc;

/// Polled external event sources
pub mod source;

pub use {
    builder::EngineBuilder,
    config::EngineConfig,
    context::Context,
    engine::{Engine, EngineState},
    error::{Error, FaultCode, Result},
    handlers::{EventHandler, HandlerRegistry},
    queue::{EventQueue, ReplyQueue},
    rpc::{RpcArgs, RpcFault, RpcMethod, RpcMethodRegistry, typed, typed_with_context},
    source::{EventSource, source_fn},
};

pub use evsched_event::{DailyZone, Event, Schedule, Trigger, TriggerStatus, topics};
