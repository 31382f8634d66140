//! Shared context handed to handlers and context-aware RPC methods.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use evsched_event::Event;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::engine::EngineState;
use crate::queue::{EventQueue, ReplyQueue};

struct ContextInner {
    name: String,
    token: String,
    queue: Arc<EventQueue>,
    outbound: Arc<ReplyQueue>,
    has_transport: bool,
    transport_lost: AtomicBool,
    state: Arc<RwLock<EngineState>>,
    shutdown: CancellationToken,
    values: DashMap<String, Value>,
}

/// Handle to the engine's queues, identity and shared state.
///
/// Cloning is cheap; every clone refers to the same engine.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.inner.name)
            .field("state", &*self.inner.state.read())
            .field("values", &self.inner.values.len())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(
        name: String,
        token: String,
        queue: Arc<EventQueue>,
        outbound: Arc<ReplyQueue>,
        has_transport: bool,
        state: Arc<RwLock<EngineState>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name,
                token,
                queue,
                outbound,
                has_transport,
                transport_lost: AtomicBool::new(false),
                state,
                shutdown,
                values: DashMap::new(),
            }),
        }
    }

    /// Engine name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The engine's private token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// Current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.inner.state.read()
    }

    /// Queue `event` for local dispatch.
    ///
    /// Events submitted before activation wait in the queue. Returns `false`
    /// when the event was dropped: the engine has stopped or the trigger has
    /// already expired.
    pub fn submit(&self, event: Event) -> bool {
        match self.state() {
            EngineState::Active => {}
            EngineState::Created => {
                warn!(
                    event_type = %event.event_type(),
                    "Engine {} not active yet, event queued until start",
                    self.inner.name
                );
            }
            state @ (EngineState::Stopping | EngineState::Stopped) => {
                warn!(
                    event_type = %event.event_type(),
                    "Engine {} is {:?}, event dropped",
                    self.inner.name,
                    state
                );
                return false;
            }
        }
        self.inner.queue.schedule(event)
    }

    /// Queue `event` to be sent over the transport.
    ///
    /// Returns `false` when no transport is configured, the connection has been
    /// lost, or the engine has stopped.
    pub fn publish(&self, event: Event) -> bool {
        if !self.inner.has_transport {
            warn!(
                event_type = %event.event_type(),
                "Engine {} has no transport, outbound event dropped",
                self.inner.name
            );
            return false;
        }
        if self.is_transport_lost() {
            warn!(
                event_type = %event.event_type(),
                "Engine {} lost its transport, outbound event dropped",
                self.inner.name
            );
            return false;
        }
        if self.state() == EngineState::Stopped {
            warn!(
                event_type = %event.event_type(),
                "Engine {} is stopped, outbound event dropped",
                self.inner.name
            );
            return false;
        }
        self.inner.outbound.push(event);
        true
    }

    /// Whether the transport connection has closed under the engine.
    #[must_use]
    pub fn is_transport_lost(&self) -> bool {
        self.inner.transport_lost.load(Ordering::Acquire)
    }

    pub(crate) fn mark_transport_lost(&self) {
        self.inner.transport_lost.store(true, Ordering::Release);
    }

    /// Ask the engine to stop. Returns immediately; `start` performs the drain.
    pub fn request_stop(&self) {
        self.inner.shutdown.cancel();
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Store a shared value, returning the previous one.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.inner.values.insert(key.into(), value.into())
    }

    /// Read a shared value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.values.get(key).map(|value| value.clone())
    }

    /// Remove a shared value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.values.remove(key).map(|(_, value)| value)
    }
}
