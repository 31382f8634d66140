//! Event type to handler mapping and contained dispatch.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use evsched_event::Event;
use futures::FutureExt;
use tracing::{debug, error, instrument, warn};

use crate::context::Context;
use crate::error::{Error, Result, panic_message};

/// Local event handler
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event.
    async fn handle(&self, ctx: Context, event: Event) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Context, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: Context, event: Event) -> anyhow::Result<()> {
        (self.f)(ctx, event).await
    }
}

/// Maps each event type to exactly one handler.
///
/// Registering a type twice replaces the earlier handler. The same handler may
/// be shared between several types with [`HandlerRegistry::register_shared`].
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`.
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        handler: impl EventHandler,
    ) -> &mut Self {
        self.register_shared(event_type, Arc::new(handler))
    }

    /// Register an async closure for `event_type`.
    pub fn on<F, Fut>(&mut self, event_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Context, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(event_type, FnHandler { f })
    }

    /// Register an already shared handler for `event_type`.
    pub fn register_shared(
        &mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        let event_type = event_type.into();
        if self.handlers.insert(event_type.clone(), handler).is_some() {
            warn!("Handler for {} replaced by a later registration", event_type);
        } else {
            debug!("Registered handler for {}", event_type);
        }
        self
    }

    /// Remove the handler for `event_type`. Returns whether one was registered.
    pub fn unregister(&mut self, event_type: &str) -> bool {
        self.handlers.remove(event_type).is_some()
    }

    /// Whether `event_type` has a handler.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Registered event types, sorted.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Run the handler for `event`.
    ///
    /// Nothing escapes: a missing handler, an error, or a panic is logged and
    /// returned so the caller can observe it, but never raised further.
    ///
    /// # Errors
    ///
    /// [`Error::UnhandledEvent`] if no handler is registered, and
    /// [`Error::HandlerExecution`] if the handler failed or panicked.
    #[instrument(skip(self, ctx, event), fields(event_type = %event.event_type(), event_id = %event.id()))]
    pub async fn dispatch(&self, ctx: Context, event: Event) -> Result<()> {
        let Some(handler) = self.handlers.get(event.event_type()).cloned() else {
            warn!(payload = %event.payload(), "No handler registered, event dropped");
            return Err(Error::UnhandledEvent {
                event_type: event.event_type().to_string(),
            });
        };

        let event_type = event.event_type().to_string();
        let payload = event.payload().clone();

        let message = match AssertUnwindSafe(handler.handle(ctx, event))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };

        error!(%payload, "Handler for {} failed: {}", event_type, message);
        Err(Error::HandlerExecution {
            event_type,
            message,
        })
    }
}
