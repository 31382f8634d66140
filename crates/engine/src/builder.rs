//! Engine builder pattern

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use evsched_event::Event;
use evsched_transport::Transport;

use crate::config::EngineConfig;
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::handlers::{EventHandler, HandlerRegistry};
use crate::rpc::{RpcMethod, RpcMethodRegistry};
use crate::source::EventSource;

/// Engine builder
///
/// Handlers and RPC methods are registered here; the built engine treats both
/// registries as read-only.
pub struct EngineBuilder {
    /// Configuration
    config: EngineConfig,

    /// Transport, required when an endpoint is configured
    transport: Option<Arc<dyn Transport>>,

    /// Local handlers
    handlers: HandlerRegistry,

    /// Remote-callable methods
    methods: RpcMethodRegistry,

    /// Polled event sources
    sources: Vec<Arc<dyn EventSource>>,
}

impl EngineBuilder {
    /// Create a new engine builder with default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: EngineConfig {
                name: name.into(),
                ..EngineConfig::default()
            },
            transport: None,
            handlers: HandlerRegistry::new(),
            methods: RpcMethodRegistry::new(),
            sources: Vec::new(),
        }
    }

    /// Replace the configuration. The builder's name is kept unless the
    /// configuration sets a different one.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        let name = std::mem::take(&mut self.config.name);
        self.config = config;
        if self.config.name == EngineConfig::default().name {
            self.config.name = name;
        }
        self
    }

    /// Set the transport endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = Some(endpoint.into());
        self
    }

    /// Set the transport
    #[must_use]
    pub fn with_transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Set the worker pool size
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers;
        self
    }

    /// Use a prepared handler registry
    #[must_use]
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Use a prepared RPC method registry
    #[must_use]
    pub fn with_methods(mut self, methods: RpcMethodRegistry) -> Self {
        self.methods = methods;
        self
    }

    /// Register an async closure for `event_type`
    #[must_use]
    pub fn on_event<F, Fut>(mut self, event_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(Context, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers.on(event_type, f);
        self
    }

    /// Register a handler for `event_type`
    #[must_use]
    pub fn handler(mut self, event_type: impl Into<String>, handler: impl EventHandler) -> Self {
        self.handlers.register(event_type, handler);
        self
    }

    /// Register an RPC method with the default time budget
    #[must_use]
    pub fn rpc_method(mut self, name: impl Into<String>, method: impl RpcMethod) -> Self {
        self.methods.register(name, method);
        self
    }

    /// Register an RPC method with its own time budget
    #[must_use]
    pub fn rpc_method_with_budget(
        mut self,
        name: impl Into<String>,
        method: impl RpcMethod,
        time_budget: Duration,
    ) -> Self {
        self.methods.register_with_budget(name, method, time_budget);
        self
    }

    /// Poll `source` into the local queue while the engine runs
    #[must_use]
    pub fn with_source(mut self, source: impl EventSource) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    /// Build the engine
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid or an
    /// endpoint and a transport are not given together.
    pub fn build(self) -> Result<Engine> {
        let Self {
            config,
            transport,
            handlers,
            mut methods,
            sources,
        } = self;

        config.validate()?;

        match (&config.endpoint, &transport) {
            (Some(endpoint), None) => {
                return Err(Error::Configuration(format!(
                    "endpoint {endpoint} configured without a transport"
                )));
            }
            (None, Some(_)) => {
                return Err(Error::Configuration(
                    "transport configured without an endpoint".to_string(),
                ));
            }
            _ => {}
        }

        methods.set_default_budget(config.default_time_budget);

        Ok(Engine::new(config, transport, handlers, methods, sources))
    }
}
