//! Main event engine
//!
//! Runs two loops until stopped. The local loop drains the priority queue into
//! the worker pool. The transport loop, present only when a transport is
//! configured, classifies inbound frames and sends queued outbound events.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use evsched_event::{Event, codec, topics};
use evsched_transport::{Transport, TransportError};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::builder::EngineBuilder;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::handlers::HandlerRegistry;
use crate::queue::{EventQueue, ReplyQueue};
use crate::rpc::{RpcFault, RpcMethodRegistry};
use crate::source::{EventSource, poll_source};

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, not yet activated
    Created,
    /// Accepting and dispatching events
    Active,
    /// Draining in-flight work
    Stopping,
    /// Stopped; terminal
    Stopped,
}

struct EngineInner {
    config: EngineConfig,
    token: String,
    context: Context,
    queue: Arc<EventQueue>,
    outbound: Arc<ReplyQueue>,
    handlers: Arc<HandlerRegistry>,
    methods: Arc<RpcMethodRegistry>,
    sources: Vec<Arc<dyn EventSource>>,
    transport: Option<Arc<dyn Transport>>,
    state: Arc<RwLock<EngineState>>,
    cancel: CancellationToken,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    transport_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    finish_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
}

/// Event scheduler and RPC endpoint
///
/// Handles are cheap to clone, so one task can run [`Engine::start`] while
/// another calls [`Engine::stop`].
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .field("queued", &self.inner.queue.len())
            .field("handlers", &self.inner.handlers)
            .field("methods", &self.inner.methods)
            .field("sources", &self.inner.sources.len())
            .field("transport", &self.inner.transport)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start building an engine named `name`.
    pub fn builder(name: impl Into<String>) -> EngineBuilder {
        EngineBuilder::new(name)
    }

    pub(crate) fn new(
        config: EngineConfig,
        transport: Option<Arc<dyn Transport>>,
        handlers: HandlerRegistry,
        methods: RpcMethodRegistry,
        sources: Vec<Arc<dyn EventSource>>,
    ) -> Self {
        let token = format!(
            "{}{}",
            topics::TOKEN_PREFIX,
            hex::encode(rand::random::<[u8; 16]>())
        );
        let queue = Arc::new(EventQueue::new());
        let outbound = Arc::new(ReplyQueue::new());
        let state = Arc::new(RwLock::new(EngineState::Created));
        let cancel = CancellationToken::new();

        let context = Context::new(
            config.name.clone(),
            token.clone(),
            queue.clone(),
            outbound.clone(),
            transport.is_some(),
            state.clone(),
            cancel.clone(),
        );

        Self {
            inner: Arc::new(EngineInner {
                workers: Arc::new(Semaphore::new(config.max_workers)),
                config,
                token,
                context,
                queue,
                outbound,
                handlers: Arc::new(handlers),
                methods: Arc::new(methods),
                sources,
                transport,
                state,
                cancel,
                tracker: TaskTracker::new(),
                transport_task: parking_lot::Mutex::new(None),
                finish_lock: tokio::sync::Mutex::new(()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Engine name, also its direct-address topic.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Private token: reply channel and discovery address.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.inner.state.read()
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Context shared with handlers.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Names of the registered RPC methods, sorted.
    #[must_use]
    pub fn rpc_methods(&self) -> Vec<String> {
        self.inner.methods.methods()
    }

    /// Queue `event` for local dispatch. See [`Context::submit`].
    pub fn submit(&self, event: Event) -> bool {
        self.inner.context.submit(event)
    }

    /// Queue `event` for sending over the transport. See [`Context::publish`].
    pub fn publish(&self, event: Event) -> bool {
        self.inner.context.publish(event)
    }

    /// Activate the engine without running its loops.
    ///
    /// Queues the init event and, with a transport, connects, subscribes to the
    /// engine's name, the broadcast topic and its token, and announces its RPC
    /// methods. Activating an active engine does nothing.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] once the engine is stopping or stopped, and
    /// [`Error::TransportFatal`] if the transport cannot be opened. A transport
    /// failure leaves the engine stopped.
    pub async fn activate(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            match *state {
                EngineState::Created => *state = EngineState::Active,
                EngineState::Active => return Ok(()),
                other => {
                    return Err(Error::InvalidState {
                        operation: "activate",
                        state: other,
                    });
                }
            }
        }

        let init = Event::builder(topics::INIT)
            .channel(self.name())
            .build()?;
        self.inner.queue.schedule(init);

        if let Some(transport) = &self.inner.transport {
            if let Err(e) = self.open_transport(transport.as_ref()).await {
                error!("Engine {} could not open its transport: {}", self.name(), e);
                if let Err(e) = transport.close().await {
                    warn!("Closing transport for {} failed: {}", self.name(), e);
                }
                self.inner.cancel.cancel();
                *self.inner.state.write() = EngineState::Stopped;
                return Err(e);
            }
        }

        info!(
            "Engine {} active with {} rpc methods",
            self.name(),
            self.inner.methods.len()
        );
        Ok(())
    }

    async fn open_transport(&self, transport: &dyn Transport) -> Result<()> {
        let endpoint = self.inner.config.endpoint.as_deref().ok_or_else(|| {
            Error::Configuration("transport configured without an endpoint".to_string())
        })?;

        transport.connect(endpoint).await?;
        for topic in [self.name(), topics::BROADCAST, self.token()] {
            transport.subscribe(topic).await?;
        }

        if !self.inner.methods.is_empty() {
            let announcement = Event::builder(topics::RPC_METHODS)
                .payload(self.method_directory())
                .channel(self.inner.config.broker_topic.as_str())
                .build()?;
            transport.send(codec::encode(&announcement)?).await?;
            debug!(
                "Engine {} announced its rpc methods to {}",
                self.name(),
                self.inner.config.broker_topic
            );
        }

        Ok(())
    }

    /// Run the engine until it is stopped.
    ///
    /// Activates the engine, spawns the transport loop if a transport is
    /// configured and one polling task per event source, and drains the local queue on the calling task. Returns once
    /// [`Engine::stop`] or [`Context::request_stop`] has been called and
    /// in-flight work has drained.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the engine was already started or stopped,
    /// and [`Error::TransportFatal`] if the transport cannot be opened.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState {
                operation: "start",
                state: self.state(),
            });
        }

        self.activate().await?;

        if let Some(transport) = self.inner.transport.clone() {
            let engine = self.clone();
            let handle = tokio::spawn(async move { engine.run_transport_loop(transport).await });
            *self.inner.transport_task.lock() = Some(handle);
        }

        for source in &self.inner.sources {
            self.inner.tracker.spawn(poll_source(
                source.clone(),
                self.inner.context.clone(),
                self.inner.config.source_poll_interval,
                self.inner.cancel.clone(),
            ));
        }

        self.run_local_loop().await;
        self.finish().await;
        Ok(())
    }

    /// Stop dispatching, wait for in-flight work, and close the transport.
    ///
    /// Safe to call from any task and more than once.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.finish().await;
    }

    async fn run_local_loop(&self) {
        let inner = &self.inner;
        debug!("Local loop for {} started", self.name());

        loop {
            let next = tokio::select! {
                biased;
                () = inner.cancel.cancelled() => break,
                next = inner.queue.pop(inner.config.queue_poll_interval) => next,
            };
            let Some(event) = next else {
                continue;
            };

            if event.event_type() == topics::INIT && !inner.handlers.contains(topics::INIT) {
                debug!("No init handler registered for {}", self.name());
                continue;
            }

            let permit = tokio::select! {
                biased;
                () = inner.cancel.cancelled() => {
                    debug!(event_type = %event.event_type(), "Engine stopping, event not dispatched");
                    break;
                }
                permit = inner.workers.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                break;
            };

            let handlers = inner.handlers.clone();
            let ctx = inner.context.clone();
            inner.tracker.spawn(async move {
                let _permit = permit;
                let _ = handlers.dispatch(ctx, event).await;
            });
        }

        debug!("Local loop for {} exited", self.name());
    }

    async fn run_transport_loop(self, transport: Arc<dyn Transport>) {
        let inner = &self.inner;
        debug!("Transport loop for {} started", self.name());

        loop {
            let wait = if inner.outbound.is_empty() {
                inner.config.transport_poll_timeout
            } else {
                Duration::ZERO
            };

            let polled = tokio::select! {
                biased;
                () = inner.cancel.cancelled() => break,
                () = inner.outbound.notified(), if !wait.is_zero() => continue,
                polled = transport.poll(wait) => polled,
            };

            let readiness = match polled {
                Ok(readiness) => readiness,
                Err(TransportError::ConnectionClosed) => {
                    self.transport_lost();
                    break;
                }
                Err(e) => {
                    warn!("Transport poll for {} failed: {}", self.name(), e);
                    tokio::select! {
                        () = inner.cancel.cancelled() => break,
                        () = tokio::time::sleep(inner.config.transport_poll_timeout) => continue,
                    }
                }
            };

            if readiness.readable {
                match transport.receive().await {
                    Ok(frame) => self.handle_inbound(&frame),
                    Err(TransportError::WouldBlock) => {}
                    Err(TransportError::ConnectionClosed) => {
                        self.transport_lost();
                        break;
                    }
                    Err(e) => warn!("Receive on {} failed: {}", self.name(), e),
                }
            }

            if readiness.writable {
                if let Some(event) = inner.outbound.try_pop() {
                    let sent = tokio::select! {
                        biased;
                        () = inner.cancel.cancelled() => {
                            inner.outbound.push(event.clone());
                            break;
                        }
                        sent = self.send(transport.as_ref(), &event) => sent,
                    };
                    if let Err(TransportError::ConnectionClosed) = sent {
                        self.transport_lost();
                        break;
                    }
                }
            }
        }

        debug!("Transport loop for {} exited", self.name());
    }

    fn transport_lost(&self) {
        self.inner.context.mark_transport_lost();
        let dropped = self.inner.outbound.clear();
        error!(
            "Transport for {} closed, transport loop exiting with {} outbound events dropped",
            self.name(),
            dropped
        );
    }

    fn handle_inbound(&self, frame: &Bytes) {
        let event = match codec::decode(frame) {
            Ok(event) => event,
            Err(e) => {
                let err = Error::TransportDecode(e);
                warn!(len = frame.len(), "Dropping inbound frame: {}", err);
                return;
            }
        };

        if !event.is_request() {
            debug!(
                event_type = %event.event_type(),
                channel = %event.channel(),
                "Inbound event queued"
            );
            self.inner.queue.schedule(event);
            return;
        }

        if event.channel() != self.token() {
            warn!(
                event_type = %event.event_type(),
                channel = %event.channel(),
                reply_to = ?event.reply_to(),
                "Request not addressed to this engine's token, dropped"
            );
            return;
        }

        if event.event_type() == topics::GET_RPC_METHODS {
            self.answer_discovery(&event);
        } else {
            self.spawn_rpc(event);
        }
    }

    fn answer_discovery(&self, request: &Event) {
        let Some(reply_to) = request.reply_to() else {
            return;
        };
        let reply = Event::builder(topics::RPC_METHODS)
            .payload(self.method_directory())
            .channel(reply_to)
            .correlation_id(request.id())
            .build();

        match reply {
            Ok(reply) => {
                self.inner.context.publish(reply);
            }
            Err(e) => warn!("Cannot answer discovery request from {}: {}", reply_to, e),
        }
    }

    fn spawn_rpc(&self, call: Event) {
        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            let Ok(_permit) = inner.workers.clone().acquire_owned().await else {
                return;
            };

            let payload = match inner.methods.execute(inner.context.clone(), &call).await {
                Ok(value) => value,
                Err(err) => RpcFault::from(&err).to_payload(),
            };

            if let Some(reply) = call.reply(payload) {
                inner.context.publish(reply);
            }
        });
    }

    fn method_directory(&self) -> Value {
        let directory: Map<String, Value> = self
            .inner
            .methods
            .methods()
            .into_iter()
            .map(|method| (method, Value::String(self.inner.token.clone())))
            .collect();
        Value::Object(directory)
    }

    async fn send(
        &self,
        transport: &dyn Transport,
        event: &Event,
    ) -> std::result::Result<(), TransportError> {
        let frame = match codec::encode(event) {
            Ok(frame) => frame,
            Err(e) => {
                error!(event_type = %event.event_type(), "Cannot encode outbound event: {}", e);
                return Ok(());
            }
        };

        transport.send(frame).await.inspect_err(|e| {
            warn!(
                event_type = %event.event_type(),
                channel = %event.channel(),
                "Outbound event from {} dropped: {}",
                self.name(),
                e
            );
        })
    }

    async fn finish(&self) {
        let inner = &self.inner;
        let _guard = inner.finish_lock.lock().await;

        let was_active = {
            let mut state = inner.state.write();
            match *state {
                EngineState::Stopped => return,
                EngineState::Created => {
                    *state = EngineState::Stopped;
                    false
                }
                EngineState::Active | EngineState::Stopping => {
                    *state = EngineState::Stopping;
                    true
                }
            }
        };
        inner.cancel.cancel();

        if !was_active {
            info!("Engine {} stopped before activation", self.name());
            return;
        }
        info!("Engine {} stopping", self.name());

        let transport_task = inner.transport_task.lock().take();
        if let Some(mut task) = transport_task {
            match tokio::time::timeout(inner.config.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Transport loop for {} ended abnormally: {}", self.name(), e),
                Err(_) => {
                    warn!(
                        "Transport loop for {} did not exit within {:?}, aborting it",
                        self.name(),
                        inner.config.shutdown_timeout
                    );
                    task.abort();
                }
            }
        }

        inner.tracker.close();
        if tokio::time::timeout(inner.config.shutdown_timeout, inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "Engine {} gave up on {} in-flight tasks after {:?}",
                self.name(),
                inner.tracker.len(),
                inner.config.shutdown_timeout
            );
        }

        if let Some(transport) = &inner.transport {
            while let Some(event) = inner.outbound.try_pop() {
                if self.send(transport.as_ref(), &event).await.is_err() {
                    break;
                }
            }
            if let Err(e) = transport.close().await {
                warn!("Closing transport for {} failed: {}", self.name(), e);
            }
        }

        *inner.state.write() = EngineState::Stopped;
        info!("Engine {} stopped", self.name());
    }
}
