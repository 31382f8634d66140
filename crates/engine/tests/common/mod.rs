//! Shared helpers for engine integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use evsched_engine::{Engine, EngineBuilder, Event, Result};
use evsched_transport::{Readiness, Transport, TransportError};
use evsched_transport_memory::{MemoryBroker, MemoryTransport};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Upper bound for any single test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind a broker at a fresh endpoint.
pub fn broker(prefix: &str) -> MemoryBroker {
    let endpoint = format!("memory://{prefix}-{}", uuid::Uuid::new_v4());
    MemoryBroker::bind(endpoint).expect("Failed to bind broker")
}

/// Builder for an engine attached to `broker` through a memory transport.
pub fn networked(name: &str, broker: &MemoryBroker) -> EngineBuilder {
    Engine::builder(name)
        .with_endpoint(broker.endpoint())
        .with_transport(MemoryTransport::new())
}

/// Run `engine` on a background task.
pub fn spawn(engine: &Engine) -> JoinHandle<Result<()>> {
    let engine = engine.clone();
    tokio::spawn(async move { engine.start().await })
}

/// Stop `engine` and wait for its `start` task to return.
pub async fn shutdown(engine: &Engine, running: JoinHandle<Result<()>>) {
    engine.stop().await;
    tokio::time::timeout(TEST_TIMEOUT, running)
        .await
        .expect("Engine did not stop in time")
        .expect("Engine task panicked")
        .expect("Engine returned an error");
}

/// Poll `condition` until it holds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}

/// Register a handler for `event_type` that forwards every event it sees.
pub fn collect(
    builder: EngineBuilder,
    event_type: &str,
) -> (EngineBuilder, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let builder = builder.on_event(event_type, move |_ctx, event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
            Ok(())
        }
    });
    (builder, rx)
}

/// Receive the next collected event.
pub async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Collector closed")
}

/// Transport that replays scripted inbound frames and records what is sent.
#[derive(Debug, Default, Clone)]
pub struct ScriptedTransport {
    inbound: Arc<Mutex<VecDeque<Bytes>>>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    refuse_connect: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            refuse_connect: true,
            ..Self::default()
        }
    }

    pub fn feed(&self, frame: impl Into<Bytes>) {
        self.inbound.lock().push_back(frame.into());
    }

    pub fn sent(&self) -> Vec<Event> {
        self.sent
            .lock()
            .iter()
            .filter_map(|frame| evsched_event::codec::decode(frame).ok())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, url: &str) -> std::result::Result<(), TransportError> {
        if self.refuse_connect {
            return Err(TransportError::ConnectionFailed(format!("refused {url}")));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> std::result::Result<(), TransportError> {
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> std::result::Result<(), TransportError> {
        self.subscriptions.lock().retain(|t| t != topic);
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> std::result::Result<Readiness, TransportError> {
        if self.inbound.lock().is_empty() {
            tokio::time::sleep(timeout).await;
        }
        Ok(Readiness {
            readable: !self.inbound.lock().is_empty(),
            writable: true,
        })
    }

    async fn receive(&self) -> std::result::Result<Bytes, TransportError> {
        self.inbound
            .lock()
            .pop_front()
            .ok_or(TransportError::WouldBlock)
    }

    async fn send(&self, data: Bytes) -> std::result::Result<(), TransportError> {
        self.sent.lock().push(data);
        Ok(())
    }

    async fn close(&self) -> std::result::Result<(), TransportError> {
        Ok(())
    }
}
