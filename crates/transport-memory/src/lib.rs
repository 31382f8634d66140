//! In-memory transport implementation for testing
//!
//! A [`MemoryBroker`] bound at a `memory://` endpoint routes frames between
//! every [`MemoryTransport`] connected to it within the same process.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;

pub use broker::{MemoryBroker, SCHEME};

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use evsched_transport::{ControlFrame, Readiness, Transport, TransportError};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
struct Link {
    broker: MemoryBroker,
    peer_id: Uuid,
    inbox: flume::Receiver<Bytes>,
}

/// Memory transport implementation
#[derive(Default)]
pub struct MemoryTransport {
    link: Mutex<Option<Link>>,
    pending: Mutex<Option<Bytes>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&self) -> Result<Link, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        self.link.lock().clone().ok_or(TransportError::NotConnected)
    }
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field(
                "peer_id",
                &self.link.lock().as_ref().map(|link| link.peer_id),
            )
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut link = self.link.lock();
        if link.is_some() {
            debug!("Memory transport already connected");
            return Ok(());
        }

        let broker = MemoryBroker::lookup(url)?;
        let (peer_id, inbox) = broker.attach();
        *link = Some(Link {
            broker,
            peer_id,
            inbox,
        });

        info!("Memory transport {} connected to {}", peer_id, url);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let link = self.link()?;
        let frame = ControlFrame::Subscribe(topic.to_string()).encode();
        link.broker.apply_control(link.peer_id, &frame)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let link = self.link()?;
        let frame = ControlFrame::Unsubscribe(topic.to_string()).encode();
        link.broker.apply_control(link.peer_id, &frame)
    }

    async fn poll(&self, timeout: Duration) -> Result<Readiness, TransportError> {
        let link = self.link()?;

        if self.pending.lock().is_some() {
            return Ok(Readiness {
                readable: true,
                writable: true,
            });
        }

        match tokio::time::timeout(timeout, link.inbox.recv_async()).await {
            Ok(Ok(frame)) => {
                *self.pending.lock() = Some(frame);
                Ok(Readiness {
                    readable: true,
                    writable: true,
                })
            }
            Ok(Err(_)) => {
                self.closed.store(true, Ordering::Release);
                Err(TransportError::ConnectionClosed)
            }
            Err(_) => Ok(Readiness {
                readable: false,
                writable: true,
            }),
        }
    }

    async fn receive(&self) -> Result<Bytes, TransportError> {
        let link = self.link()?;

        if let Some(frame) = self.pending.lock().take() {
            return Ok(frame);
        }

        match link.inbox.try_recv() {
            Ok(frame) => Ok(frame),
            Err(flume::TryRecvError::Empty) => Err(TransportError::WouldBlock),
            Err(flume::TryRecvError::Disconnected) => {
                self.closed.store(true, Ordering::Release);
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let link = self.link()?;

        let max = link.broker.config().max_frame_size;
        if data.len() > max {
            return Err(TransportError::Other(format!(
                "frame of {} bytes exceeds limit of {max}",
                data.len()
            )));
        }

        debug!("Memory transport {} sending {} bytes", link.peer_id, data.len());
        link.broker.publish(data).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(link) = self.link.lock().take() {
            link.broker.detach(link.peer_id);
            debug!("Closed memory transport {}", link.peer_id);
        }
        self.pending.lock().take();
        Ok(())
    }
}
