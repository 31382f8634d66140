//! Publish/subscribe transport abstraction used by the engine.
//!
//! A transport connects to one endpoint, subscribes to topics, and moves opaque
//! frames. Routing by topic is the transport's business; the engine only sees
//! bytes. Concrete implementations live in separate crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Error types.
pub mod error;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

pub use error::TransportError;
pub use error::TransportError as Error;

/// Readiness reported by [`Transport::poll`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// A frame is waiting to be received.
    pub readable: bool,
    /// A frame can be sent without blocking.
    pub writable: bool,
}

impl Readiness {
    /// Neither readable nor writable.
    pub const IDLE: Self = Self {
        readable: false,
        writable: false,
    };
}

/// Pub/sub transport
///
/// Implementations must be safe to share between the task that polls and
/// receives and the tasks that send.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Connect to the endpoint at `url`.
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Start receiving frames published to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Stop receiving frames published to `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the connection to become readable.
    ///
    /// Returns as soon as a frame is available; otherwise reports writability
    /// once the timeout elapses.
    async fn poll(&self, timeout: Duration) -> Result<Readiness, TransportError>;

    /// Take the next inbound frame. Only valid after `poll` reported readable.
    async fn receive(&self) -> Result<Bytes, TransportError>;

    /// Publish one frame.
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Flag byte for a subscribe control frame.
pub const SUBSCRIBE_FLAG: u8 = 0x01;

/// Flag byte for an unsubscribe control frame.
pub const UNSUBSCRIBE_FLAG: u8 = 0x00;

/// Subscription change sent from a subscriber to the broker.
///
/// On the wire this is one flag byte followed by the UTF-8 topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Start delivering `topic`.
    Subscribe(String),
    /// Stop delivering `topic`.
    Unsubscribe(String),
}

impl ControlFrame {
    /// Topic the frame refers to.
    #[must_use]
    pub fn topic(&self) -> &str {
        match self {
            Self::Subscribe(topic) | Self::Unsubscribe(topic) => topic,
        }
    }

    /// Encode as flag byte plus topic.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let (flag, topic) = match self {
            Self::Subscribe(topic) => (SUBSCRIBE_FLAG, topic),
            Self::Unsubscribe(topic) => (UNSUBSCRIBE_FLAG, topic),
        };

        let mut buf = BytesMut::with_capacity(1 + topic.len());
        buf.put_u8(flag);
        buf.put_slice(topic.as_bytes());
        buf.freeze()
    }

    /// Decode a control frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidControlFrame`] for an empty frame, an
    /// unknown flag, or a topic that is not UTF-8.
    pub fn decode(frame: &[u8]) -> Result<Self, TransportError> {
        let (&flag, topic) = frame
            .split_first()
            .ok_or_else(|| TransportError::InvalidControlFrame("empty frame".to_string()))?;

        let topic = std::str::from_utf8(topic)
            .map_err(|e| TransportError::InvalidControlFrame(e.to_string()))?
            .to_string();

        match flag {
            SUBSCRIBE_FLAG => Ok(Self::Subscribe(topic)),
            UNSUBSCRIBE_FLAG => Ok(Self::Unsubscribe(topic)),
            other => Err(TransportError::InvalidControlFrame(format!(
                "unknown flag {other:#04x}"
            ))),
        }
    }
}

/// Configuration shared by transport implementations
#[derive(Debug, Clone)]
pub struct Config {
    /// Frames buffered per subscriber; further frames to a full inbox are dropped
    pub inbox_capacity: usize,
    /// Largest frame accepted by `send`
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            max_frame_size: 10 * 1024 * 1024, // 10MB
        }
    }
}
