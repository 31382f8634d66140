use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use evsched_event::{Event, codec, topics};
use evsched_transport::{Config, ControlFrame, TransportError};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Global registry of bound brokers, keyed by endpoint URL
static GLOBAL_REGISTRY: once_cell::sync::Lazy<Arc<DashMap<String, MemoryBroker>>> =
    once_cell::sync::Lazy::new(|| Arc::new(DashMap::new()));

/// Scheme every memory endpoint must use.
pub const SCHEME: &str = "memory://";

struct Peer {
    topics: HashSet<String>,
    inbox: flume::Sender<Bytes>,
}

struct BrokerInner {
    endpoint: String,
    config: Config,
    peers: DashMap<Uuid, Peer>,
    /// Method name to the private token of the engine serving it
    rpc_methods: DashMap<String, String>,
}

/// In-process pub/sub broker
///
/// Frames are routed to every peer subscribed to exactly the event's channel.
/// Events sent to [`topics::BROKER`] are consumed by the broker itself: it keeps
/// a directory of announced RPC methods and answers discovery requests from it.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("endpoint", &self.inner.endpoint)
            .field("peers", &self.inner.peers.len())
            .field("rpc_methods", &self.inner.rpc_methods.len())
            .finish()
    }
}

impl MemoryBroker {
    /// Bind a broker at `endpoint` with default configuration.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint is malformed or already bound.
    pub fn bind(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        Self::bind_with_config(endpoint, Config::default())
    }

    /// Bind a broker at `endpoint`.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint is malformed or already bound.
    pub fn bind_with_config(
        endpoint: impl Into<String>,
        config: Config,
    ) -> Result<Self, TransportError> {
        let endpoint = endpoint.into();
        validate_endpoint(&endpoint)?;

        let broker = Self {
            inner: Arc::new(BrokerInner {
                endpoint: endpoint.clone(),
                config,
                peers: DashMap::new(),
                rpc_methods: DashMap::new(),
            }),
        };

        match GLOBAL_REGISTRY.entry(endpoint.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::Other(format!(
                    "endpoint {endpoint} already has a broker"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(broker.clone());
            }
        }

        info!("Memory broker bound at {}", endpoint);
        Ok(broker)
    }

    /// Look up the broker bound at `endpoint`.
    pub(crate) fn lookup(endpoint: &str) -> Result<Self, TransportError> {
        validate_endpoint(endpoint)?;
        GLOBAL_REGISTRY
            .get(endpoint)
            .map(|broker| broker.clone())
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no broker at {endpoint}")))
    }

    /// Endpoint this broker is bound to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Snapshot of the method directory.
    #[must_use]
    pub fn rpc_methods(&self) -> HashMap<String, String> {
        self.inner
            .rpc_methods
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Number of attached peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Whether any peer is subscribed to `topic`.
    #[must_use]
    pub fn has_subscriber(&self, topic: &str) -> bool {
        self.inner
            .peers
            .iter()
            .any(|peer| peer.topics.contains(topic))
    }

    /// Unbind the broker and disconnect every peer.
    pub fn shutdown(&self) {
        GLOBAL_REGISTRY.remove(&self.inner.endpoint);
        self.inner.peers.clear();
        self.inner.rpc_methods.clear();
        info!("Memory broker at {} shut down", self.inner.endpoint);
    }

    /// Clear all global state (useful for tests)
    pub fn clear_global_state() {
        GLOBAL_REGISTRY.clear();
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn attach(&self) -> (Uuid, flume::Receiver<Bytes>) {
        let (inbox, receiver) = flume::bounded(self.inner.config.inbox_capacity);
        let id = Uuid::new_v4();
        self.inner.peers.insert(
            id,
            Peer {
                topics: HashSet::new(),
                inbox,
            },
        );
        debug!("Peer {} attached to {}", id, self.inner.endpoint);
        (id, receiver)
    }

    pub(crate) fn detach(&self, peer_id: Uuid) {
        if let Some((_, peer)) = self.inner.peers.remove(&peer_id) {
            for topic in &peer.topics {
                self.prune_token(topic);
            }
            debug!("Peer {} detached from {}", peer_id, self.inner.endpoint);
        }
    }

    pub(crate) fn apply_control(&self, peer_id: Uuid, frame: &[u8]) -> Result<(), TransportError> {
        let control = ControlFrame::decode(frame)?;
        let mut peer = self
            .inner
            .peers
            .get_mut(&peer_id)
            .ok_or(TransportError::ConnectionClosed)?;

        match control {
            ControlFrame::Subscribe(topic) => {
                debug!("Peer {} subscribed to {}", peer_id, topic);
                peer.topics.insert(topic);
            }
            ControlFrame::Unsubscribe(topic) => {
                debug!("Peer {} unsubscribed from {}", peer_id, topic);
                peer.topics.remove(&topic);
                drop(peer);
                self.prune_token(&topic);
            }
        }
        Ok(())
    }

    pub(crate) async fn publish(&self, data: Bytes) -> Result<(), TransportError> {
        let event = match codec::decode(&data) {
            Ok(event) => event,
            Err(e) => {
                warn!("Memory broker dropping undecodable frame: {}", e);
                return Ok(());
            }
        };

        if event.channel() == topics::BROKER {
            return self.handle_broker_event(&event).await;
        }

        self.route(event.channel(), &data);
        Ok(())
    }

    /// Deliver without waiting: a peer whose inbox is full misses the frame.
    fn route(&self, channel: &str, data: &Bytes) {
        let inboxes: Vec<(Uuid, flume::Sender<Bytes>)> = self
            .inner
            .peers
            .iter()
            .filter(|peer| peer.topics.contains(channel))
            .map(|peer| (*peer.key(), peer.inbox.clone()))
            .collect();

        if inboxes.is_empty() {
            debug!("No subscribers for {}, frame dropped", channel);
            return;
        }

        for (peer_id, inbox) in inboxes {
            match inbox.try_send(data.clone()) {
                Ok(()) => {}
                Err(flume::TrySendError::Full(_)) => {
                    warn!("Peer {} inbox full, frame on {} dropped", peer_id, channel);
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    debug!("Peer {} went away during delivery", peer_id);
                }
            }
        }
    }

    async fn handle_broker_event(&self, event: &Event) -> Result<(), TransportError> {
        match event.event_type() {
            topics::RPC_METHODS => {
                let Some(methods) = event.payload().as_object() else {
                    warn!("Ignoring method announcement without a mapping payload");
                    return Ok(());
                };
                for (method, token) in methods {
                    if let Some(token) = token.as_str() {
                        self.inner
                            .rpc_methods
                            .insert(method.clone(), token.to_string());
                    }
                }
                info!(
                    "Memory broker at {} now knows {} rpc methods",
                    self.inner.endpoint,
                    self.inner.rpc_methods.len()
                );
                Ok(())
            }
            topics::GET_RPC_METHODS => {
                let directory: serde_json::Map<String, Value> = self
                    .rpc_methods()
                    .into_iter()
                    .map(|(method, token)| (method, Value::String(token)))
                    .collect();

                let Some(reply_to) = event.reply_to() else {
                    warn!("Discovery request to broker without reply_to, dropped");
                    return Ok(());
                };
                let reply = Event::builder(topics::RPC_METHODS)
                    .payload(Value::Object(directory))
                    .channel(reply_to)
                    .correlation_id(event.id())
                    .build()
                    .map_err(|e| TransportError::Other(e.to_string()))?;
                let frame =
                    codec::encode(&reply).map_err(|e| TransportError::Other(e.to_string()))?;
                self.route(reply.channel(), &frame);
                Ok(())
            }
            other => {
                warn!("Memory broker ignoring {} addressed to it", other);
                Ok(())
            }
        }
    }

    fn prune_token(&self, topic: &str) {
        if !topic.starts_with(topics::TOKEN_PREFIX) || self.has_subscriber(topic) {
            return;
        }
        let before = self.inner.rpc_methods.len();
        self.inner.rpc_methods.retain(|_, token| token != topic);
        let pruned = before - self.inner.rpc_methods.len();
        if pruned > 0 {
            info!("Pruned {} rpc methods served by {}", pruned, topic);
        }
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), TransportError> {
    match endpoint.strip_prefix(SCHEME) {
        Some(name) if !name.is_empty() => Ok(()),
        _ => Err(TransportError::InvalidAddress(format!(
            "expected {SCHEME}<name>, got {endpoint}"
        ))),
    }
}
