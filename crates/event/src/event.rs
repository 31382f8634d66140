use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::topics;
use crate::trigger::Trigger;

/// Priority given to events that do not set one. Lower numbers run first.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Immutable routed message and unit of scheduled work.
///
/// Fields are private; use [`Event::builder`] to construct one. The trigger is
/// a local scheduling concern and is never written to the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: Uuid,

    #[serde(rename = "type")]
    event_type: String,

    #[serde(default)]
    payload: Value,

    channel: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Uuid>,

    #[serde(default = "default_priority")]
    priority: i32,

    #[serde(skip)]
    trigger: Option<Trigger>,
}

const fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl Event {
    /// Build an immediately eligible broadcast event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] if `event_type` is empty.
    pub fn new(event_type: impl Into<String>, payload: impl Into<Value>) -> Result<Self> {
        Self::builder(event_type).payload(payload).build()
    }

    /// Start building an event of the given type.
    pub fn builder(event_type: impl Into<String>) -> EventBuilder {
        EventBuilder::new(event_type)
    }

    /// Unique id assigned at construction.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Routing key used to select a handler or RPC method.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Opaque payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Destination topic.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Topic a reply should be sent to, if this is a request.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Id of the request this event answers.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Scheduling priority. Lower numbers run first.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Schedule attached to this event.
    #[must_use]
    pub const fn trigger(&self) -> Option<&Trigger> {
        self.trigger.as_ref()
    }

    /// Whether a reply is expected.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Build the reply to this request, addressed to its `reply_to` topic.
    ///
    /// The reply keeps the request's type and priority and carries the request
    /// id as its correlation id. Returns `None` when no reply was requested.
    #[must_use]
    pub fn reply(&self, payload: Value) -> Option<Self> {
        let channel = self.reply_to.clone()?;
        Some(Self {
            id: Uuid::new_v4(),
            event_type: self.event_type.clone(),
            payload,
            channel,
            reply_to: None,
            correlation_id: Some(self.id),
            priority: self.priority,
            trigger: None,
        })
    }

    /// Copy of this event with a different trigger. The copy keeps the same id.
    #[must_use]
    pub fn with_trigger(&self, trigger: Option<Trigger>) -> Self {
        Self {
            trigger,
            ..self.clone()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.event_type.is_empty() {
            return Err(Error::InvalidEvent {
                reason: "event type must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`Event`].
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_type: String,
    payload: Value,
    channel: String,
    reply_to: Option<String>,
    correlation_id: Option<Uuid>,
    priority: i32,
    trigger: Option<Trigger>,
}

impl EventBuilder {
    fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Value::Null,
            channel: topics::BROADCAST.to_string(),
            reply_to: None,
            correlation_id: None,
            priority: DEFAULT_PRIORITY,
            trigger: None,
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set the destination topic.
    #[must_use]
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Mark the event as a request whose reply goes to `reply_to`.
    #[must_use]
    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub const fn correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Set the priority. Lower numbers run first.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a trigger.
    #[must_use]
    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Build the event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] if the type or channel is empty.
    pub fn build(self) -> Result<Event> {
        if self.channel.is_empty() {
            return Err(Error::InvalidEvent {
                reason: "channel must not be empty".to_string(),
            });
        }

        let event = Event {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            payload: self.payload,
            channel: self.channel,
            reply_to: self.reply_to,
            correlation_id: self.correlation_id,
            priority: self.priority,
            trigger: self.trigger,
        };
        event.validate()?;
        Ok(event)
    }
}
