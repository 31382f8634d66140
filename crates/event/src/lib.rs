//! Event envelope and trigger schedules for the event scheduler.
//!
//! An [`Event`] is the unit of local work and the unit of wire communication.
//! A [`Trigger`] attached to an event decides when it becomes eligible, and
//! whether it fires again after being dispatched.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// CBOR and JSON wire codecs.
pub mod codec;

/// Error types.
pub mod error;

/// The event envelope.
pub mod event;

/// Reserved event types and topics.
pub mod topics;

/// Trigger schedules.
pub mod trigger;

pub use error::{Error, Result};
pub use event::{DEFAULT_PRIORITY, Event, EventBuilder};
pub use trigger::{DailyZone, Schedule, Trigger, TriggerStatus};
