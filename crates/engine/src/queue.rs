//! Time- and priority-ordered event queue, plus the outbound queue the
//! transport loop drains.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use evsched_event::Event;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct Entry {
    eligible_at: DateTime<Utc>,
    priority: i32,
    seq: u64,
    event: Event,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap; reverse so the earliest, lowest-numbered entry
    // sits on top. `seq` keeps equal keys in insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .eligible_at
            .cmp(&self.eligible_at)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending events ordered by `(eligible_at, priority)`.
///
/// Safe for many concurrent producers. [`EventQueue::pop`] is meant for a
/// single consumer.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    seq: AtomicU64,
    notify: Notify,
}

impl EventQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `event`, eligible from `eligible_at`.
    pub fn push(&self, event: Event, eligible_at: DateTime<Utc>) {
        let entry = Entry {
            eligible_at,
            priority: event.priority(),
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            event,
        };
        self.heap.lock().push(entry);
        self.notify.notify_one();
    }

    /// Insert `event` at the time its trigger asks for, or now if it has none.
    ///
    /// Returns `false` if the trigger has already expired.
    pub fn schedule(&self, event: Event) -> bool {
        let now = Utc::now();
        let eligible_at = match event.trigger() {
            None => now,
            Some(trigger) => match trigger.next_fire_time(now) {
                Some(at) => at,
                None => {
                    debug!(event_type = %event.event_type(), "Trigger expired, event not queued");
                    return false;
                }
            },
        };
        self.push(event, eligible_at);
        true
    }

    /// Take the next eligible event, waiting up to `timeout` for one.
    ///
    /// The popped event carries its trigger in the `Active` state. Periodic
    /// events are re-queued at their next fire time before this returns.
    pub async fn pop(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = match self.take_ready(Utc::now()) {
                Ok(event) => return Some(event),
                Err(next_due) => next_due,
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let wait = next_due
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .map_or(remaining, |until_due| until_due.min(remaining))
                .max(Duration::from_millis(1));

            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Take the next eligible event without waiting.
    pub fn try_pop(&self) -> Option<Event> {
        self.take_ready(Utc::now()).ok()
    }

    /// Number of queued entries, eligible or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Pop the top entry if it is due; otherwise report when it will be.
    fn take_ready(&self, now: DateTime<Utc>) -> Result<Event, Option<DateTime<Utc>>> {
        let mut heap = self.heap.lock();

        match heap.peek() {
            Some(top) if top.eligible_at <= now => {}
            Some(top) => return Err(Some(top.eligible_at)),
            None => return Err(None),
        }
        let Some(Entry {
            eligible_at, event, ..
        }) = heap.pop()
        else {
            return Err(None);
        };

        let Some(mut trigger) = event.trigger().cloned() else {
            return Ok(event);
        };

        trigger.fire(eligible_at);
        let fired = event.with_trigger(Some(trigger.clone()));

        trigger.rearm();
        if let Some(next) = trigger.next_fire_time(now) {
            heap.push(Entry {
                eligible_at: next,
                priority: event.priority(),
                seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
                event: event.with_trigger(Some(trigger)),
            });
        }

        Ok(fired)
    }
}

/// FIFO of events waiting to go out over the transport.
#[derive(Debug, Default)]
pub struct ReplyQueue {
    events: Mutex<VecDeque<Event>>,
    notify: Notify,
}

impl ReplyQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn push(&self, event: Event) {
        self.events.lock().push_back(event);
        self.notify.notify_one();
    }

    /// Take the oldest event.
    pub fn try_pop(&self) -> Option<Event> {
        self.events.lock().pop_front()
    }

    /// Drop every waiting event, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut events = self.events.lock();
        let dropped = events.len();
        events.clear();
        dropped
    }

    /// Number of waiting events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Resolves once an event has been pushed since the last wakeup.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
