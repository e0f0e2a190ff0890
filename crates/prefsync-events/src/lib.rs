#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Diagnostic event bus for the preference store.
//!
//! Commits, resets, and persistence health transitions are published as
//! typed [`Event`]s. Late observers (a settings window opened after storage
//! started failing) can replay recent history from a bounded ring before
//! switching to the live `tokio::broadcast` feed.

pub mod payloads;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast::{self, Receiver, Sender};

pub use payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId};

/// Cloneable handle to a shared event bus.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    history: Arc<Mutex<History>>,
}

struct History {
    ring: VecDeque<EventEnvelope>,
    capacity: usize,
    next_id: EventId,
}

impl History {
    fn record(&mut self, envelope: EventEnvelope) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(envelope);
    }

    fn since(&self, id: EventId) -> VecDeque<EventEnvelope> {
        self.ring
            .iter()
            .skip_while(|envelope| envelope.id <= id)
            .cloned()
            .collect()
    }
}

impl EventBus {
    /// Bus retaining up to `capacity` events for replay. The live channel
    /// uses the same bound; a zero capacity is raised to one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: Arc::new(Mutex::new(History {
                ring: VecDeque::with_capacity(capacity),
                capacity,
                next_id: 1,
            })),
        }
    }

    /// Bus with [`DEFAULT_REPLAY_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Stamp and publish `event`, returning its identifier.
    ///
    /// Stamping, recording, and broadcasting happen under one lock, so ids
    /// reach every subscriber in increasing order.
    pub fn publish(&self, event: Event) -> EventId {
        let mut history = self.history();
        let id = history.next_id;
        history.next_id += 1;
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        history.record(envelope.clone());
        // Observers are optional.
        let _ = self.sender.send(envelope);
        id
    }

    /// Attach an observer. With `Some(id)`, retained events newer than `id`
    /// are delivered first; with `None`, only events published from now on.
    #[must_use]
    pub fn subscribe(&self, since: Option<EventId>) -> EventStream {
        let history = self.history();
        let backlog = since.map(|id| history.since(id)).unwrap_or_default();
        EventStream {
            backlog,
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    /// Identifier of the most recently published event.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.history().ring.back().map(|envelope| envelope.id)
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered feed of envelopes: replayed history first, then live events.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
    missed: u64,
}

impl EventStream {
    /// Wait for the next envelope. Returns `None` once every bus handle is
    /// dropped and the feed is drained.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Some(envelope);
        }
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => self.missed += skipped,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next envelope if one is ready, without waiting.
    pub fn try_next(&mut self) -> Option<EventEnvelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Some(envelope);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.missed += skipped,
                Err(_) => return None,
            }
        }
    }

    /// Events dropped because this observer fell behind the live channel.
    #[must_use]
    pub const fn missed(&self) -> u64 {
        self.missed
    }
}
