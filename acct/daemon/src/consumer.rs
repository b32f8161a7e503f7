//! Event consumers registered with a probe
//!
//! A consumer owns the sending half of a bounded inbox. The probe's fanout
//! loop delivers into it without ever waiting: when the inbox is full the
//! event is dropped and counted against the consumer.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    event::{Event, EventKind},
    stats::{ConsumerCounters, ConsumerStats},
};

/// Default inbox capacity of a consumer
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Receiving half of a consumer's inbox
pub type Inbox = mpsc::Receiver<(EventKind, Event)>;

/// Which event streams a consumer is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMode {
    Update,
    Destroy,
    All,
}

impl ConsumerMode {
    /// Build a mode from independent interest flags.
    ///
    /// Returns `None` when neither stream is wanted.
    pub fn from_flags(update: bool, destroy: bool) -> Option<Self> {
        match (update, destroy) {
            (true, true) => Some(ConsumerMode::All),
            (true, false) => Some(ConsumerMode::Update),
            (false, true) => Some(ConsumerMode::Destroy),
            (false, false) => None,
        }
    }

    pub fn want_update(&self) -> bool {
        matches!(self, ConsumerMode::Update | ConsumerMode::All)
    }

    pub fn want_destroy(&self) -> bool {
        matches!(self, ConsumerMode::Destroy | ConsumerMode::All)
    }

    pub fn wants(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Update => self.want_update(),
            EventKind::Destroy => self.want_destroy(),
        }
    }
}

/// A named fanout endpoint with a filter and a bounded inbox
#[derive(Debug)]
pub struct Consumer {
    name: String,
    mode: ConsumerMode,
    events: mpsc::Sender<(EventKind, Event)>,
    stats: ConsumerCounters,
}

impl Consumer {
    /// Create a consumer and the receiving half of its inbox.
    ///
    /// # Arguments
    ///
    /// * `name` - Registry key, unique per probe
    /// * `capacity` - Inbox size; zero is raised to one
    /// * `mode` - Which event streams to accept
    ///
    /// # Returns
    ///
    /// The shared consumer to register and the inbox to drain
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        mode: ConsumerMode,
    ) -> (Arc<Self>, Inbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let consumer = Consumer {
            name: name.into(),
            mode,
            events: tx,
            stats: ConsumerCounters::default(),
        };
        (Arc::new(consumer), rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ConsumerMode {
        self.mode
    }

    pub fn want_update(&self) -> bool {
        self.mode.want_update()
    }

    pub fn want_destroy(&self) -> bool {
        self.mode.want_destroy()
    }

    /// Inbox capacity
    pub fn capacity(&self) -> usize {
        self.events.max_capacity()
    }

    /// Snapshot copy of the consumer's statistics
    pub fn stats(&self) -> ConsumerStats {
        self.stats.get()
    }

    /// Try to place `event` in the inbox without waiting.
    ///
    /// A full inbox, or one whose receiver is gone, counts the event as lost.
    pub(crate) fn deliver(&self, kind: EventKind, event: Event) -> bool {
        match self.events.try_send((kind, event)) {
            Ok(()) => {
                let depth = self.events.max_capacity() - self.events.capacity();
                self.stats.set_queue_length(depth);
                self.stats.incr_received();
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.stats.incr_lost();
                false
            }
        }
    }
}
