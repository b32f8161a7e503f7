//! Probe and consumer statistics
//!
//! Counters are updated with relaxed atomics on the hot path and only ever
//! handed out as copied snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of a probe's counters
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStats {
    /// Records received from both perf streams
    pub events_total: u64,
    /// Records received on the update stream
    pub events_update: u64,
    /// Records received on the destroy stream
    pub events_destroy: u64,
    /// Records dropped by the kernel perf buffer before userspace saw them
    pub events_lost: u64,
    /// Records that failed to decode
    pub decode_errors: u64,
    /// Perf readers that failed and exited
    pub read_errors: u64,
}

/// Snapshot of a consumer's counters
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Events placed in the consumer's inbox
    pub events_received: u64,
    /// Events dropped because the inbox was full
    pub events_lost: u64,
    /// Inbox depth observed at the last successful delivery
    pub queue_length: u64,
}

/// Snapshot of a pipeline's counters
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    /// Registered sinks
    pub sinks: u64,
    /// Events handed to sinks successfully
    pub events_pushed: u64,
    /// Events a sink failed to write
    pub push_errors: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ProbeCounters {
    events_total: AtomicU64,
    events_update: AtomicU64,
    events_destroy: AtomicU64,
    events_lost: AtomicU64,
    decode_errors: AtomicU64,
    read_errors: AtomicU64,
}

impl ProbeCounters {
    pub(crate) fn incr_update(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.events_update.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_destroy(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.events_destroy.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_lost(&self, n: u64) {
        self.events_lost.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_read_errors(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> ProbeStats {
        ProbeStats {
            events_total: self.events_total.load(Ordering::Relaxed),
            events_update: self.events_update.load(Ordering::Relaxed),
            events_destroy: self.events_destroy.load(Ordering::Relaxed),
            events_lost: self.events_lost.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ConsumerCounters {
    events_received: AtomicU64,
    events_lost: AtomicU64,
    queue_length: AtomicU64,
}

impl ConsumerCounters {
    pub(crate) fn incr_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_lost(&self) {
        self.events_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_queue_length(&self, len: usize) {
        self.queue_length.store(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> ConsumerStats {
        ConsumerStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_lost: self.events_lost.load(Ordering::Relaxed),
            queue_length: self.queue_length.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    sinks: AtomicU64,
    events_pushed: AtomicU64,
    push_errors: AtomicU64,
}

impl PipelineCounters {
    pub(crate) fn incr_sinks(&self) {
        self.sinks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_pushed(&self) {
        self.events_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_push_errors(&self) {
        self.push_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> PipelineStats {
        PipelineStats {
            sinks: self.sinks.load(Ordering::Relaxed),
            events_pushed: self.events_pushed.load(Ordering::Relaxed),
            push_errors: self.push_errors.load(Ordering::Relaxed),
        }
    }
}
