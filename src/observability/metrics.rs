// Handle accounting
//
// Invariant: one supervised run creates exactly one process descriptor and
// one event channel, whatever the outcome.
//
// The counters are process-wide and monotonic; callers compare snapshots
// taken before and after a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Kernel handles created by the supervisor.
#[derive(Debug)]
pub struct HandleMetrics {
    pub process_descriptors: Counter,
    pub event_channels: Counter,
    pub forced_kills: Counter,
}

static HANDLES: HandleMetrics = HandleMetrics {
    process_descriptors: Counter::new(),
    event_channels: Counter::new(),
    forced_kills: Counter::new(),
};

pub fn handles() -> &'static HandleMetrics {
    &HANDLES
}

/// Point-in-time copy of [`HandleMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub process_descriptors: u64,
    pub event_channels: u64,
    pub forced_kills: u64,
}

impl HandleSnapshot {
    pub fn capture() -> Self {
        let h = handles();
        Self {
            process_descriptors: h.process_descriptors.get(),
            event_channels: h.event_channels.get(),
            forced_kills: h.forced_kills.get(),
        }
    }

    /// Handles created between `earlier` and `self`.
    pub fn since(&self, earlier: &HandleSnapshot) -> HandleSnapshot {
        HandleSnapshot {
            process_descriptors: self.process_descriptors - earlier.process_descriptors,
            event_channels: self.event_channels - earlier.event_channels,
            forced_kills: self.forced_kills - earlier.forced_kills,
        }
    }
}
