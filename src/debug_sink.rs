use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{DEBUG_LOG_CAPACITY, DecisionTrace};

/// Bounded, append-only log of decision traces.
///
/// Only decisions made with `debug` enabled in their [`RateLimitConfig`](crate::RateLimitConfig)
/// are recorded. Once full, each new trace evicts the oldest one.
#[derive(Debug)]
pub struct DebugSink {
    capacity: usize,
    entries: Mutex<VecDeque<DecisionTrace>>,
}

impl Default for DebugSink {
    fn default() -> Self {
        Self::new(DEBUG_LOG_CAPACITY)
    }
}

impl DebugSink {
    /// Create a sink holding at most `capacity` traces, clamped to `1..=DEBUG_LOG_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, DEBUG_LOG_CAPACITY);

        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    // A panic while holding the lock cannot leave the deque half-updated.
    fn lock(&self) -> MutexGuard<'_, VecDeque<DecisionTrace>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record(&self, trace: DecisionTrace) {
        let mut entries = self.lock();

        while entries.len() >= self.capacity {
            entries.pop_front();
        }

        entries.push_back(trace);
    }

    /// Maximum number of traces kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the recorded traces, oldest first.
    pub fn entries(&self) -> Vec<DecisionTrace> {
        self.lock().iter().cloned().collect()
    }

    /// Number of recorded traces.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every recorded trace.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
