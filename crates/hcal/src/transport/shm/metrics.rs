// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-channel counters.
//!
//! All counters use `Relaxed` ordering; they are eventually consistent and
//! only meant for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

/// Channel metrics with atomic counters.
#[derive(Debug, Default)]
pub struct ShmMetrics {
    /// Committed writes
    pub writes: AtomicU64,
    /// Writes that serialized the whole payload
    pub full_writes: AtomicU64,
    /// Writes that patched the previous payload in place
    pub modified_writes: AtomicU64,
    /// Data object replacements
    pub resizes: AtomicU64,
    /// Acknowledge handshakes that timed out
    pub ack_timeouts: AtomicU64,
    /// Completed reads
    pub reads: AtomicU64,
    /// Reads discarded because the slot changed underneath
    pub torn_reads: AtomicU64,
    /// Samples overwritten before a reader got to them
    pub drops: AtomicU64,
}

impl ShmMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writes: AtomicU64::new(0),
            full_writes: AtomicU64::new(0),
            modified_writes: AtomicU64::new(0),
            resizes: AtomicU64::new(0),
            ack_timeouts: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            torn_reads: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> ShmMetricsSnapshot {
        ShmMetricsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            full_writes: self.full_writes.load(Ordering::Relaxed),
            modified_writes: self.modified_writes.load(Ordering::Relaxed),
            resizes: self.resizes.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            torn_reads: self.torn_reads.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.writes,
            &self.full_writes,
            &self.modified_writes,
            &self.resizes,
            &self.ack_timeouts,
            &self.reads,
            &self.torn_reads,
            &self.drops,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Plain copy of [`ShmMetrics`] for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShmMetricsSnapshot {
    pub writes: u64,
    pub full_writes: u64,
    pub modified_writes: u64,
    pub resizes: u64,
    pub ack_timeouts: u64,
    pub reads: u64,
    pub torn_reads: u64,
    pub drops: u64,
}

impl ShmMetricsSnapshot {
    /// Share of writes done in place. 0.0 without writes.
    #[must_use]
    pub fn modified_ratio(&self) -> f64 {
        if self.writes == 0 {
            0.0
        } else {
            self.modified_writes as f64 / self.writes as f64
        }
    }
}

impl std::fmt::Display for ShmMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "writes={} (full={}, modified={}), resizes={}, ack_timeouts={}, reads={}, torn={}, drops={}",
            self.writes,
            self.full_writes,
            self.modified_writes,
            self.resizes,
            self.ack_timeouts,
            self.reads,
            self.torn_reads,
            self.drops
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_reset() {
        let m = ShmMetrics::new();
        ShmMetrics::inc(&m.writes);
        ShmMetrics::inc(&m.writes);
        ShmMetrics::inc(&m.modified_writes);
        ShmMetrics::add(&m.drops, 5);

        let snap = m.snapshot();
        assert_eq!(snap.writes, 2);
        assert_eq!(snap.drops, 5);
        assert!((snap.modified_ratio() - 0.5).abs() < f64::EPSILON);

        m.reset();
        assert_eq!(m.snapshot(), ShmMetricsSnapshot::default());
    }

    #[test]
    fn test_snapshot_display() {
        let snap = ShmMetricsSnapshot {
            writes: 3,
            ..Default::default()
        };
        assert!(snap.to_string().starts_with("writes=3"));
    }
}
