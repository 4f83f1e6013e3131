// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide view of every entity heard of, local or remote.
//!
//! # Architecture
//! - One mutex per table (processes, topics, services), held only to copy
//!   in or out
//! - Ordering by registration clock: an older sample is a no-op
//! - Unregistration leaves a tombstone for one timeout so late register
//!   samples of a departed entity are dropped
//! - Entries not refreshed within the timeout are removed by
//!   [`Directory::sweep`], run periodically by the [`Watchdog`]
//! - Listeners and registration callbacks run after the table locks are
//!   released, on the thread that applied the sample

pub mod filter;
pub mod matching;
pub mod watchdog;

pub use filter::TopicFilter;
pub use matching::{services_match, topics_match, types_compatible};
pub use watchdog::Watchdog;

use crate::config::RuntimeConfig;
use crate::entity::EntityKind;
use crate::registration::{RegistrationSample, SampleBody, TopicInfo};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Events and observers
// ============================================================================

/// Why an entry left the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// No refresh within the registration timeout
    Expired,
    /// The entity announced its departure
    Unregistered,
}

/// Change of one directory entry.
#[derive(Debug, Clone)]
pub enum DirectoryEvent {
    Added(RegistrationSample),
    Updated {
        sample: RegistrationSample,
        /// False when only statistics or process state changed
        inputs_changed: bool,
    },
    Removed {
        sample: RegistrationSample,
        reason: RemovalReason,
    },
}

impl DirectoryEvent {
    #[must_use]
    pub fn sample(&self) -> &RegistrationSample {
        match self {
            Self::Added(sample) | Self::Updated { sample, .. } | Self::Removed { sample, .. } => {
                sample
            }
        }
    }
}

/// Observer of directory changes (local entities routing their matches).
pub trait DirectoryListener: Send + Sync {
    fn on_directory_event(&self, event: &DirectoryEvent);
}

/// Per entity-kind observer of applied registration samples.
pub type RegistrationCallback = Arc<dyn Fn(&RegistrationSample) + Send + Sync>;

/// Handle returned when adding a listener or callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

// ============================================================================
// Metrics
// ============================================================================

/// Directory counters.
#[derive(Debug, Default)]
pub struct DirectoryMetrics {
    /// Samples that changed or refreshed an entry.
    pub applied: AtomicU64,
    /// Samples older than the stored one, or for a tombstoned entity.
    pub stale: AtomicU64,
    /// Topic samples rejected by the include/exclude filter.
    pub filtered: AtomicU64,
    /// Entries removed by timeout.
    pub expired: AtomicU64,
    /// Entries removed by an unregister sample.
    pub unregistered: AtomicU64,
}

/// Point-in-time copy of [`DirectoryMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryMetricsSnapshot {
    pub applied: u64,
    pub stale: u64,
    pub filtered: u64,
    pub expired: u64,
    pub unregistered: u64,
}

impl DirectoryMetrics {
    #[must_use]
    pub fn snapshot(&self) -> DirectoryMetricsSnapshot {
        DirectoryMetricsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            unregistered: self.unregistered.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Directory
// ============================================================================

struct Entry {
    sample: RegistrationSample,
    last_seen: Instant,
}

type Table = Mutex<HashMap<u64, Entry>>;

/// Topic/service/process directory of one context.
pub struct Directory {
    timeout: Duration,
    runtime: Arc<RuntimeConfig>,
    processes: Table,
    topics: Table,
    services: Table,
    tombstones: Mutex<HashMap<u64, Instant>>,
    listeners: RwLock<Vec<(ObserverId, Arc<dyn DirectoryListener>)>>,
    callbacks: RwLock<Vec<(ObserverId, EntityKind, RegistrationCallback)>>,
    next_observer: AtomicU64,
    metrics: DirectoryMetrics,
}

impl Directory {
    #[must_use]
    pub fn new(timeout: Duration, runtime: Arc<RuntimeConfig>) -> Self {
        crate::trace_fn!("Directory::new");
        Self {
            timeout,
            runtime,
            processes: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            callbacks: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            metrics: DirectoryMetrics::default(),
        }
    }

    fn table(&self, body: &SampleBody) -> &Table {
        match body {
            SampleBody::Process(_) => &self.processes,
            SampleBody::Topic(_) => &self.topics,
            SampleBody::Service(_) => &self.services,
        }
    }

    /// Apply one registration sample, then notify observers.
    ///
    /// Returns the resulting change, or `None` for refreshes that changed
    /// nothing, stale samples and filtered topics.
    pub fn apply(&self, sample: RegistrationSample) -> Option<DirectoryEvent> {
        self.apply_at(sample, Instant::now())
    }

    pub(crate) fn apply_at(&self, sample: RegistrationSample, now: Instant) -> Option<DirectoryEvent> {
        crate::trace_fn!("Directory::apply");
        if let SampleBody::Topic(topic) = &sample.body {
            if !self.runtime.filter().accepts(&topic.topic_name) {
                self.metrics.filtered.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        let id = sample.entity.id();
        let (event, notify) = if sample.is_register() {
            if self.tombstones.lock().contains_key(&id) {
                self.metrics.stale.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            let mut table = self.table(&sample.body).lock();
            match table.get_mut(&id) {
                Some(entry) if sample.clock < entry.sample.clock => {
                    self.metrics.stale.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if sample.clock == entry.sample.clock => {
                    entry.last_seen = now;
                    return None;
                }
                Some(entry) => {
                    let inputs_changed = !entry.sample.same_connection_inputs(&sample);
                    entry.sample = sample.clone();
                    entry.last_seen = now;
                    (
                        Some(DirectoryEvent::Updated {
                            sample: sample.clone(),
                            inputs_changed,
                        }),
                        sample,
                    )
                }
                None => {
                    table.insert(
                        id,
                        Entry {
                            sample: sample.clone(),
                            last_seen: now,
                        },
                    );
                    log::debug!(
                        "[DIR] + {} {} ({})",
                        sample.kind().as_str(),
                        sample.name(),
                        sample.entity
                    );
                    (Some(DirectoryEvent::Added(sample.clone())), sample)
                }
            }
        } else {
            self.tombstones.lock().insert(id, now);
            let removed = self.table(&sample.body).lock().remove(&id);
            match removed {
                Some(entry) => {
                    self.metrics.unregistered.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "[DIR] - {} {} ({}) left",
                        entry.sample.kind().as_str(),
                        entry.sample.name(),
                        entry.sample.entity
                    );
                    (
                        Some(DirectoryEvent::Removed {
                            sample: entry.sample,
                            reason: RemovalReason::Unregistered,
                        }),
                        sample,
                    )
                }
                None => (None, sample),
            }
        };

        self.metrics.applied.fetch_add(1, Ordering::Relaxed);
        self.run_callbacks(&notify);
        if let Some(event) = &event {
            self.dispatch(event);
        }
        event
    }

    /// Remove entries not refreshed within the timeout and forget old
    /// tombstones. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        crate::trace_fn!("Directory::sweep");
        let timeout = self.timeout;
        let mut expired = Vec::new();
        for table in [&self.processes, &self.topics, &self.services] {
            let mut table = table.lock();
            let stale: Vec<u64> = table
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                if let Some(entry) = table.remove(&id) {
                    expired.push(entry.sample);
                }
            }
        }
        self.tombstones
            .lock()
            .retain(|_, since| now.saturating_duration_since(*since) <= timeout);

        let count = expired.len();
        for sample in expired {
            self.metrics.expired.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "[DIR] - {} {} ({}) expired",
                sample.kind().as_str(),
                sample.name(),
                sample.entity
            );
            self.dispatch(&DirectoryEvent::Removed {
                sample,
                reason: RemovalReason::Expired,
            });
        }
        count
    }

    fn dispatch(&self, event: &DirectoryEvent) {
        // Copied out: listeners may apply samples themselves.
        let listeners: Vec<Arc<dyn DirectoryListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_directory_event(event);
        }
    }

    fn run_callbacks(&self, sample: &RegistrationSample) {
        let kind = sample.kind();
        let callbacks: Vec<RegistrationCallback> = self
            .callbacks
            .read()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(sample);
        }
    }

    fn next_id(&self) -> ObserverId {
        ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed))
    }

    // ========================================================================
    // Observers
    // ========================================================================

    pub fn add_listener(&self, listener: Arc<dyn DirectoryListener>) -> ObserverId {
        let id = self.next_id();
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ObserverId) {
        self.listeners.write().retain(|(l, _)| *l != id);
    }

    /// Call `callback` with every applied sample of `kind`.
    pub fn add_registration_callback(
        &self,
        kind: EntityKind,
        callback: RegistrationCallback,
    ) -> ObserverId {
        let id = self.next_id();
        self.callbacks.write().push((id, kind, callback));
        id
    }

    pub fn remove_registration_callback(&self, id: ObserverId) {
        self.callbacks.write().retain(|(c, _, _)| *c != id);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Entry of entity `id`, whatever its kind.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<RegistrationSample> {
        [&self.topics, &self.services, &self.processes]
            .iter()
            .find_map(|table| table.lock().get(&id).map(|e| e.sample.clone()))
    }

    #[must_use]
    pub fn topics(&self) -> Vec<RegistrationSample> {
        copy_out(&self.topics)
    }

    #[must_use]
    pub fn services(&self) -> Vec<RegistrationSample> {
        copy_out(&self.services)
    }

    #[must_use]
    pub fn processes(&self) -> Vec<RegistrationSample> {
        copy_out(&self.processes)
    }

    /// Topic entries connecting to `local`.
    #[must_use]
    pub fn matching_topics(&self, local: &TopicInfo) -> Vec<RegistrationSample> {
        self.topics
            .lock()
            .values()
            .filter(|e| e.sample.topic().is_some_and(|t| topics_match(local, t)))
            .map(|e| e.sample.clone())
            .collect()
    }

    /// Service entries named `name`.
    #[must_use]
    pub fn services_named(&self, name: &str) -> Vec<RegistrationSample> {
        self.services
            .lock()
            .values()
            .filter(|e| e.sample.name() == name)
            .map(|e| e.sample.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.lock().len() + self.topics.lock().len() + self.services.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn metrics(&self) -> DirectoryMetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn copy_out(table: &Table) -> Vec<RegistrationSample> {
    table.lock().values().map(|e| e.sample.clone()).collect()
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("timeout", &self.timeout)
            .field("processes", &self.processes.lock().len())
            .field("topics", &self.topics.lock().len())
            .field("services", &self.services.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::TopicDirection;
    use crate::registration::sample::tests::topic_sample;

    const TIMEOUT: Duration = Duration::from_millis(1000);

    fn directory() -> Directory {
        Directory::new(TIMEOUT, Arc::new(RuntimeConfig::default()))
    }

    fn publisher(id: u64, topic: &str, clock: u64) -> RegistrationSample {
        let mut s = topic_sample(id, "h", TopicDirection::Publisher, topic, vec![]);
        s.clock = clock;
        s
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DirectoryEvent>>);

    impl DirectoryListener for Recorder {
        fn on_directory_event(&self, event: &DirectoryEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn test_later_clock_wins_earlier_is_noop() {
        let dir = directory();
        assert!(matches!(
            dir.apply(publisher(1, "t", 5)),
            Some(DirectoryEvent::Added(_))
        ));
        assert!(dir.apply(publisher(1, "t", 3)).is_none());
        assert_eq!(dir.get(1).expect("entry").clock, 5);

        let event = dir.apply(publisher(1, "t", 6)).expect("update");
        assert!(matches!(
            event,
            DirectoryEvent::Updated {
                inputs_changed: false,
                ..
            }
        ));
        assert_eq!(dir.metrics().stale, 1);
    }

    #[test]
    fn test_unregister_leaves_tombstone() {
        let dir = directory();
        let now = Instant::now();
        dir.apply_at(publisher(1, "t", 1), now);
        let leaving = publisher(1, "t", 1).to_unregister();
        assert!(matches!(
            dir.apply_at(leaving, now),
            Some(DirectoryEvent::Removed {
                reason: RemovalReason::Unregistered,
                ..
            })
        ));

        // Late refresh of the departed entity is ignored...
        assert!(dir.apply_at(publisher(1, "t", 9), now).is_none());
        assert!(dir.get(1).is_none());

        // ...until the tombstone is older than the timeout.
        dir.sweep_at(now + TIMEOUT * 2);
        assert!(dir.apply_at(publisher(1, "t", 10), now + TIMEOUT * 2).is_some());
    }

    #[test]
    fn test_sweep_removes_only_stale_entries() {
        let dir = directory();
        let recorder = Arc::new(Recorder::default());
        dir.add_listener(recorder.clone());
        let start = Instant::now();
        dir.apply_at(publisher(1, "old", 1), start);
        dir.apply_at(publisher(2, "fresh", 1), start + TIMEOUT);

        assert_eq!(dir.sweep_at(start + TIMEOUT), 0);
        assert_eq!(dir.sweep_at(start + TIMEOUT + Duration::from_millis(1)), 1);
        assert!(dir.get(1).is_none());
        assert!(dir.get(2).is_some());

        let events = recorder.0.lock();
        assert!(matches!(
            events.last(),
            Some(DirectoryEvent::Removed {
                reason: RemovalReason::Expired,
                ..
            })
        ));
        assert_eq!(dir.metrics().expired, 1);
    }

    #[test]
    fn test_refresh_with_same_clock_keeps_entry_alive() {
        let dir = directory();
        let start = Instant::now();
        dir.apply_at(publisher(1, "t", 1), start);
        assert!(dir
            .apply_at(publisher(1, "t", 1), start + TIMEOUT)
            .is_none());
        assert_eq!(dir.sweep_at(start + TIMEOUT + Duration::from_millis(1)), 0);
    }

    #[test]
    fn test_filter_applies_before_observers() {
        let runtime = Arc::new(RuntimeConfig::new(
            TopicFilter::new("", "^__.*$").expect("filter"),
        ));
        let dir = Directory::new(TIMEOUT, runtime);
        let recorder = Arc::new(Recorder::default());
        dir.add_listener(recorder.clone());
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        dir.add_registration_callback(
            EntityKind::Publisher,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );

        assert!(dir.apply(publisher(1, "__internal", 1)).is_none());
        assert!(dir.apply(publisher(2, "apple", 1)).is_some());
        assert_eq!(recorder.0.lock().len(), 1);
        assert_eq!(seen.load(Ordering::Relaxed), 1);
        assert_eq!(dir.metrics().filtered, 1);
    }

    #[test]
    fn test_removed_listener_not_called() {
        let dir = directory();
        let recorder = Arc::new(Recorder::default());
        let id = dir.add_listener(recorder.clone());
        dir.remove_listener(id);
        dir.apply(publisher(1, "t", 1));
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn test_matching_topics() {
        let dir = directory();
        dir.apply(publisher(1, "t", 1));
        dir.apply(publisher(2, "other", 1));
        let local = topic_sample(3, "h", TopicDirection::Subscriber, "t", vec![]);
        let matches = dir.matching_topics(local.topic().expect("topic"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].entity.id(), 1);
    }
}
