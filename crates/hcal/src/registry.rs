// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-local table of the entities this context announces.
//!
//! The registration broadcaster takes a [`EntityRegistry::tick`] every
//! refresh period; everything registered here is announced until it is
//! unregistered.

use crate::entity::{EntityId, EntityIdAllocator, LayerKind};
use crate::registration::{Command, RegistrationSample, SampleBody, TopicStatistics};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Live counters of a publisher or subscriber.
///
/// Updated lock-free on the data path and copied into the topic
/// registration on every tick.
#[derive(Debug, Default)]
pub struct TopicCounters {
    pub data_clock: AtomicU64,
    pub message_drops: AtomicU64,
    pub connections_local: AtomicU32,
    pub connections_external: AtomicU32,
    /// Bit per [`LayerKind`] carrying at least one connection
    layers_in_use: AtomicU8,
}

impl TopicCounters {
    #[must_use]
    pub fn snapshot(&self) -> TopicStatistics {
        TopicStatistics {
            data_clock: self.data_clock.load(Ordering::Relaxed),
            message_drops: self.message_drops.load(Ordering::Relaxed),
            connections_local: self.connections_local.load(Ordering::Relaxed),
            connections_external: self.connections_external.load(Ordering::Relaxed),
        }
    }

    pub fn set_connections(&self, local: u32, external: u32) {
        self.connections_local.store(local, Ordering::Relaxed);
        self.connections_external.store(external, Ordering::Relaxed);
    }

    pub fn set_layers_in_use<'a>(&self, layers: impl IntoIterator<Item = &'a LayerKind>) {
        let bits = layers
            .into_iter()
            .fold(0u8, |acc, kind| acc | (1 << kind.wire_code()));
        self.layers_in_use.store(bits, Ordering::Relaxed);
    }

    /// Layers carrying at least one connection, in [`LayerKind::ALL`] order.
    #[must_use]
    pub fn layers_in_use(&self) -> Vec<LayerKind> {
        let bits = self.layers_in_use.load(Ordering::Relaxed);
        LayerKind::ALL
            .into_iter()
            .filter(|kind| bits & (1 << kind.wire_code()) != 0)
            .collect()
    }
}

struct Registered {
    sample: RegistrationSample,
    counters: Option<Arc<TopicCounters>>,
}

impl Registered {
    fn current(&self) -> RegistrationSample {
        let mut sample = self.sample.clone();
        if let (Some(counters), SampleBody::Topic(topic)) = (&self.counters, &mut sample.body) {
            topic.stats = counters.snapshot();
        }
        sample
    }
}

/// Entities owned by one context.
pub struct EntityRegistry {
    allocator: EntityIdAllocator,
    entries: Mutex<HashMap<u64, Registered>>,
}

impl EntityRegistry {
    #[must_use]
    pub fn new(allocator: EntityIdAllocator) -> Self {
        Self {
            allocator,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register an entity and return its new id. Never fails; the entity is
    /// announced from the next tick on.
    pub fn register(&self, body: SampleBody) -> EntityId {
        self.insert(body, None)
    }

    /// Register a publisher or subscriber whose statistics come from
    /// `counters`.
    pub fn register_topic(&self, body: SampleBody, counters: Arc<TopicCounters>) -> EntityId {
        self.insert(body, Some(counters))
    }

    fn insert(&self, body: SampleBody, counters: Option<Arc<TopicCounters>>) -> EntityId {
        crate::trace_fn!("EntityRegistry::register");
        let id = self.allocator.allocate();
        let sample = RegistrationSample {
            command: Command::Register,
            clock: 1,
            entity: id.clone(),
            body,
        };
        log::debug!("[REG] registered {} {} ({})", sample.kind().as_str(), sample.name(), id);
        self.entries
            .lock()
            .insert(id.id(), Registered { sample, counters });
        id
    }

    /// Remove an entity. Returns the leaving sample to emit once.
    pub fn unregister(&self, id: &EntityId) -> Option<RegistrationSample> {
        crate::trace_fn!("EntityRegistry::unregister");
        let entry = self.entries.lock().remove(&id.id())?;
        log::debug!(
            "[REG] unregistered {} {} ({})",
            entry.sample.kind().as_str(),
            entry.sample.name(),
            id
        );
        Some(entry.current().to_unregister())
    }

    /// Mutate a registered entity's body. The registration clock moves on so
    /// receivers treat the result as newer. Returns the updated sample.
    pub fn update<F>(&self, id: &EntityId, f: F) -> Option<RegistrationSample>
    where
        F: FnOnce(&mut SampleBody),
    {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id.id())?;
        f(&mut entry.sample.body);
        entry.sample.clock += 1;
        Some(entry.current())
    }

    /// Current sample of one entity.
    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<RegistrationSample> {
        self.entries.lock().get(&id.id()).map(Registered::current)
    }

    /// Live counters of a registered publisher or subscriber.
    #[must_use]
    pub fn counters(&self, id: u64) -> Option<Arc<TopicCounters>> {
        self.entries.lock().get(&id).and_then(|e| e.counters.clone())
    }

    /// Copy of every registered entity.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RegistrationSample> {
        self.entries.lock().values().map(Registered::current).collect()
    }

    /// Advance every registration clock and return the samples to broadcast.
    pub fn tick(&self) -> Vec<RegistrationSample> {
        let mut entries = self.entries.lock();
        entries
            .values_mut()
            .map(|entry| {
                entry.sample.clock += 1;
                entry.current()
            })
            .collect()
    }

    /// True if `id` was allocated by this registry (registered or not).
    #[must_use]
    pub fn owns(&self, id: u64) -> bool {
        self.allocator.issued(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn host_name(&self) -> &str {
        self.allocator.host_name()
    }

    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.allocator.process_id()
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("host", &self.allocator.host_name())
            .field("entities", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{DataTypeInformation, TopicDirection};
    use crate::registration::{ProcessInfo, TopicInfo};

    fn registry() -> EntityRegistry {
        EntityRegistry::new(EntityIdAllocator::new("test-host"))
    }

    fn topic(name: &str) -> SampleBody {
        SampleBody::Topic(TopicInfo {
            direction: TopicDirection::Publisher,
            topic_name: name.to_string(),
            data_type: DataTypeInformation::default(),
            layers: Vec::new(),
            stats: TopicStatistics::default(),
        })
    }

    #[test]
    fn test_register_and_snapshot() {
        let reg = registry();
        let a = reg.register(topic("a"));
        let b = reg.register(SampleBody::Process(ProcessInfo::default()));
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
        let snap = reg.snapshot();
        assert!(snap.iter().all(|s| s.is_register()));
        assert!(snap.iter().any(|s| s.entity == a && s.name() == "a"));
        assert!(reg.owns(a.id()));
    }

    #[test]
    fn test_unregister_returns_leaving_sample_once() {
        let reg = registry();
        let id = reg.register(topic("t"));
        let leaving = reg.unregister(&id).expect("leaving sample");
        assert!(!leaving.is_register());
        assert_eq!(leaving.clock, 2);
        assert!(reg.unregister(&id).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_tick_advances_clock() {
        let reg = registry();
        let id = reg.register(topic("t"));
        let first = reg.tick();
        let second = reg.tick();
        assert_eq!(first[0].clock + 1, second[0].clock);
        assert_eq!(reg.get(&id).expect("entry").clock, second[0].clock);
    }

    #[test]
    fn test_update_mutates_and_bumps_clock() {
        let reg = registry();
        let id = reg.register(topic("t"));
        let updated = reg
            .update(&id, |body| {
                if let SampleBody::Topic(t) = body {
                    t.data_type = DataTypeInformation::new("Pose", "proto");
                }
            })
            .expect("updated");
        assert_eq!(updated.clock, 2);
        assert_eq!(updated.topic().expect("topic").data_type.name, "Pose");
        assert!(reg.update(&EntityId::new(1, 1, "x"), |_| {}).is_none());
    }

    #[test]
    fn test_counters_flow_into_samples() {
        let reg = registry();
        let counters = Arc::new(TopicCounters::default());
        let id = reg.register_topic(topic("t"), Arc::clone(&counters));
        counters.data_clock.store(7, Ordering::Relaxed);
        counters.set_connections(1, 2);
        let sample = reg.get(&id).expect("entry");
        let stats = sample.topic().expect("topic").stats;
        assert_eq!(stats.data_clock, 7);
        assert_eq!((stats.connections_local, stats.connections_external), (1, 2));
    }

    #[test]
    fn test_layers_in_use_bitmask() {
        let reg = registry();
        let counters = Arc::new(TopicCounters::default());
        let id = reg.register_topic(topic("t"), Arc::clone(&counters));
        counters.set_layers_in_use(&[LayerKind::Tcp, LayerKind::Shm]);
        let live = reg.counters(id.id()).expect("counters");
        assert_eq!(live.layers_in_use(), vec![LayerKind::Shm, LayerKind::Tcp]);
        counters.set_layers_in_use(&[]);
        assert!(live.layers_in_use().is_empty());
        let process = reg.register(SampleBody::Process(ProcessInfo::default()));
        assert!(reg.counters(process.id()).is_none());
    }
}
