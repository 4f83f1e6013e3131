// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic registration broadcaster.
//!
//! Every refresh period the provider takes a tick of the entity registry,
//! feeds the samples into the local directory (local entities never travel
//! through the carrier to reach it) and broadcasts them. Registration and
//! departure of an entity are also announced immediately so peers do not
//! wait a full period.

use super::codec::encode_datagrams;
use super::sample::{RegistrationSample, SampleBody};
use super::transport::RegistrationTransport;
use crate::config::RuntimeConfig;
use crate::directory::Directory;
use crate::entity::EntityId;
use crate::registry::EntityRegistry;
use crate::worker::WorkerThread;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(20);

/// Broadcast side of registration for one context.
pub struct RegistrationProvider {
    registry: Arc<EntityRegistry>,
    directory: Arc<Directory>,
    transport: Arc<dyn RegistrationTransport>,
    runtime: Arc<RuntimeConfig>,
    process: EntityId,
    datagrams_sent: AtomicU64,
    send_errors: AtomicU64,
}

impl RegistrationProvider {
    pub fn new(
        registry: Arc<EntityRegistry>,
        directory: Arc<Directory>,
        transport: Arc<dyn RegistrationTransport>,
        runtime: Arc<RuntimeConfig>,
        process: EntityId,
    ) -> Self {
        Self {
            registry,
            directory,
            transport,
            runtime,
            process,
            datagrams_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }

    /// Apply `samples` locally and broadcast them.
    pub fn announce(&self, samples: &[RegistrationSample]) {
        crate::trace_fn!("RegistrationProvider::announce");
        for sample in samples {
            self.directory.apply(sample.clone());
        }
        self.broadcast(samples);
    }

    fn broadcast(&self, samples: &[RegistrationSample]) {
        let datagrams = match encode_datagrams(samples, self.transport.max_datagram()) {
            Ok(datagrams) => datagrams,
            Err(e) => {
                log::warn!("[REG] encoding {} samples failed: {}", samples.len(), e);
                return;
            }
        };
        for datagram in datagrams {
            match self.transport.send(&datagram) {
                Ok(()) => {
                    self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // Lost datagrams are made good by the next refresh.
                    self.send_errors.fetch_add(1, Ordering::Relaxed);
                    log::debug!("[REG] {} send failed: {}", self.transport.name(), e);
                }
            }
        }
    }

    /// One refresh period: sync process attributes, tick, announce.
    pub fn refresh(&self) {
        self.sync_process_attributes();
        let samples = self.registry.tick();
        if !samples.is_empty() {
            self.announce(&samples);
        }
    }

    fn sync_process_attributes(&self) {
        let attributes = self.runtime.attributes();
        let Some(current) = self.registry.get(&self.process) else {
            return;
        };
        if let SampleBody::Process(info) = &current.body {
            if info.attributes == attributes {
                return;
            }
        }
        self.registry.update(&self.process, |body| {
            if let SampleBody::Process(info) = body {
                info.attributes = attributes;
            }
        });
    }

    /// Datagrams sent and send failures so far.
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        (
            self.datagrams_sent.load(Ordering::Relaxed),
            self.send_errors.load(Ordering::Relaxed),
        )
    }

    /// Run [`refresh`](Self::refresh) every `period` on `hcal-reg-provider`.
    pub(crate) fn spawn(self: &Arc<Self>, period: Duration) -> std::io::Result<WorkerThread> {
        let provider = Arc::clone(self);
        WorkerThread::spawn("reg-provider", move |shutdown| {
            let mut next = Instant::now();
            while !shutdown.load(Ordering::Relaxed) {
                if Instant::now() >= next {
                    provider.refresh();
                    next += period;
                }
                std::thread::sleep(POLL.min(period));
            }
        })
    }
}

impl std::fmt::Debug for RegistrationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationProvider")
            .field("transport", &self.transport.name())
            .field("process", &self.process)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityIdAllocator;
    use crate::registration::codec::decode_datagram;
    use crate::registration::transport::{DatagramHandler, InProcessBus};
    use crate::registration::ProcessInfo;
    use crossbeam::channel::unbounded;

    fn setup() -> (Arc<RegistrationProvider>, Arc<RuntimeConfig>, InProcessBus) {
        let registry = Arc::new(EntityRegistry::new(EntityIdAllocator::new("h")));
        let runtime = Arc::new(RuntimeConfig::default());
        let directory = Arc::new(Directory::new(Duration::from_secs(10), Arc::clone(&runtime)));
        let process = registry.register(SampleBody::Process(ProcessInfo::default()));
        let bus = InProcessBus::new();
        let provider = Arc::new(RegistrationProvider::new(
            registry,
            directory,
            Arc::new(bus.clone()),
            Arc::clone(&runtime),
            process,
        ));
        (provider, runtime, bus)
    }

    #[test]
    fn test_refresh_applies_locally_and_broadcasts() {
        let (provider, runtime, bus) = setup();
        let (tx, rx) = unbounded();
        let handler: DatagramHandler = Box::new(move |d: &[u8]| {
            let _ = tx.send(d.to_vec());
        });
        let _listening = bus.listen(handler).expect("listen");
        runtime.set_attribute("role", "test");

        provider.refresh();

        let datagram = rx.recv_timeout(Duration::from_secs(1)).expect("datagram");
        let samples = decode_datagram(&datagram).expect("decode");
        assert_eq!(samples.len(), 1);
        let SampleBody::Process(info) = &samples[0].body else {
            panic!("expected process sample");
        };
        assert_eq!(info.attributes, vec![("role".to_string(), "test".to_string())]);
        assert_eq!(provider.directory.processes().len(), 1);
        assert_eq!(provider.counters(), (1, 0));
    }

    #[test]
    fn test_spawned_provider_ticks() {
        let (provider, _runtime, _bus) = setup();
        let mut worker = provider.spawn(Duration::from_millis(30)).expect("spawn");
        std::thread::sleep(Duration::from_millis(200));
        worker.stop();
        let clock = provider.registry.get(&provider.process).expect("process").clock;
        assert!(clock >= 3, "clock {clock}");
    }
}
