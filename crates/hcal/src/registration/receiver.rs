// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration receiver: carrier datagrams into the directory.
//!
//! Samples of entities owned by this context are skipped unless loopback is
//! enabled; the provider already applied them locally.

use super::codec::decode_datagram;
use super::transport::{Listening, RegistrationTransport};
use crate::directory::Directory;
use crate::registry::EntityRegistry;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receiver counters.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub datagrams: AtomicU64,
    pub samples: AtomicU64,
    pub own_skipped: AtomicU64,
    pub decode_errors: AtomicU64,
}

/// Receive side of registration for one context. Stops on drop.
#[derive(Debug)]
pub struct RegistrationReceiver {
    stats: Arc<ReceiverStats>,
    _listening: Listening,
}

impl RegistrationReceiver {
    pub fn start(
        transport: &dyn RegistrationTransport,
        directory: Arc<Directory>,
        registry: Arc<EntityRegistry>,
        loopback: bool,
    ) -> io::Result<Self> {
        let stats = Arc::new(ReceiverStats::default());
        let counters = Arc::clone(&stats);
        let listening = transport.listen(Box::new(move |datagram: &[u8]| {
            counters.datagrams.fetch_add(1, Ordering::Relaxed);
            let samples = match decode_datagram(datagram) {
                Ok(samples) => samples,
                Err(e) => {
                    counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    log::debug!("[REG] dropping datagram of {} bytes: {}", datagram.len(), e);
                    return;
                }
            };
            for sample in samples {
                if !loopback && registry.owns(sample.entity.id()) {
                    counters.own_skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                counters.samples.fetch_add(1, Ordering::Relaxed);
                directory.apply(sample);
            }
        }))?;
        log::debug!("[REG] receiving over {}", transport.name());
        Ok(Self {
            stats,
            _listening: listening,
        })
    }

    #[must_use]
    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }
}
