// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process ownership of channel writers.
//!
//! Publishers of the same topic in one process share a single
//! [`ChannelWriter`]. The arena only keeps weak references: the channel is
//! closed when the last [`WriterHandle`] goes away.

use super::channel::{ChannelOptions, ChannelWriter, WriteParams, WriteReport};
use super::metrics::ShmMetrics;
use super::payload::PayloadWriter;
use super::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type ChannelKey = (String, String);

/// Registry of open channel writers keyed by (domain, topic).
#[derive(Default)]
pub struct ChannelArena {
    writers: DashMap<ChannelKey, Weak<Mutex<ChannelWriter>>>,
}

impl ChannelArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the writer of `topic`, opening the channel on first use.
    pub fn acquire(
        &self,
        topic: &str,
        options: ChannelOptions,
        params: WriteParams,
    ) -> Result<WriterHandle> {
        let key = (options.domain.clone(), topic.to_string());
        let mut entry = self.writers.entry(key).or_default();
        if let Some(channel) = entry.upgrade() {
            return Ok(WriterHandle { channel, params });
        }
        let channel = Arc::new(Mutex::new(ChannelWriter::open(topic, options)?));
        *entry = Arc::downgrade(&channel);
        Ok(WriterHandle { channel, params })
    }

    /// Number of channels with at least one live handle.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.writers.retain(|_, weak| weak.strong_count() > 0);
        self.writers.len()
    }
}

impl std::fmt::Debug for ChannelArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelArena")
            .field("channels", &self.writers.len())
            .finish()
    }
}

/// A publisher's handle on a shared channel writer.
pub struct WriterHandle {
    channel: Arc<Mutex<ChannelWriter>>,
    params: WriteParams,
}

impl WriterHandle {
    pub fn write(&self, payload: &mut dyn PayloadWriter) -> Result<WriteReport> {
        self.channel.lock().write(payload, self.params)
    }

    /// Write a payload stamped with its send time.
    pub fn write_at(&self, payload: &mut dyn PayloadWriter, timestamp: i64) -> Result<WriteReport> {
        let params = WriteParams {
            timestamp,
            ..self.params
        };
        self.channel.lock().write(payload, params)
    }

    pub fn write_bytes(&self, data: &[u8]) -> Result<WriteReport> {
        self.channel.lock().write_bytes(data, self.params)
    }

    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.channel.lock().reader_count()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<ShmMetrics> {
        self.channel.lock().metrics()
    }

    #[must_use]
    pub fn params(&self) -> WriteParams {
        self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::shm::ChannelReader;

    fn options() -> ChannelOptions {
        ChannelOptions {
            domain: format!("a{:08x}", fastrand::u32(..)),
            min_size: 64,
            ..ChannelOptions::default()
        }
    }

    #[test]
    fn test_handles_share_one_channel() {
        let arena = ChannelArena::new();
        let opts = options();
        let a = arena
            .acquire("topic", opts.clone(), WriteParams::default())
            .expect("a");
        let b = arena
            .acquire("topic", opts.clone(), WriteParams::default())
            .expect("b");
        assert!(Arc::ptr_eq(&a.channel, &b.channel));
        assert_eq!(arena.open_channels(), 1);

        let mut reader = ChannelReader::new(&opts.domain, "topic");
        a.write_bytes(b"one").expect("write a");
        assert_eq!(reader.try_read().expect("one").data, b"one");
        b.write_bytes(b"two").expect("write b");
        assert_eq!(reader.try_read().expect("two").data, b"two");
    }

    #[test]
    fn test_last_handle_closes_channel() {
        let arena = ChannelArena::new();
        let opts = options();
        let a = arena
            .acquire("gone", opts.clone(), WriteParams::default())
            .expect("a");
        let name = a.channel.lock().name().to_string();
        drop(a);
        assert_eq!(arena.open_channels(), 0);
        assert!(!crate::transport::shm::ShmSegment::exists(&name));
    }
}
