// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared memory as a publisher/subscriber layer.

use super::arena::{ChannelArena, WriterHandle};
use super::channel::{ChannelOptions, ChannelReader, WriteParams};
use super::payload::PayloadWriter;
use crate::entity::{EntityId, LayerKind, LayerParameters, ShmLayerParams, TransportLayer};
use crate::transport::{
    LayerError, LayerReader, LayerWriter, OutgoingSample, ReceivedSample, SampleSink,
};
use crate::worker::WorkerThread;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

const READER_WAIT: Duration = Duration::from_millis(100);

/// Registration entry announcing a publisher's shm settings.
#[must_use]
pub fn announcement(options: &ChannelOptions, params: &WriteParams) -> TransportLayer {
    TransportLayer::new(LayerParameters::Shm(ShmLayerParams {
        domain: options.domain.clone(),
        buffer_count: options.buffer_count,
        zero_copy: params.zero_copy,
        acknowledge_timeout_ms: params
            .acknowledge_timeout
            .map(|t| t.as_millis().min(u128::from(u32::MAX)) as u32),
    }))
}

/// Publisher side: a handle on the topic's shared channel.
pub struct ShmLayerWriter {
    handle: WriterHandle,
}

impl ShmLayerWriter {
    pub fn open(
        arena: &ChannelArena,
        topic: &str,
        options: ChannelOptions,
        params: WriteParams,
    ) -> Result<Self, LayerError> {
        let handle = arena.acquire(topic, options, params)?;
        Ok(Self { handle })
    }

    #[must_use]
    pub fn handle(&self) -> &WriterHandle {
        &self.handle
    }
}

impl LayerWriter for ShmLayerWriter {
    fn kind(&self) -> LayerKind {
        LayerKind::Shm
    }

    fn write(
        &mut self,
        sample: &OutgoingSample<'_>,
        payload: &mut dyn PayloadWriter,
    ) -> Result<usize, LayerError> {
        // Channel slots carry writer id and clock themselves.
        let report = self.handle.write_at(payload, sample.timestamp)?;
        Ok(report.bytes)
    }
}

/// Subscriber side: one reader thread per announced domain.
pub struct ShmLayerReader {
    topic: String,
    sink: SampleSink,
    domains: HashMap<String, WorkerThread>,
}

impl ShmLayerReader {
    #[must_use]
    pub fn new(topic: &str, sink: SampleSink) -> Self {
        Self {
            topic: topic.to_string(),
            sink,
            domains: HashMap::new(),
        }
    }

    fn spawn_reader(&self, domain: &str) -> Result<WorkerThread, LayerError> {
        let mut reader = ChannelReader::open(domain, &self.topic)?;
        let sink = SampleSink::clone(&self.sink);
        let thread = WorkerThread::spawn("shm-reader", move |shutdown| {
            while !shutdown.load(Ordering::Relaxed) {
                if !reader.wait(READER_WAIT) {
                    continue;
                }
                while let Some(sample) = reader.try_read() {
                    sink(&ReceivedSample {
                        layer: LayerKind::Shm,
                        sender_id: sample.info.writer_id,
                        clock: sample.info.clock,
                        timestamp: sample.info.timestamp,
                        payload: &sample.data,
                    });
                }
            }
        })
        .map_err(|e| LayerError::io(LayerKind::Shm, e))?;
        log::debug!("[SHM] reading {} in domain {}", self.topic, domain);
        Ok(thread)
    }
}

impl LayerReader for ShmLayerReader {
    fn kind(&self) -> LayerKind {
        LayerKind::Shm
    }

    fn connect(&mut self, _peer: &EntityId, layer: &TransportLayer) -> Result<(), LayerError> {
        let LayerParameters::Shm(params) = &layer.params else {
            return Err(LayerError::MissingParameters(LayerKind::Shm));
        };
        if !self.domains.contains_key(&params.domain) {
            let thread = self.spawn_reader(&params.domain)?;
            self.domains.insert(params.domain.clone(), thread);
        }
        Ok(())
    }

    fn disconnect(&mut self, _peer: &EntityId) {
        // The channel is shared by every writer of the topic; keep reading.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::shm::BytesPayload;
    use crate::transport::sample_sink;
    use crossbeam::channel::unbounded;

    #[test]
    fn test_writer_to_reader_thread() {
        let domain = format!("l{:08x}", fastrand::u32(..));
        let options = ChannelOptions {
            domain: domain.clone(),
            min_size: 64,
            ..ChannelOptions::default()
        };
        let params = WriteParams {
            writer_id: 77,
            ..WriteParams::default()
        };
        let arena = ChannelArena::new();
        let mut writer =
            ShmLayerWriter::open(&arena, "link", options.clone(), params).expect("writer");

        let (tx, rx) = unbounded();
        let sink = sample_sink(move |s| {
            let _ = tx.send((s.layer, s.sender_id, s.timestamp, s.payload.to_vec()));
        });
        let mut reader = ShmLayerReader::new("link", sink);
        let peer = EntityId::new(77, 1, "h");
        reader
            .connect(&peer, &announcement(&options, &params))
            .expect("connect");

        let header = OutgoingSample {
            sender_id: 77,
            clock: 1,
            timestamp: 123,
            topic: "link",
        };
        writer
            .write(&header, &mut BytesPayload(b"hello"))
            .expect("write");
        let got = rx.recv_timeout(Duration::from_secs(2)).expect("sample");
        assert_eq!(got, (LayerKind::Shm, 77, 123, b"hello".to_vec()));
    }

    #[test]
    fn test_connect_rejects_unusable_domain() {
        let sink = sample_sink(|_| {});
        let mut reader = ShmLayerReader::new("t", sink);
        let options = ChannelOptions {
            domain: "x".repeat(300),
            ..ChannelOptions::default()
        };
        let layer = announcement(&options, &WriteParams::default());
        assert!(reader.connect(&EntityId::new(1, 1, "h"), &layer).is_err());
    }
}
