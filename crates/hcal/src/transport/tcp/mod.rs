// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP transport: framing, the mio I/O thread, and the TCP payload layer.
//!
//! A publisher with TCP enabled listens on its own port and announces it;
//! subscribers that select TCP connect to every such publisher and receive
//! length-prefixed [`DataFrame`](crate::transport::DataFrame)s.

pub mod frame_codec;
pub mod io_thread;

pub use frame_codec::{FrameCodec, FrameLayout, ENVELOPE_HEADER_SIZE, LENGTH_PREFIX_SIZE};
pub use io_thread::{IoCommand, IoSettings, IoThread, IoThreadHandle, TcpEvent};

use crate::config::TcpConfig;
use crate::entity::{EntityId, LayerKind, LayerParameters, TcpLayerParams, TransportLayer};
use crate::transport::frame::{encode_frame, DataFrame};
use crate::transport::shm::PayloadWriter;
use crate::transport::{
    serialize, LayerError, LayerReader, LayerWriter, OutgoingSample, ReceivedSample, SampleSink,
};
use crate::worker::WorkerThread;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const EVENT_POLL: Duration = Duration::from_millis(100);

/// Registration entry announcing a publisher's listen port.
#[must_use]
pub fn announcement(port: u16) -> TransportLayer {
    TransportLayer::new(LayerParameters::Tcp(TcpLayerParams { port }))
}

/// Address of `host:port`; the loopback address for this host.
pub fn resolve_peer(host: &str, port: u16, local_host: &str) -> io::Result<SocketAddr> {
    if host == local_host {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    (host, port)
        .to_socket_addrs()?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no IPv4 address for host {host}"),
            )
        })
}

pub(crate) fn drain_events<F>(
    name: &str,
    events: Receiver<TcpEvent>,
    mut on_event: F,
) -> io::Result<WorkerThread>
where
    F: FnMut(TcpEvent) + Send + 'static,
{
    WorkerThread::spawn(name, move |shutdown| {
        while !shutdown.load(Ordering::Relaxed) {
            match events.recv_timeout(EVENT_POLL) {
                Ok(event) => on_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    })
}

// ============================================================================
// Writer
// ============================================================================

/// Publisher side: a listener broadcasting frames to every subscriber.
pub struct TcpLayerWriter {
    io: IoThreadHandle,
    subscribers: Arc<AtomicUsize>,
    _events: WorkerThread,
}

impl TcpLayerWriter {
    /// Listen on `port` (0 = ephemeral).
    pub fn open(topic: &str, config: &TcpConfig, port: u16) -> Result<Self, LayerError> {
        let io = IoThread::spawn(IoSettings {
            name: "tcp-pub".to_string(),
            layout: FrameLayout::LengthPrefix,
            max_message_size: config.max_message_size,
            nodelay: config.nodelay,
            listen: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)),
        })
        .map_err(|e| LayerError::io(LayerKind::Tcp, e))?;

        let subscribers = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&subscribers);
        let label = topic.to_string();
        let events = drain_events("tcp-pub-events", io.events().clone(), move |event| {
            match event {
                TcpEvent::Accepted { remote_addr, .. } => {
                    count.fetch_add(1, Ordering::Relaxed);
                    log::debug!("[TCP] {} subscriber connected from {}", label, remote_addr);
                }
                TcpEvent::Closed { remote_addr, .. } => {
                    count.fetch_sub(1, Ordering::Relaxed);
                    log::debug!("[TCP] {} subscriber {} left", label, remote_addr);
                }
                TcpEvent::Error { error, .. } => log::debug!("[TCP] {}: {}", label, error),
                _ => {}
            }
        })
        .map_err(|e| LayerError::io(LayerKind::Tcp, e))?;

        log::debug!("[TCP] {} listening on {:?}", topic, io.local_addr());
        Ok(Self {
            io,
            subscribers,
            _events: events,
        })
    }

    /// Bound listen port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.io.local_addr().map_or(0, |a| a.port())
    }

    /// Currently connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }
}

impl LayerWriter for TcpLayerWriter {
    fn kind(&self) -> LayerKind {
        LayerKind::Tcp
    }

    fn write(
        &mut self,
        sample: &OutgoingSample<'_>,
        payload: &mut dyn PayloadWriter,
    ) -> Result<usize, LayerError> {
        let data = serialize(payload)?;
        let frame = encode_frame(sample, &data)?;
        self.io
            .broadcast(frame)
            .map_err(|e| LayerError::io(LayerKind::Tcp, e))?;
        Ok(data.len())
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Called with the peer id when an established or pending link drops.
pub type LinkLost = Arc<dyn Fn(u64) + Send + Sync>;

/// Subscriber side: one outbound connection per publisher.
///
/// A link that closes without [`disconnect`](LayerReader::disconnect) is
/// reported through [`LinkLost`] so the owner can pick a layer again.
pub struct TcpLayerReader {
    local_host: String,
    io: IoThreadHandle,
    /// peer entity id -> connection id
    connections: Arc<Mutex<HashMap<u64, u64>>>,
    _events: WorkerThread,
}

impl TcpLayerReader {
    pub fn new(
        topic: &str,
        config: &TcpConfig,
        local_host: &str,
        sink: SampleSink,
        on_lost: LinkLost,
    ) -> Result<Self, LayerError> {
        let io = IoThread::spawn(IoSettings {
            name: "tcp-sub".to_string(),
            layout: FrameLayout::LengthPrefix,
            max_message_size: config.max_message_size,
            nodelay: config.nodelay,
            listen: None,
        })
        .map_err(|e| LayerError::io(LayerKind::Tcp, e))?;

        let topic = topic.to_string();
        let connections = Arc::new(Mutex::new(HashMap::new()));
        let links = Arc::clone(&connections);
        let events = drain_events("tcp-sub-events", io.events().clone(), move |event| {
            match event {
                TcpEvent::Message { payload, .. } => match DataFrame::decode(&payload) {
                    Ok(frame) if frame.topic == topic => sink(&ReceivedSample {
                        layer: LayerKind::Tcp,
                        sender_id: frame.sender_id,
                        clock: frame.clock,
                        timestamp: frame.timestamp,
                        payload: frame.payload,
                    }),
                    Ok(_) => {}
                    Err(e) => log::debug!("[TCP] dropping malformed frame on {}: {}", topic, e),
                },
                TcpEvent::Established { remote_addr, .. } => {
                    log::debug!("[TCP] {} connected to publisher {}", topic, remote_addr);
                }
                TcpEvent::Closed {
                    conn_id,
                    remote_addr,
                    reason,
                } => {
                    let lost = {
                        let mut links = links.lock();
                        let peer = links
                            .iter()
                            .find(|(_, c)| **c == conn_id)
                            .map(|(peer, _)| *peer);
                        if let Some(peer) = peer {
                            links.remove(&peer);
                        }
                        peer
                    };
                    log::debug!(
                        "[TCP] {} publisher {} closed: {}",
                        topic,
                        remote_addr,
                        reason.as_deref().unwrap_or("eof")
                    );
                    if let Some(peer) = lost {
                        on_lost(peer);
                    }
                }
                _ => {}
            }
        })
        .map_err(|e| LayerError::io(LayerKind::Tcp, e))?;

        Ok(Self {
            local_host: local_host.to_string(),
            io,
            connections,
            _events: events,
        })
    }
}

impl LayerReader for TcpLayerReader {
    fn kind(&self) -> LayerKind {
        LayerKind::Tcp
    }

    fn connect(&mut self, peer: &EntityId, layer: &TransportLayer) -> Result<(), LayerError> {
        let LayerParameters::Tcp(params) = &layer.params else {
            return Err(LayerError::MissingParameters(LayerKind::Tcp));
        };
        if params.port == 0 {
            return Err(LayerError::MissingParameters(LayerKind::Tcp));
        }
        if self.connections.lock().contains_key(&peer.id()) {
            return Ok(());
        }
        // Name resolution may block; keep it outside the lock.
        let addr = resolve_peer(peer.host_name(), params.port, &self.local_host)
            .map_err(|e| LayerError::io(LayerKind::Tcp, e))?;
        // Held across the connect command so a fast Closed event cannot
        // race the insert.
        let mut connections = self.connections.lock();
        if connections.contains_key(&peer.id()) {
            return Ok(());
        }
        let conn_id = self
            .io
            .connect(addr)
            .map_err(|e| LayerError::io(LayerKind::Tcp, e))?;
        connections.insert(peer.id(), conn_id);
        Ok(())
    }

    fn disconnect(&mut self, peer: &EntityId) {
        let removed = self.connections.lock().remove(&peer.id());
        if let Some(conn_id) = removed {
            let _ = self.io.close(conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sample_sink;
    use crate::transport::shm::BytesPayload;
    use crossbeam::channel::{unbounded, Receiver};
    use std::time::Instant;

    fn ignore_lost() -> LinkLost {
        Arc::new(|_| {})
    }

    fn collecting_reader(topic: &str, on_lost: LinkLost) -> (TcpLayerReader, Receiver<Vec<u8>>) {
        let (tx, rx) = unbounded();
        let sink = sample_sink(move |s| {
            let _ = tx.send(s.payload.to_vec());
        });
        let reader =
            TcpLayerReader::new(topic, &TcpConfig::default(), "me", sink, on_lost).expect("reader");
        (reader, rx)
    }

    fn wait_for_subscriber(writer: &TcpLayerWriter) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while writer.subscriber_count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(writer.subscriber_count(), 1);
    }

    fn header(topic: &str) -> OutgoingSample<'_> {
        OutgoingSample {
            sender_id: 9,
            clock: 1,
            timestamp: 42,
            topic,
        }
    }

    #[test]
    fn test_resolve_local_host_is_loopback() {
        let addr = resolve_peer("me", 4000, "me").expect("resolve");
        assert_eq!(addr, "127.0.0.1:4000".parse().expect("addr"));
    }

    #[test]
    fn test_reader_receives_from_writer() {
        let config = TcpConfig::default();
        let mut writer = TcpLayerWriter::open("tcp-topic", &config, 0).expect("writer");
        assert_ne!(writer.port(), 0);

        let (tx, rx) = unbounded();
        let sink = sample_sink(move |s| {
            let _ = tx.send((s.layer, s.sender_id, s.timestamp, s.payload.to_vec()));
        });
        let mut reader =
            TcpLayerReader::new("tcp-topic", &config, "me", sink, ignore_lost()).expect("reader");
        let publisher = EntityId::new(9, 1, "me");
        reader
            .connect(&publisher, &announcement(writer.port()))
            .expect("connect");
        wait_for_subscriber(&writer);

        writer
            .write(&header("tcp-topic"), &mut BytesPayload(b"over tcp"))
            .expect("write");
        let got = rx.recv_timeout(Duration::from_secs(2)).expect("sample");
        assert_eq!(got, (LayerKind::Tcp, 9, 42, b"over tcp".to_vec()));
    }

    #[test]
    fn test_closed_link_reported_and_reconnects() {
        let config = TcpConfig::default();
        let writer = TcpLayerWriter::open("relink", &config, 0).expect("writer");
        let port = writer.port();

        let (lost_tx, lost_rx) = unbounded();
        let on_lost: LinkLost = Arc::new(move |peer| {
            let _ = lost_tx.send(peer);
        });
        let (mut reader, rx) = collecting_reader("relink", on_lost);
        let publisher = EntityId::new(9, 1, "me");
        reader.connect(&publisher, &announcement(port)).expect("connect");
        wait_for_subscriber(&writer);

        drop(writer);
        let peer = lost_rx.recv_timeout(Duration::from_secs(2)).expect("lost");
        assert_eq!(peer, 9);

        let mut writer = TcpLayerWriter::open("relink", &config, port).expect("restart");
        reader.connect(&publisher, &announcement(port)).expect("reconnect");
        wait_for_subscriber(&writer);
        writer
            .write(&header("relink"), &mut BytesPayload(b"again"))
            .expect("write");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("sample"), b"again");
    }

    #[test]
    fn test_disconnect_is_not_reported_as_lost() {
        let config = TcpConfig::default();
        let writer = TcpLayerWriter::open("quiet", &config, 0).expect("writer");
        let (lost_tx, lost_rx) = unbounded();
        let on_lost: LinkLost = Arc::new(move |peer| {
            let _ = lost_tx.send(peer);
        });
        let (mut reader, _rx) = collecting_reader("quiet", on_lost);
        let publisher = EntityId::new(3, 1, "me");
        reader
            .connect(&publisher, &announcement(writer.port()))
            .expect("connect");
        wait_for_subscriber(&writer);

        reader.disconnect(&publisher);
        assert!(lost_rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_unresolvable_peer_fails_without_holding_links() {
        let (mut reader, _rx) = collecting_reader("t", ignore_lost());
        let bad = EntityId::new(1, 1, "no-such-host.invalid");
        assert!(matches!(
            reader.connect(&bad, &announcement(4000)),
            Err(LayerError::Io { .. })
        ));
        assert!(reader.connections.lock().is_empty());
    }

    #[test]
    fn test_connect_requires_port() {
        let (mut reader, _rx) = collecting_reader("t", ignore_lost());
        let err = reader
            .connect(&EntityId::new(1, 1, "me"), &announcement(0))
            .expect_err("port 0");
        assert!(matches!(err, LayerError::MissingParameters(LayerKind::Tcp)));
    }
}
