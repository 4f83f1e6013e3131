// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP multicast sockets and the UDP payload layer.
//!
//! Payload traffic is spread over the groups `base + (hash(topic) & mask)`
//! on a single port. Receivers bound to that port see every group joined on
//! the host, so frames carry their topic and foreign topics are dropped.
//! Frames larger than one datagram are cut by the [`fragment`] layer.
//!
//! [`fragment`]: crate::transport::fragment

use crate::config::{
    UdpConfig, UDP_FRAGMENT_MAX_PENDING, UDP_FRAGMENT_TIMEOUT_MS, UDP_MAX_DATAGRAM_BYTES,
    UDP_MAX_MESSAGE_BYTES,
};
use crate::entity::{
    hash_string, EntityId, LayerKind, LayerParameters, TransportLayer, UdpLayerParams,
};
use crate::transport::fragment::{Fragmenter, Reassembler};
use crate::transport::frame::{encode_frame, DataFrame, FRAME_OVERHEAD};
use crate::transport::shm::PayloadWriter;
use crate::transport::{
    serialize, LayerError, LayerReader, LayerWriter, OutgoingSample, ReceivedSample, SampleSink,
};
use crate::worker::WorkerThread;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::Ordering;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const RECV_BUFFER_BYTES: usize = 65_536;

// ============================================================================
// Sockets
// ============================================================================

/// Multicast group carrying `topic`.
#[must_use]
pub fn group_for_topic(base: Ipv4Addr, mask: Ipv4Addr, topic: &str) -> Ipv4Addr {
    let offset = hash_string(topic) & u32::from(mask);
    Ipv4Addr::from(u32::from(base).wrapping_add(offset))
}

/// Socket bound to `port` and joined to `group`.
pub fn open_receiver(group: Ipv4Addr, port: u16, config: &UdpConfig) -> io::Result<UdpSocket> {
    let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket2.set_reuse_address(true)?;
    if let Err(e) = socket2.set_recv_buffer_size(config.rcvbuf_bytes) {
        log::debug!("[UDP] SO_RCVBUF {} refused: {}", config.rcvbuf_bytes, e);
    }
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket2.bind(&bind_addr.into())?;

    let socket: UdpSocket = socket2.into();
    let iface = config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    match socket.join_multicast_v4(&group, &iface) {
        Ok(()) => log::debug!("[UDP] join_multicast_v4({}) on {}", group, iface),
        // EADDRINUSE: already joined on this NIC
        Err(e) if e.raw_os_error() == Some(libc::EADDRINUSE) => {
            log::debug!("[UDP] join_multicast_v4({}) on {} - already joined", group, iface);
        }
        Err(e) => return Err(e),
    }
    socket.set_multicast_loop_v4(true)?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    Ok(socket)
}

/// Unbound-port socket for sending multicast.
pub fn open_sender(config: &UdpConfig) -> io::Result<UdpSocket> {
    let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket2.set_send_buffer_size(config.sndbuf_bytes) {
        log::debug!("[UDP] SO_SNDBUF {} refused: {}", config.sndbuf_bytes, e);
    }
    if let Some(iface) = config.interface {
        socket2.set_multicast_if_v4(&iface)?;
    }
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    socket2.bind(&bind_addr.into())?;

    let socket: UdpSocket = socket2.into();
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(config.ttl)?;
    Ok(socket)
}

/// Fragmenter sized for the UDP carriers.
pub(crate) fn fragmenter() -> Fragmenter {
    Fragmenter::new(UDP_MAX_DATAGRAM_BYTES, UDP_MAX_MESSAGE_BYTES)
}

/// Reassembler sized for the UDP carriers.
pub(crate) fn reassembler() -> Reassembler {
    Reassembler::new(
        UDP_FRAGMENT_MAX_PENDING,
        UDP_MAX_MESSAGE_BYTES,
        Duration::from_millis(UDP_FRAGMENT_TIMEOUT_MS),
    )
}

/// Send `message` to `destination`, fragmented as needed.
pub(crate) fn send_message(
    socket: &UdpSocket,
    fragmenter: &Fragmenter,
    message: &[u8],
    destination: SocketAddr,
) -> io::Result<()> {
    let datagrams = fragmenter
        .split(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    for datagram in &datagrams {
        socket.send_to(datagram, destination)?;
    }
    Ok(())
}

/// Wrap `handler` so it sees whole messages instead of fragments.
pub(crate) fn reassembling<F>(label: String, mut handler: F) -> impl FnMut(&[u8]) + Send + 'static
where
    F: FnMut(&[u8]) + Send + 'static,
{
    let mut reassembler = reassembler();
    move |datagram: &[u8]| match reassembler.insert(datagram) {
        Ok(Some(message)) => handler(&message[..]),
        Ok(None) => {}
        Err(e) => log::debug!("[UDP] {} dropping datagram: {}", label, e),
    }
}

/// Run `handler` on every datagram received by `socket` until shutdown.
pub(crate) fn spawn_receive_loop<F>(
    name: &str,
    socket: UdpSocket,
    mut handler: F,
) -> io::Result<WorkerThread>
where
    F: FnMut(&[u8]) + Send + 'static,
{
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    let label = name.to_string();
    WorkerThread::spawn(name, move |shutdown| {
        let mut buf = vec![0u8; RECV_BUFFER_BYTES];
        while !shutdown.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((n, _from)) => handler(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    log::debug!("[UDP] {} receive failed: {}", label, e);
                    std::thread::sleep(RECV_TIMEOUT);
                }
            }
        }
    })
}

// ============================================================================
// Payload layer
// ============================================================================

/// Registration entry announcing a topic's UDP group.
#[must_use]
pub fn announcement(config: &UdpConfig, topic: &str) -> TransportLayer {
    TransportLayer::new(LayerParameters::Udp(UdpLayerParams {
        group: group_for_topic(config.group, config.mask, topic),
        port: config.payload_port,
        ttl: config.ttl,
    }))
}

/// Publisher side: one socket sending to the topic's group.
pub struct UdpLayerWriter {
    socket: UdpSocket,
    destination: SocketAddr,
    fragmenter: Fragmenter,
}

impl UdpLayerWriter {
    pub fn open(config: &UdpConfig, topic: &str) -> Result<Self, LayerError> {
        let socket = open_sender(config).map_err(|e| LayerError::io(LayerKind::Udp, e))?;
        let group = group_for_topic(config.group, config.mask, topic);
        log::debug!("[UDP] {} -> {}:{}", topic, group, config.payload_port);
        Ok(Self::with_destination(
            socket,
            SocketAddr::V4(SocketAddrV4::new(group, config.payload_port)),
        ))
    }

    pub(crate) fn with_destination(socket: UdpSocket, destination: SocketAddr) -> Self {
        Self {
            socket,
            destination,
            fragmenter: fragmenter(),
        }
    }
}

impl LayerWriter for UdpLayerWriter {
    fn kind(&self) -> LayerKind {
        LayerKind::Udp
    }

    fn write(
        &mut self,
        sample: &OutgoingSample<'_>,
        payload: &mut dyn PayloadWriter,
    ) -> Result<usize, LayerError> {
        let size = FRAME_OVERHEAD + sample.topic.len() + payload.get_size();
        if size > self.fragmenter.max_message() {
            return Err(LayerError::PayloadTooLarge {
                layer: LayerKind::Udp,
                size,
                max: self.fragmenter.max_message(),
            });
        }
        let data = serialize(payload)?;
        let frame = encode_frame(sample, &data)?;
        send_message(&self.socket, &self.fragmenter, &frame, self.destination)
            .map_err(|e| LayerError::io(LayerKind::Udp, e))?;
        Ok(data.len())
    }
}

/// Subscriber side: one receive thread per announced group.
pub struct UdpLayerReader {
    topic: String,
    config: UdpConfig,
    sink: SampleSink,
    groups: HashMap<(Ipv4Addr, u16), WorkerThread>,
}

impl UdpLayerReader {
    #[must_use]
    pub fn new(topic: &str, config: UdpConfig, sink: SampleSink) -> Self {
        Self {
            topic: topic.to_string(),
            config,
            sink,
            groups: HashMap::new(),
        }
    }
}

/// Handler reassembling datagrams and decoding frames of `topic` into `sink`.
fn frame_handler(topic: String, sink: SampleSink) -> impl FnMut(&[u8]) + Send + 'static {
    let label = topic.clone();
    reassembling(label, move |message: &[u8]| match DataFrame::decode(message) {
        Ok(frame) if frame.topic == topic => sink(&ReceivedSample {
            layer: LayerKind::Udp,
            sender_id: frame.sender_id,
            clock: frame.clock,
            timestamp: frame.timestamp,
            payload: frame.payload,
        }),
        Ok(_) => {}
        Err(e) => log::debug!("[UDP] dropping malformed frame on {}: {}", topic, e),
    })
}

impl LayerReader for UdpLayerReader {
    fn kind(&self) -> LayerKind {
        LayerKind::Udp
    }

    fn connect(&mut self, _peer: &EntityId, layer: &TransportLayer) -> Result<(), LayerError> {
        let LayerParameters::Udp(params) = &layer.params else {
            return Err(LayerError::MissingParameters(LayerKind::Udp));
        };
        let key = (params.group, params.port);
        if self.groups.contains_key(&key) {
            return Ok(());
        }
        let socket = open_receiver(params.group, params.port, &self.config)
            .map_err(|e| LayerError::io(LayerKind::Udp, e))?;
        let handler = frame_handler(self.topic.clone(), SampleSink::clone(&self.sink));
        let thread = spawn_receive_loop("udp-reader", socket, handler)
            .map_err(|e| LayerError::io(LayerKind::Udp, e))?;
        log::debug!("[UDP] reading {} on {}:{}", self.topic, params.group, params.port);
        self.groups.insert(key, thread);
        Ok(())
    }

    fn disconnect(&mut self, _peer: &EntityId) {
        // Groups are shared by every publisher of the topic.
    }
}
