// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Carriers for registration datagrams.
//!
//! Discovery traffic is best effort on every carrier: datagrams may be lost
//! and are made good by the next refresh. One carrier is chosen per context:
//!
//! | Carrier                   | Reach               |
//! |---------------------------|---------------------|
//! | [`UdpRegistration`]       | network (multicast) |
//! | [`ShmRegistration`]       | processes of a host |
//! | [`InProcessBus`]          | contexts of a process |

use crate::config::{RegistrationConfig, ShmConfig, UdpConfig, UDP_MAX_DATAGRAM_BYTES};
use crate::transport::shm::{ShmBroadcastQueue, ShmError, BROADCAST_SLOT_SIZE};
use crate::transport::fragment::Fragmenter;
use crate::transport::udp::{
    fragmenter, open_receiver, open_sender, reassembling, send_message, spawn_receive_loop,
};
use crate::worker::WorkerThread;
use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(100);

/// Callback receiving every datagram, on the carrier's receive thread.
pub type DatagramHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Keeps a receive path open; dropping it stops delivery.
pub struct Listening {
    _guard: Box<dyn Send>,
}

impl Listening {
    fn new<G: Send + 'static>(guard: G) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for Listening {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Listening")
    }
}

/// One registration carrier.
pub trait RegistrationTransport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Largest datagram the provider should pack. Carriers that fragment
    /// also accept bigger ones.
    fn max_datagram(&self) -> usize;

    /// Broadcast one datagram.
    fn send(&self, datagram: &[u8]) -> io::Result<()>;

    /// Start delivering received datagrams to `handler`.
    fn listen(&self, handler: DatagramHandler) -> io::Result<Listening>;
}

// ============================================================================
// UDP multicast
// ============================================================================

/// Registration over the multicast group on the registration port.
///
/// Datagrams above one UDP datagram are fragmented and reassembled.
pub struct UdpRegistration {
    config: UdpConfig,
    socket: UdpSocket,
    destination: SocketAddr,
    fragmenter: Fragmenter,
}

impl UdpRegistration {
    pub fn open(config: &UdpConfig) -> io::Result<Self> {
        let socket = open_sender(config)?;
        let destination = SocketAddr::V4(SocketAddrV4::new(config.group, config.registration_port));
        log::debug!("[REG] udp registration -> {}", destination);
        Ok(Self::with_destination(config, socket, destination))
    }

    pub(crate) fn with_destination(
        config: &UdpConfig,
        socket: UdpSocket,
        destination: SocketAddr,
    ) -> Self {
        Self {
            config: config.clone(),
            socket,
            destination,
            fragmenter: fragmenter(),
        }
    }
}

impl RegistrationTransport for UdpRegistration {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn max_datagram(&self) -> usize {
        UDP_MAX_DATAGRAM_BYTES
    }

    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        send_message(&self.socket, &self.fragmenter, datagram, self.destination)
    }

    fn listen(&self, mut handler: DatagramHandler) -> io::Result<Listening> {
        let socket = open_receiver(self.config.group, self.config.registration_port, &self.config)?;
        let worker = spawn_receive_loop(
            "reg-udp",
            socket,
            reassembling("registration".to_string(), move |datagram| handler(datagram)),
        )?;
        Ok(Listening::new(worker))
    }
}

// ============================================================================
// Shared memory broadcast
// ============================================================================

/// Registration over the broadcast queue of a shared memory domain.
pub struct ShmRegistration {
    domain: String,
    capacity: usize,
    lock_timeout: Duration,
    queue: ShmBroadcastQueue,
}

fn shm_to_io(e: ShmError) -> io::Error {
    match e {
        ShmError::SegmentCreate(e) | ShmError::SegmentOpen(e) | ShmError::Mmap(e) => e,
        other => io::Error::other(other),
    }
}

impl ShmRegistration {
    pub fn open(registration: &RegistrationConfig, shm: &ShmConfig) -> io::Result<Self> {
        let queue =
            ShmBroadcastQueue::open(&shm.domain, registration.shm_queue_size, shm.lock_timeout)
                .map_err(shm_to_io)?;
        Ok(Self {
            domain: shm.domain.clone(),
            capacity: registration.shm_queue_size,
            lock_timeout: shm.lock_timeout,
            queue,
        })
    }
}

impl RegistrationTransport for ShmRegistration {
    fn name(&self) -> &'static str {
        "shm"
    }

    fn max_datagram(&self) -> usize {
        BROADCAST_SLOT_SIZE
    }

    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.queue.push(datagram).map_err(shm_to_io)
    }

    fn listen(&self, mut handler: DatagramHandler) -> io::Result<Listening> {
        let mut queue = ShmBroadcastQueue::open(&self.domain, self.capacity, self.lock_timeout)
            .map_err(shm_to_io)?;
        let worker = WorkerThread::spawn("reg-shm", move |shutdown| {
            while !shutdown.load(Ordering::Relaxed) {
                while let Some(message) = queue.try_pop() {
                    handler(&message);
                }
                queue.wait(POLL);
            }
        })?;
        Ok(Listening::new(worker))
    }
}

// ============================================================================
// In-process bus
// ============================================================================

type Subscribers = Mutex<Vec<(u64, Sender<Vec<u8>>)>>;

/// Registration between contexts of one process.
///
/// Clones share the same bus. Every listener gets every datagram on its own
/// delivery thread, senders included.
#[derive(Clone, Default)]
pub struct InProcessBus {
    subscribers: Arc<Subscribers>,
    next_id: Arc<AtomicU64>,
}

impl InProcessBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

struct BusListener {
    id: u64,
    subscribers: Arc<Subscribers>,
    _worker: WorkerThread,
}

impl Drop for BusListener {
    fn drop(&mut self) {
        self.subscribers.lock().retain(|(id, _)| *id != self.id);
    }
}

impl RegistrationTransport for InProcessBus {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn max_datagram(&self) -> usize {
        UDP_MAX_DATAGRAM_BYTES
    }

    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        for (_, tx) in self.subscribers.lock().iter() {
            let _ = tx.send(datagram.to_vec());
        }
        Ok(())
    }

    fn listen(&self, mut handler: DatagramHandler) -> io::Result<Listening> {
        let (tx, rx) = unbounded::<Vec<u8>>();
        let worker = WorkerThread::spawn("reg-bus", move |shutdown| {
            while !shutdown.load(Ordering::Relaxed) {
                match rx.recv_timeout(POLL) {
                    Ok(datagram) => handler(&datagram),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, tx));
        Ok(Listening::new(BusListener {
            id,
            subscribers: Arc::clone(&self.subscribers),
            _worker: worker,
        }))
    }
}

impl std::fmt::Debug for InProcessBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting() -> (DatagramHandler, crossbeam::channel::Receiver<Vec<u8>>) {
        let (tx, rx) = unbounded();
        let handler: DatagramHandler = Box::new(move |d: &[u8]| {
            let _ = tx.send(d.to_vec());
        });
        (handler, rx)
    }

    #[test]
    fn test_bus_delivers_to_every_listener() {
        let bus = InProcessBus::new();
        let (h1, rx1) = collecting();
        let (h2, rx2) = collecting();
        let _l1 = bus.listen(h1).expect("listen");
        let _l2 = bus.clone().listen(h2).expect("listen");
        assert_eq!(bus.listener_count(), 2);

        bus.send(b"hello").expect("send");
        assert_eq!(rx1.recv_timeout(Duration::from_secs(1)).expect("rx1"), b"hello");
        assert_eq!(rx2.recv_timeout(Duration::from_secs(1)).expect("rx2"), b"hello");
    }

    #[test]
    fn test_dropped_listener_unsubscribes() {
        let bus = InProcessBus::new();
        let (handler, _rx) = collecting();
        let listening = bus.listen(handler).expect("listen");
        drop(listening);
        assert_eq!(bus.listener_count(), 0);
        bus.send(b"nobody").expect("send");
    }

    #[test]
    fn test_udp_registration_fragments_large_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let dest = receiver.local_addr().expect("addr");
        let (handler, rx) = collecting();
        let _worker =
            spawn_receive_loop("reg-test", receiver, reassembling("test".into(), handler))
                .expect("spawn");

        let socket = UdpSocket::bind("127.0.0.1:0").expect("sender");
        let registration = UdpRegistration::with_destination(&UdpConfig::default(), socket, dest);
        let big: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
        assert!(big.len() > registration.max_datagram());
        registration.send(&big).expect("send big");
        registration.send(b"small").expect("send small");

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("big"), big);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("small"), b"small");
    }

    #[test]
    fn test_shm_registration_round_trip() {
        let registration = RegistrationConfig::default();
        let shm = ShmConfig {
            domain: format!("r{:08x}", fastrand::u32(..)),
            ..ShmConfig::default()
        };
        let carrier = ShmRegistration::open(&registration, &shm).expect("open");
        let (handler, rx) = collecting();
        let _listening = carrier.listen(handler).expect("listen");
        carrier.send(b"registration").expect("send");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).expect("datagram"),
            b"registration"
        );
        ShmBroadcastQueue::unlink(&shm.domain);
    }
}
