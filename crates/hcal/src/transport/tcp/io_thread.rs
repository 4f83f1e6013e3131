// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mio event loop shared by TCP payload links and service sessions.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                        IoThread                             |
//! |  +-------------------------------------------------------+  |
//! |  |                    mio::Poll                          |  |
//! |  |  - TcpListener (optional, accept)                     |  |
//! |  |  - TcpStreams (read frames / flush send queues)       |  |
//! |  |  - Waker (commands from IoThreadHandle)               |  |
//! |  +-------------------------------------------------------+  |
//! |                              |                              |
//! |                              v                              |
//! |  +-------------------------------------------------------+  |
//! |  |        crossbeam event channel -> owning component     |  |
//! |  +-------------------------------------------------------+  |
//! +-------------------------------------------------------------+
//! ```
//!
//! Connection ids come from one counter for accepted and initiated
//! connections, so they never collide within a thread.

use super::frame_codec::{FrameCodec, FrameLayout};
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const CONNECTION_TOKEN_START: usize = 2;
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_EVENTS: usize = 128;

// ============================================================================
// Settings, events and commands
// ============================================================================

/// Per-thread settings.
#[derive(Debug, Clone)]
pub struct IoSettings {
    /// Thread name suffix (`hcal-<name>`)
    pub name: String,
    pub layout: FrameLayout,
    pub max_message_size: usize,
    pub nodelay: bool,
    /// Bind a listener here (port 0 = ephemeral)
    pub listen: Option<SocketAddr>,
}

/// Events emitted by the I/O thread.
#[derive(Debug)]
pub enum TcpEvent {
    /// Inbound connection accepted
    Accepted { conn_id: u64, remote_addr: SocketAddr },
    /// Outbound connection completed
    Established { conn_id: u64, remote_addr: SocketAddr },
    /// Connection closed or failed (including failed connects)
    Closed {
        conn_id: u64,
        remote_addr: SocketAddr,
        reason: Option<String>,
    },
    /// One decoded frame
    Message { conn_id: u64, payload: Vec<u8> },
    /// Non-fatal error
    Error { conn_id: Option<u64>, error: String },
    /// Loop exited
    Stopped,
}

/// Commands sent to the I/O thread.
#[derive(Debug)]
pub enum IoCommand {
    Connect { addr: SocketAddr, conn_id: u64 },
    Send { conn_id: u64, payload: Vec<u8> },
    /// Send to every connected peer
    Broadcast { payload: Vec<u8> },
    Close { conn_id: u64 },
    Shutdown,
}

// ============================================================================
// Handle
// ============================================================================

/// Owner side of an I/O thread.
pub struct IoThreadHandle {
    cmd_tx: Sender<IoCommand>,
    event_rx: Receiver<TcpEvent>,
    waker: Arc<Waker>,
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    next_conn_id: Arc<AtomicU64>,
    local_addr: Option<SocketAddr>,
}

impl IoThreadHandle {
    fn command(&self, cmd: IoCommand) -> io::Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "I/O thread stopped"))?;
        self.waker.wake()
    }

    /// Start connecting to `addr`; completion arrives as an event.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<u64> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.command(IoCommand::Connect { addr, conn_id })?;
        Ok(conn_id)
    }

    pub fn send(&self, conn_id: u64, payload: Vec<u8>) -> io::Result<()> {
        self.command(IoCommand::Send { conn_id, payload })
    }

    pub fn broadcast(&self, payload: Vec<u8>) -> io::Result<()> {
        self.command(IoCommand::Broadcast { payload })
    }

    pub fn close(&self, conn_id: u64) -> io::Result<()> {
        self.command(IoCommand::Close { conn_id })
    }

    /// Event receiver; clone it to drain from another thread.
    #[must_use]
    pub fn events(&self) -> &Receiver<TcpEvent> {
        &self.event_rx
    }

    /// Listener address, if the thread listens.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the loop and join the thread.
    pub fn shutdown(&mut self) -> io::Result<()> {
        let Some(handle) = self.thread_handle.take() else {
            return Ok(());
        };
        let _ = self.cmd_tx.send(IoCommand::Shutdown);
        let _ = self.waker.wake();
        handle
            .join()
            .map_err(|_| io::Error::other("I/O thread panicked"))
    }
}

impl Drop for IoThreadHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for IoThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoThreadHandle")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// I/O thread
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Connected,
}

struct IoConnection {
    stream: TcpStream,
    conn_id: u64,
    remote_addr: SocketAddr,
    state: LinkState,
    codec: FrameCodec,
    send_queue: Vec<u8>,
    send_offset: usize,
}

/// Event loop state; runs on its own thread.
pub struct IoThread {
    settings: IoSettings,
    poll: Poll,
    listener: Option<TcpListener>,
    connections: HashMap<Token, IoConnection>,
    conn_id_to_token: HashMap<u64, Token>,
    next_token: usize,
    next_conn_id: Arc<AtomicU64>,
    cmd_rx: Receiver<IoCommand>,
    event_tx: Sender<TcpEvent>,
    running: Arc<AtomicBool>,
}

impl IoThread {
    /// Bind (if requested) and spawn the loop.
    pub fn spawn(settings: IoSettings) -> io::Result<IoThreadHandle> {
        let poll = Poll::new()?;
        let listener = match settings.listen {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr)?;
                poll.registry()
                    .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };
        let local_addr = listener.as_ref().and_then(|l| l.local_addr().ok());

        let (cmd_tx, cmd_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let running = Arc::new(AtomicBool::new(true));
        let next_conn_id = Arc::new(AtomicU64::new(1));
        let thread_name = format!("hcal-{}", settings.name);

        let io_thread = Self {
            settings,
            poll,
            listener,
            connections: HashMap::new(),
            conn_id_to_token: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            next_conn_id: Arc::clone(&next_conn_id),
            cmd_rx,
            event_tx,
            running: Arc::clone(&running),
        };

        let thread_handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || io_thread.run())?;

        Ok(IoThreadHandle {
            cmd_tx,
            event_rx,
            waker,
            thread_handle: Some(thread_handle),
            running,
            next_conn_id,
            local_addr,
        })
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    self.emit(TcpEvent::Error {
                        conn_id: None,
                        error: format!("poll error: {}", e),
                    });
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.handle_accept(),
                    WAKER_TOKEN => self.handle_commands(),
                    token => {
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.handle_writable(token);
                        }
                    }
                }
            }
        }

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(token, Some("I/O thread shutdown".to_string()));
        }
        self.running.store(false, Ordering::Relaxed);
        self.emit(TcpEvent::Stopped);
    }

    fn emit(&self, event: TcpEvent) {
        // Owner gone: nothing left to notify.
        let _ = self.event_tx.send(event);
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn new_connection(
        &self,
        stream: TcpStream,
        conn_id: u64,
        remote_addr: SocketAddr,
        state: LinkState,
    ) -> IoConnection {
        IoConnection {
            stream,
            conn_id,
            remote_addr,
            state,
            codec: FrameCodec::new(self.settings.layout, self.settings.max_message_size),
            send_queue: Vec::new(),
            send_offset: 0,
        }
    }

    fn handle_accept(&mut self) {
        loop {
            let Some(listener) = &self.listener else {
                return;
            };
            match listener.accept() {
                Ok((mut stream, remote_addr)) => {
                    let token = self.allocate_token();
                    let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        self.emit(TcpEvent::Error {
                            conn_id: Some(conn_id),
                            error: format!("failed to register connection: {}", e),
                        });
                        continue;
                    }
                    let _ = stream.set_nodelay(self.settings.nodelay);
                    let conn =
                        self.new_connection(stream, conn_id, remote_addr, LinkState::Connected);
                    self.connections.insert(token, conn);
                    self.conn_id_to_token.insert(conn_id, token);
                    log::debug!(
                        "[TCP] {} accepted {} as #{}",
                        self.settings.name,
                        remote_addr,
                        conn_id
                    );
                    self.emit(TcpEvent::Accepted {
                        conn_id,
                        remote_addr,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.emit(TcpEvent::Error {
                        conn_id: None,
                        error: format!("accept error: {}", e),
                    });
                    break;
                }
            }
        }
    }

    fn handle_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(IoCommand::Connect { addr, conn_id }) => self.handle_connect(addr, conn_id),
                Ok(IoCommand::Send { conn_id, payload }) => self.handle_send(conn_id, &payload),
                Ok(IoCommand::Broadcast { payload }) => self.handle_broadcast(&payload),
                Ok(IoCommand::Close { conn_id }) => {
                    if let Some(token) = self.conn_id_to_token.get(&conn_id).copied() {
                        self.close_connection(token, Some("closed by request".to_string()));
                    }
                }
                Ok(IoCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
    }

    fn handle_connect(&mut self, addr: SocketAddr, conn_id: u64) {
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                let token = self.allocate_token();
                if let Err(e) = self.poll.registry().register(
                    &mut stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    self.emit(TcpEvent::Closed {
                        conn_id,
                        remote_addr: addr,
                        reason: Some(format!("failed to register connection: {}", e)),
                    });
                    return;
                }
                let _ = stream.set_nodelay(self.settings.nodelay);
                let conn = self.new_connection(stream, conn_id, addr, LinkState::Connecting);
                self.connections.insert(token, conn);
                self.conn_id_to_token.insert(conn_id, token);
            }
            Err(e) => {
                self.emit(TcpEvent::Closed {
                    conn_id,
                    remote_addr: addr,
                    reason: Some(format!("connect failed: {}", e)),
                });
            }
        }
    }

    fn frame(&self, payload: &[u8], queue: &mut Vec<u8>) {
        match self.settings.layout {
            FrameLayout::LengthPrefix => {
                queue.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                queue.extend_from_slice(payload);
            }
            FrameLayout::Envelope => queue.extend_from_slice(payload),
        }
    }

    fn handle_send(&mut self, conn_id: u64, payload: &[u8]) {
        let Some(token) = self.conn_id_to_token.get(&conn_id).copied() else {
            self.emit(TcpEvent::Error {
                conn_id: Some(conn_id),
                error: "connection not found".to_string(),
            });
            return;
        };
        let mut queue = match self.connections.get_mut(&token) {
            Some(conn) => std::mem::take(&mut conn.send_queue),
            None => return,
        };
        self.frame(payload, &mut queue);
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.send_queue = queue;
            if conn.state == LinkState::Connecting {
                // Flushed once the connect completes
                return;
            }
        }
        self.try_flush(token);
    }

    fn handle_broadcast(&mut self, payload: &[u8]) {
        let mut framed = Vec::with_capacity(payload.len() + 4);
        self.frame(payload, &mut framed);
        let tokens: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state == LinkState::Connected)
            .map(|(t, _)| *t)
            .collect();
        for token in tokens {
            if let Some(conn) = self.connections.get_mut(&token) {
                conn.send_queue.extend_from_slice(&framed);
            }
            self.try_flush(token);
        }
    }

    fn handle_readable(&mut self, token: Token) {
        loop {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            match conn.codec.decode(&mut conn.stream) {
                Ok(Some(payload)) => {
                    let conn_id = conn.conn_id;
                    self.emit(TcpEvent::Message { conn_id, payload });
                }
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.close_connection(token, Some("connection closed by peer".to_string()));
                    return;
                }
                Err(e) => {
                    self.close_connection(token, Some(format!("read error: {}", e)));
                    return;
                }
            }
        }
    }

    fn handle_writable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        if conn.state == LinkState::Connecting {
            match conn.stream.take_error() {
                Ok(Some(e)) => {
                    self.close_connection(token, Some(format!("connect failed: {}", e)));
                    return;
                }
                Err(e) => {
                    self.close_connection(token, Some(format!("connect error: {}", e)));
                    return;
                }
                Ok(None) => {}
            }
            // Writable without error can still mean "not yet"; peer_addr settles it
            if conn.stream.peer_addr().is_err() {
                return;
            }
            conn.state = LinkState::Connected;
            let (conn_id, remote_addr) = (conn.conn_id, conn.remote_addr);
            log::debug!(
                "[TCP] {} connected to {} as #{}",
                self.settings.name,
                remote_addr,
                conn_id
            );
            self.emit(TcpEvent::Established {
                conn_id,
                remote_addr,
            });
        }

        self.try_flush(token);
    }

    fn try_flush(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if conn.send_queue.is_empty() {
            return;
        }

        while conn.send_offset < conn.send_queue.len() {
            match conn.stream.write(&conn.send_queue[conn.send_offset..]) {
                Ok(0) => {
                    self.close_connection(token, Some("write returned 0".to_string()));
                    return;
                }
                Ok(n) => conn.send_offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close_connection(token, Some(format!("write error: {}", e)));
                    return;
                }
            }
        }

        conn.send_queue.clear();
        conn.send_offset = 0;
    }

    fn close_connection(&mut self, token: Token, reason: Option<String>) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.conn_id_to_token.remove(&conn.conn_id);
            log::debug!(
                "[TCP] {} closed #{} ({}): {}",
                self.settings.name,
                conn.conn_id,
                conn.remote_addr,
                reason.as_deref().unwrap_or("-")
            );
            self.emit(TcpEvent::Closed {
                conn_id: conn.conn_id,
                remote_addr: conn.remote_addr,
                reason,
            });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
