// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service client.
//!
//! Keeps one session per discovered server of its service:
//!
//! ```text
//!  Connecting --handshake ok--> Connected --link lost--> Disconnected
//!      |                                                    |
//!      +--connect timeout--> TimedOut ----back-off----------+--> Connecting
//! ```
//!
//! Reconnects stop after `max_reconnections` consecutive failures; the
//! session stays in the table and is revived by the server's next
//! registration change.
//!
//! Every call is a row in the pending table. Whoever removes the row (the
//! response, the deadline, a lost link) resolves the call, so a response
//! arriving after its timeout is dropped and a callback runs exactly once.

use super::error::{ServiceError, ServiceResult};
use super::protocol::{self, Message, RemoteExceptionCode, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN};
use crate::context::ContextInner;
use crate::directory::{DirectoryEvent, DirectoryListener, ObserverId};
use crate::entity::{EntityId, ServiceRole};
use crate::error::{Error, Result};
use crate::pubsub::Routed;
use crate::registration::{RegistrationSample, SampleBody, ServiceInfo};
use crate::transport::tcp::{
    drain_events, resolve_peer, FrameLayout, IoSettings, IoThread, IoThreadHandle, TcpEvent,
};
use crate::worker::WorkerThread;
use crossbeam::channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DRIVER_TICK: Duration = Duration::from_millis(10);

// ============================================================================
// Public types
// ============================================================================

/// State of the session to one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    TimedOut,
}

/// Session transitions, delivered to the event callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { server: EntityId, version: u8 },
    Disconnected { server: EntityId, reason: String },
    TimedOut { server: EntityId },
}

/// Outcome of one call on one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Handler ran and returned a response
    Executed,
    /// Call-level failure (`ret_state` non-zero, or the session dropped)
    Failed,
    /// No response before the deadline
    TimedOut,
}

/// Response of one server to one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub server: EntityId,
    pub service_name: String,
    pub method: String,
    pub state: CallState,
    /// 0 on success, a [`RemoteExceptionCode`] otherwise
    pub ret_state: i32,
    pub error: Option<String>,
    pub payload: Vec<u8>,
}

impl ServiceResponse {
    fn failed(target: &Target, service: &str, method: &str, code: RemoteExceptionCode, error: String) -> Self {
        Self {
            server: target.server.clone(),
            service_name: service.to_string(),
            method: method.to_string(),
            state: CallState::Failed,
            ret_state: code.as_i32(),
            error: Some(error),
            payload: Vec::new(),
        }
    }

    fn timed_out(target: &Target, service: &str, method: &str) -> Self {
        Self {
            state: CallState::TimedOut,
            ..Self::failed(
                target,
                service,
                method,
                RemoteExceptionCode::Timeout,
                "no response before the deadline".to_string(),
            )
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.state == CallState::Executed
    }

    /// Response payload, or the call-level failure as an error.
    pub fn into_result(self) -> ServiceResult<Vec<u8>> {
        match self.state {
            CallState::Executed => Ok(self.payload),
            CallState::TimedOut => Err(ServiceError::Timeout),
            CallState::Failed => Err(ServiceError::from_ret_state(
                self.ret_state,
                self.error.unwrap_or_default(),
            )),
        }
    }
}

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub server: EntityId,
    pub state: SessionState,
    pub version: Option<u8>,
    /// Consecutive failed connection attempts
    pub attempts: u32,
}

/// Observer of session transitions.
pub type SessionEventCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Receiver of asynchronous call results.
pub type ResponseCallback = Arc<dyn Fn(&ServiceResponse) + Send + Sync>;

// ============================================================================
// Internals
// ============================================================================

struct Session {
    server: EntityId,
    port: u16,
    state: SessionState,
    conn_id: Option<u64>,
    version: Option<u8>,
    attempts: u32,
    connect_deadline: Option<Instant>,
    retry_at: Option<Instant>,
}

/// Connection attempt decided under the sessions lock.
struct Dial {
    server_id: u64,
    host: String,
    port: u16,
}

/// Connected session a call is sent on.
#[derive(Clone)]
struct Target {
    server: EntityId,
    conn_id: u64,
    version: u8,
}

enum Completion {
    Blocking(Sender<ServiceResponse>),
    Callback(ResponseCallback),
}

struct Pending {
    target: Target,
    method: String,
    /// Set for callback calls; blocking callers watch their own deadline
    deadline: Option<Instant>,
    completion: Completion,
}

struct ClientShared {
    ctx: Arc<ContextInner>,
    id: EntityId,
    name: String,
    io: IoThreadHandle,
    versions: (u8, u8),
    sessions: Mutex<HashMap<u64, Session>>,
    pending: DashMap<u64, Pending>,
    next_call: AtomicU64,
    events: Mutex<Option<SessionEventCallback>>,
}

impl ClientShared {
    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    fn complete(&self, pending: Pending, response: ServiceResponse) {
        match pending.completion {
            Completion::Blocking(tx) => {
                let _ = tx.send(response);
            }
            Completion::Callback(callback) => {
                if !self.ctx.callbacks.submit(move || callback(&response)) {
                    log::debug!("[RPC] {}: callback dropped, executor stopped", self.name);
                }
            }
        }
    }

    /// Resolve every call in flight on `server_id` as failed.
    fn fail_calls_on(&self, server_id: Option<u64>, reason: &str) {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|p| server_id.map_or(true, |s| p.target.server.id() == s))
            .map(|p| *p.key())
            .collect();
        for call_id in ids {
            if let Some((_, pending)) = self.pending.remove(&call_id) {
                let response = ServiceResponse::failed(
                    &pending.target,
                    &self.name,
                    &pending.method,
                    RemoteExceptionCode::ServiceUnavailable,
                    reason.to_string(),
                );
                self.complete(pending, response);
            }
        }
    }

    fn emit(&self, events: Vec<SessionEvent>) {
        if events.is_empty() {
            return;
        }
        let Some(callback) = self.events.lock().clone() else {
            return;
        };
        self.ctx.callbacks.submit(move || {
            for event in &events {
                callback(event);
            }
        });
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Move `session` to `Connecting` and describe the attempt to make.
    ///
    /// The attempt itself is made by [`Self::dial`] once the sessions lock
    /// is released, since name resolution can block.
    fn begin_dial(&self, session: &mut Session) -> Dial {
        session.state = SessionState::Connecting;
        session.conn_id = None;
        session.version = None;
        session.retry_at = None;
        session.connect_deadline = Some(Instant::now() + self.ctx.config.service.connect_timeout);
        Dial {
            server_id: session.server.id(),
            host: session.server.host_name().to_string(),
            port: session.port,
        }
    }

    /// Resolve and connect each attempt, then attach the connection to its
    /// session if that session still waits for it.
    fn dial(&self, dials: Vec<Dial>, events: &mut Vec<SessionEvent>) {
        let local_host = self.ctx.registry.host_name();
        for dial in dials {
            let started = resolve_peer(&dial.host, dial.port, local_host)
                .and_then(|addr| self.io.connect(addr));
            let mut sessions = self.sessions.lock();
            let waiting = sessions.get_mut(&dial.server_id).filter(|s| {
                s.port == dial.port && s.state == SessionState::Connecting && s.conn_id.is_none()
            });
            match (started, waiting) {
                (Ok(conn_id), Some(session)) => {
                    session.conn_id = Some(conn_id);
                    log::debug!(
                        "[RPC] {}: connecting to {} port {}",
                        self.name,
                        session.server,
                        session.port
                    );
                }
                (Ok(conn_id), None) => {
                    // Session left or moved while resolving.
                    let _ = self.io.close(conn_id);
                }
                (Err(e), Some(session)) => {
                    log::debug!("[RPC] {}: cannot reach {}: {}", self.name, session.server, e);
                    session.state = SessionState::Disconnected;
                    self.retry_later(session, &e.to_string(), events);
                }
                (Err(_), None) => {}
            }
        }
    }

    /// Schedule the next attempt, or give up after the configured maximum.
    fn retry_later(&self, session: &mut Session, reason: &str, events: &mut Vec<SessionEvent>) {
        session.conn_id = None;
        session.version = None;
        session.connect_deadline = None;
        let tcp = &self.ctx.config.transport.tcp;
        if session.attempts < tcp.max_reconnections {
            session.attempts += 1;
            session.retry_at = Some(Instant::now() + tcp.reconnect_backoff);
            return;
        }
        session.retry_at = None;
        log::warn!(
            "[RPC] {}: giving up on {} after {} attempts: {}",
            self.name,
            session.server,
            session.attempts,
            reason
        );
        events.push(SessionEvent::Disconnected {
            server: session.server.clone(),
            reason: format!("reconnect attempts exhausted: {reason}"),
        });
    }

    fn on_server(&self, sample: &RegistrationSample, info: &ServiceInfo) {
        let mut events = Vec::new();
        let dial = {
            let mut sessions = self.sessions.lock();
            let session = sessions.entry(sample.entity.id()).or_insert_with(|| Session {
                server: sample.entity.clone(),
                port: 0,
                state: SessionState::Disconnected,
                conn_id: None,
                version: None,
                attempts: 0,
                connect_deadline: None,
                retry_at: None,
            });
            let fresh = session.port != info.tcp_port;
            // A dial in flight has no connection yet but is not idle.
            let idle = session.conn_id.is_none()
                && session.retry_at.is_none()
                && session.state != SessionState::Connecting;
            if !fresh && !idle {
                return;
            }
            if let Some(conn_id) = session.conn_id.take() {
                let _ = self.io.close(conn_id);
            }
            session.port = info.tcp_port;
            session.attempts = 0;
            if negotiate_range(self.versions, info).is_none() {
                session.state = SessionState::Disconnected;
                session.retry_at = None;
                log::warn!(
                    "[RPC] {}: server {} speaks v{}..=v{}, not connecting",
                    self.name,
                    sample.entity,
                    info.protocol_min,
                    info.protocol_max
                );
                return;
            }
            self.begin_dial(session)
        };
        self.dial(vec![dial], &mut events);
        self.emit(events);
    }

    fn on_server_gone(&self, server: &EntityId) {
        let removed = self.sessions.lock().remove(&server.id());
        let Some(session) = removed else {
            return;
        };
        if let Some(conn_id) = session.conn_id {
            let _ = self.io.close(conn_id);
        }
        self.fail_calls_on(Some(server.id()), "server left");
        if session.state == SessionState::Connected {
            self.emit(vec![SessionEvent::Disconnected {
                server: session.server,
                reason: "server left".to_string(),
            }]);
        }
    }

    fn on_event(&self, event: TcpEvent) {
        match event {
            TcpEvent::Established { conn_id, .. } => {
                let hello = Message::HandshakeRequest {
                    min_version: self.versions.0,
                    max_version: self.versions.1,
                };
                if let Ok(frame) = protocol::encode(&hello, self.versions.1) {
                    let _ = self.io.send(conn_id, frame);
                }
            }
            TcpEvent::Message { conn_id, payload } => match protocol::decode(&payload) {
                Ok((_, Message::HandshakeResponse { accepted_version })) => {
                    self.on_handshake(conn_id, accepted_version);
                }
                Ok((_, Message::Response {
                    call_id,
                    ret_state,
                    error,
                    payload,
                })) => {
                    if let Some((_, pending)) = self.pending.remove(&call_id) {
                        let response = ServiceResponse {
                            server: pending.target.server.clone(),
                            service_name: self.name.clone(),
                            method: pending.method.clone(),
                            state: if ret_state == 0 {
                                CallState::Executed
                            } else {
                                CallState::Failed
                            },
                            ret_state,
                            error: (!error.is_empty()).then_some(error),
                            payload,
                        };
                        self.complete(pending, response);
                    } else {
                        log::debug!("[RPC] {}: late response {} dropped", self.name, call_id);
                    }
                }
                Ok((_, other)) => {
                    log::warn!("[RPC] {}: unexpected {:?}, closing", self.name, other);
                    let _ = self.io.close(conn_id);
                }
                Err(e) => {
                    log::warn!("[RPC] {}: bad envelope: {}, closing", self.name, e);
                    let _ = self.io.close(conn_id);
                }
            },
            TcpEvent::Closed {
                conn_id, reason, ..
            } => self.on_closed(conn_id, reason.as_deref().unwrap_or("closed by peer")),
            TcpEvent::Error { error, .. } => log::debug!("[RPC] {}: {}", self.name, error),
            TcpEvent::Accepted { .. } | TcpEvent::Stopped => {}
        }
    }

    fn on_handshake(&self, conn_id: u64, accepted: u8) {
        let mut events = Vec::new();
        {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.values_mut().find(|s| s.conn_id == Some(conn_id)) else {
                return;
            };
            if accepted >= self.versions.0 && accepted <= self.versions.1 && accepted > 0 {
                session.state = SessionState::Connected;
                session.version = Some(accepted);
                session.attempts = 0;
                session.connect_deadline = None;
                log::info!("[RPC] {}: connected to {} (v{})", self.name, session.server, accepted);
                events.push(SessionEvent::Connected {
                    server: session.server.clone(),
                    version: accepted,
                });
            } else {
                // Protocol refusal is final for this registration.
                let _ = self.io.close(conn_id);
                session.state = SessionState::Disconnected;
                session.conn_id = None;
                session.connect_deadline = None;
                session.retry_at = None;
                events.push(SessionEvent::Disconnected {
                    server: session.server.clone(),
                    reason: ServiceError::ProtocolVersion {
                        min: self.versions.0,
                        max: self.versions.1,
                    }
                    .to_string(),
                });
            }
        }
        self.emit(events);
    }

    fn on_closed(&self, conn_id: u64, reason: &str) {
        let mut events = Vec::new();
        let server_id = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.values_mut().find(|s| s.conn_id == Some(conn_id)) else {
                return;
            };
            if session.state == SessionState::Connected {
                events.push(SessionEvent::Disconnected {
                    server: session.server.clone(),
                    reason: reason.to_string(),
                });
            }
            session.state = SessionState::Disconnected;
            self.retry_later(session, reason, &mut events);
            session.server.id()
        };
        log::debug!("[RPC] {}: session to {} lost: {}", self.name, server_id, reason);
        self.fail_calls_on(Some(server_id), reason);
        self.emit(events);
    }

    /// One driver tick: call deadlines, connect timeouts, reconnects.
    fn drive(&self, now: Instant) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|p| p.deadline.is_some_and(|d| d <= now))
            .map(|p| *p.key())
            .collect();
        for call_id in expired {
            if let Some((_, pending)) = self.pending.remove(&call_id) {
                let response = ServiceResponse::timed_out(&pending.target, &self.name, &pending.method);
                self.complete(pending, response);
            }
        }

        let mut events = Vec::new();
        let mut dials = Vec::new();
        {
            let mut sessions = self.sessions.lock();
            for session in sessions.values_mut() {
                match session.state {
                    SessionState::Connecting if session.connect_deadline.is_some_and(|d| d <= now) => {
                        if let Some(conn_id) = session.conn_id {
                            let _ = self.io.close(conn_id);
                        }
                        log::debug!("[RPC] {}: connect to {} timed out", self.name, session.server);
                        session.state = SessionState::TimedOut;
                        events.push(SessionEvent::TimedOut {
                            server: session.server.clone(),
                        });
                        self.retry_later(session, "connect timed out", &mut events);
                    }
                    SessionState::Disconnected | SessionState::TimedOut
                        if session.retry_at.is_some_and(|t| t <= now) =>
                    {
                        dials.push(self.begin_dial(session));
                    }
                    _ => {}
                }
            }
        }
        self.dial(dials, &mut events);
        self.emit(events);
    }

    // ------------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------------

    fn targets(&self) -> Vec<Target> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.state == SessionState::Connected)
            .filter_map(|s| {
                Some(Target {
                    server: s.server.clone(),
                    conn_id: s.conn_id?,
                    version: s.version?,
                })
            })
            .collect()
    }

    fn send_request(
        &self,
        target: &Target,
        method: &str,
        request: &[u8],
        deadline: Option<Instant>,
        completion: Completion,
    ) -> u64 {
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(
            call_id,
            Pending {
                target: target.clone(),
                method: method.to_string(),
                deadline,
                completion,
            },
        );
        let message = Message::Request {
            call_id,
            method: method.to_string(),
            payload: request.to_vec(),
        };
        let sent = protocol::encode(&message, target.version)
            .map_err(|e| e.to_string())
            .and_then(|frame| self.io.send(target.conn_id, frame).map_err(|e| e.to_string()));
        if let Err(reason) = sent {
            if let Some((_, pending)) = self.pending.remove(&call_id) {
                let response = ServiceResponse::failed(
                    target,
                    &self.name,
                    method,
                    RemoteExceptionCode::ServiceUnavailable,
                    reason,
                );
                self.complete(pending, response);
            }
        }
        call_id
    }

    /// Block for the result of `call_id` until `deadline`.
    fn wait(
        &self,
        call_id: u64,
        target: &Target,
        method: &str,
        rx: &Receiver<ServiceResponse>,
        deadline: Option<Instant>,
    ) -> ServiceResponse {
        let received = match deadline {
            Some(deadline) => rx.recv_deadline(deadline).ok(),
            None => rx.recv().ok(),
        };
        if let Some(response) = received {
            return response;
        }
        if self.pending.remove(&call_id).is_some() {
            return ServiceResponse::timed_out(target, &self.name, method);
        }
        // Resolved concurrently; the response is on its way.
        rx.recv().unwrap_or_else(|_| {
            ServiceResponse::failed(
                target,
                &self.name,
                method,
                RemoteExceptionCode::ServiceUnavailable,
                "client shut down".to_string(),
            )
        })
    }
}

fn negotiate_range(ours: (u8, u8), info: &ServiceInfo) -> Option<u8> {
    protocol::negotiate(ours, (info.protocol_min, info.protocol_max))
}

impl DirectoryListener for ClientShared {
    fn on_directory_event(&self, event: &DirectoryEvent) {
        let sample = event.sample();
        let Some(info) = sample.service() else {
            return;
        };
        if info.role != ServiceRole::Server || info.service_name != self.name {
            return;
        }
        match event {
            DirectoryEvent::Added(_)
            | DirectoryEvent::Updated {
                inputs_changed: true,
                ..
            } => self.on_server(sample, info),
            DirectoryEvent::Removed { .. } => self.on_server_gone(&sample.entity),
            DirectoryEvent::Updated { .. } => {}
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client side of a named service.
///
/// ```rust,no_run
/// use hcal::{Config, Context};
/// use std::time::Duration;
///
/// let ctx = Context::builder().config(Config::in_process()).start()?;
/// let client = ctx.create_service_client("mirror")?;
/// client.wait_for_connection(Duration::from_secs(2));
/// for response in client.call("echo", b"ping", Some(Duration::from_secs(1)))? {
///     println!("{}: {:?}", response.server, response.payload);
/// }
/// # Ok::<(), hcal::Error>(())
/// ```
pub struct ServiceClient {
    shared: Arc<ClientShared>,
    listener: ObserverId,
    events: WorkerThread,
    driver: WorkerThread,
}

impl ServiceClient {
    pub(crate) fn create(ctx: &Arc<ContextInner>, name: &str) -> Result<Self> {
        Self::create_with_versions(ctx, name, (PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_MAX))
    }

    pub(crate) fn create_with_versions(
        ctx: &Arc<ContextInner>,
        name: &str,
        versions: (u8, u8),
    ) -> Result<Self> {
        crate::trace_fn!("ServiceClient::create");
        if name.is_empty() {
            return Err(Error::InvalidName("empty service name".into()));
        }
        ctx.ensure_open()?;
        let tcp = &ctx.config.transport.tcp;
        let io = IoThread::spawn(IoSettings {
            name: "svc-client".to_string(),
            layout: FrameLayout::Envelope,
            max_message_size: tcp.max_message_size,
            nodelay: tcp.nodelay,
            listen: None,
        })?;
        let tcp_events = io.events().clone();

        let id = ctx.registry.register(SampleBody::Service(ServiceInfo {
            role: ServiceRole::Client,
            service_name: name.to_string(),
            methods: Vec::new(),
            tcp_port: 0,
            protocol_min: versions.0,
            protocol_max: versions.1,
        }));
        let shared = Arc::new(ClientShared {
            ctx: Arc::clone(ctx),
            id: id.clone(),
            name: name.to_string(),
            io,
            versions,
            sessions: Mutex::new(HashMap::new()),
            pending: DashMap::new(),
            next_call: AtomicU64::new(1),
            events: Mutex::new(None),
        });

        let handler = Arc::clone(&shared);
        let events = drain_events("svc-client-events", tcp_events, move |event| {
            handler.on_event(event);
        })?;
        let driven = Arc::clone(&shared);
        let driver = WorkerThread::spawn("svc-client", move |shutdown| {
            while !shutdown.load(Ordering::Relaxed) {
                driven.drive(Instant::now());
                std::thread::sleep(DRIVER_TICK);
            }
        })?;

        let listener = ctx
            .directory
            .add_listener(Arc::new(Routed(Arc::downgrade(&shared))));
        if let Some(sample) = ctx.registry.get(&id) {
            ctx.provider.announce(&[sample]);
        }
        for sample in ctx.directory.services_named(name) {
            if let Some(info) = sample.service().filter(|i| i.role == ServiceRole::Server) {
                shared.on_server(&sample, info);
            }
        }
        log::debug!("[RPC] client {} ({})", name, id);
        Ok(Self {
            shared,
            listener,
            events,
            driver,
        })
    }

    /// Call `method` on every connected server and wait for all of them.
    ///
    /// `None` waits without limit. Fails with `RemoteUnavailable` when no
    /// session is connected and with `Timeout` when no server answered in
    /// time; otherwise each server's outcome is in its response.
    pub fn call(
        &self,
        method: &str,
        request: &[u8],
        timeout: Option<Duration>,
    ) -> ServiceResult<Vec<ServiceResponse>> {
        crate::trace_fn!("ServiceClient::call");
        let targets = self.shared.targets();
        if targets.is_empty() {
            return Err(ServiceError::RemoteUnavailable(self.shared.name.clone()));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let calls: Vec<(u64, Target, Receiver<ServiceResponse>)> = targets
            .into_iter()
            .map(|target| {
                let (tx, rx) = bounded(1);
                let call_id =
                    self.shared
                        .send_request(&target, method, request, None, Completion::Blocking(tx));
                (call_id, target, rx)
            })
            .collect();
        let responses: Vec<ServiceResponse> = calls
            .iter()
            .map(|(call_id, target, rx)| self.shared.wait(*call_id, target, method, rx, deadline))
            .collect();
        if responses.iter().all(|r| r.state == CallState::TimedOut) {
            return Err(ServiceError::Timeout);
        }
        Ok(responses)
    }

    /// Call `method` on one server.
    pub fn call_to(
        &self,
        server: &EntityId,
        method: &str,
        request: &[u8],
        timeout: Option<Duration>,
    ) -> ServiceResult<ServiceResponse> {
        let target = self
            .shared
            .targets()
            .into_iter()
            .find(|t| t.server == *server)
            .ok_or_else(|| ServiceError::RemoteUnavailable(format!("{} on {}", self.shared.name, server)))?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let (tx, rx) = bounded(1);
        let call_id =
            self.shared
                .send_request(&target, method, request, None, Completion::Blocking(tx));
        let response = self.shared.wait(call_id, &target, method, &rx, deadline);
        match response.state {
            CallState::TimedOut => Err(ServiceError::Timeout),
            _ => Ok(response),
        }
    }

    /// Call `method` on every connected server without blocking.
    ///
    /// `on_response` runs once per targeted server on the callback pool,
    /// with a `TimedOut` response if the server does not answer in time.
    /// Returns the number of servers called.
    pub fn call_with_callback<F>(
        &self,
        method: &str,
        request: &[u8],
        timeout: Option<Duration>,
        on_response: F,
    ) -> ServiceResult<usize>
    where
        F: Fn(&ServiceResponse) + Send + Sync + 'static,
    {
        let targets = self.shared.targets();
        if targets.is_empty() {
            return Err(ServiceError::RemoteUnavailable(self.shared.name.clone()));
        }
        let callback: ResponseCallback = Arc::new(on_response);
        let deadline = timeout.map(|t| Instant::now() + t);
        for target in &targets {
            self.shared.send_request(
                target,
                method,
                request,
                deadline,
                Completion::Callback(Arc::clone(&callback)),
            );
        }
        Ok(targets.len())
    }

    /// Observe session transitions.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        *self.shared.events.lock() = Some(Arc::new(callback));
    }

    pub fn remove_event_callback(&self) {
        *self.shared.events.lock() = None;
    }

    /// Every known session.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared
            .sessions
            .lock()
            .values()
            .map(|s| SessionInfo {
                server: s.server.clone(),
                state: s.state,
                version: s.version,
                attempts: s.attempts,
            })
            .collect()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.shared.targets().is_empty()
    }

    /// Wait until at least one session is connected.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_connected() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(DRIVER_TICK);
        }
    }

    /// Calls waiting for a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    #[must_use]
    pub fn id(&self) -> &EntityId {
        &self.shared.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        let ctx = &self.shared.ctx;
        ctx.directory.remove_listener(self.listener);
        self.driver.stop();
        self.events.stop();
        self.shared.fail_calls_on(None, "client shut down");
        ctx.leave(&self.shared.id);
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("sessions", &self.sessions().len())
            .field("pending", &self.pending_calls())
            .finish()
    }
}
