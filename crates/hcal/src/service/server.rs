// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service server.
//!
//! Listens on its own TCP port (announced in the service registration),
//! answers handshakes and dispatches requests to method handlers on the
//! context's handler pool.

use super::protocol::{
    self, negotiate, Message, RemoteExceptionCode, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN,
};
use crate::context::ContextInner;
use crate::entity::{DataTypeInformation, EntityId, ServiceRole};
use crate::error::{Error, Result};
use crate::registration::{MethodInfo, SampleBody, ServiceInfo};
use crate::transport::tcp::{drain_events, FrameLayout, IoSettings, IoThread, IoThreadHandle, TcpEvent};
use crate::worker::WorkerThread;
use dashmap::DashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handler outcome: the response payload, or a code and message for the client.
pub type HandlerResult = std::result::Result<Vec<u8>, (RemoteExceptionCode, String)>;

/// Handler trait for processing service requests.
///
/// Runs on the context's handler pool; a handler may block without
/// stalling other sessions.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle a request and return the response payload.
    fn handle(&self, method: &str, request: &[u8]) -> HandlerResult;
}

/// A function-based request handler.
impl<F> RequestHandler for F
where
    F: Fn(&str, &[u8]) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, method: &str, request: &[u8]) -> HandlerResult {
        self(method, request)
    }
}

struct Method {
    info: MethodInfo,
    handler: Arc<dyn RequestHandler>,
}

struct ServerShared {
    ctx: Arc<ContextInner>,
    id: EntityId,
    name: String,
    io: IoThreadHandle,
    methods: DashMap<String, Method>,
    /// conn id -> accepted version (None until the handshake)
    sessions: DashMap<u64, Option<u8>>,
    versions: (u8, u8),
    calls_served: AtomicU64,
}

impl ServerShared {
    fn on_event(self: &Arc<Self>, event: TcpEvent) {
        match event {
            TcpEvent::Accepted {
                conn_id,
                remote_addr,
            } => {
                log::debug!("[RPC] {} accepted client {}", self.name, remote_addr);
                self.sessions.insert(conn_id, None);
            }
            TcpEvent::Closed { conn_id, .. } => {
                self.sessions.remove(&conn_id);
            }
            TcpEvent::Message { conn_id, payload } => self.on_frame(conn_id, &payload),
            TcpEvent::Error { error, .. } => log::debug!("[RPC] {}: {}", self.name, error),
            TcpEvent::Established { .. } | TcpEvent::Stopped => {}
        }
    }

    fn on_frame(self: &Arc<Self>, conn_id: u64, frame: &[u8]) {
        let message = match protocol::decode(frame) {
            Ok((_, message)) => message,
            Err(e) => {
                log::warn!("[RPC] {}: closing session {}: {}", self.name, conn_id, e);
                let _ = self.io.close(conn_id);
                return;
            }
        };
        let version = self.sessions.get(&conn_id).and_then(|v| *v);
        match (message, version) {
            (
                Message::HandshakeRequest {
                    min_version,
                    max_version,
                },
                None,
            ) => self.handshake(conn_id, min_version, max_version),
            (
                Message::Request {
                    call_id,
                    method,
                    payload,
                },
                Some(version),
            ) => self.dispatch(conn_id, version, call_id, method, payload),
            (message, _) => {
                log::warn!(
                    "[RPC] {}: unexpected {:?} on session {}, closing",
                    self.name,
                    message,
                    conn_id
                );
                let _ = self.io.close(conn_id);
            }
        }
    }

    fn handshake(&self, conn_id: u64, min_version: u8, max_version: u8) {
        let accepted = negotiate(self.versions, (min_version, max_version));
        let reply = Message::HandshakeResponse {
            accepted_version: accepted.unwrap_or(0),
        };
        if let Ok(frame) = protocol::encode(&reply, accepted.unwrap_or(PROTOCOL_VERSION_MIN)) {
            let _ = self.io.send(conn_id, frame);
        }
        match accepted {
            Some(version) => {
                self.sessions.insert(conn_id, Some(version));
                log::debug!("[RPC] {}: session {} on v{}", self.name, conn_id, version);
            }
            None => {
                log::warn!(
                    "[RPC] {}: refusing session {} offering v{}..=v{}",
                    self.name,
                    conn_id,
                    min_version,
                    max_version
                );
                let _ = self.io.close(conn_id);
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        conn_id: u64,
        version: u8,
        call_id: u64,
        method: String,
        payload: Vec<u8>,
    ) {
        let handler = self
            .methods
            .get(&method)
            .map(|m| Arc::clone(&m.handler));
        let Some(handler) = handler else {
            // Call-level failure; the session stays up.
            log::debug!("[RPC] {}: unknown method {}", self.name, method);
            self.respond(
                conn_id,
                version,
                call_id,
                Err((
                    RemoteExceptionCode::UnsupportedMethod,
                    format!("method {method} not offered by {}", self.name),
                )),
            );
            return;
        };
        let shared = Arc::clone(self);
        let queued = self.ctx.handlers.submit(move || {
            let result = handler.handle(&method, &payload);
            shared.calls_served.fetch_add(1, Ordering::Relaxed);
            shared.respond(conn_id, version, call_id, result);
        });
        if !queued {
            self.respond(
                conn_id,
                version,
                call_id,
                Err((
                    RemoteExceptionCode::ServiceUnavailable,
                    "server shutting down".to_string(),
                )),
            );
        }
    }

    fn respond(
        &self,
        conn_id: u64,
        version: u8,
        call_id: u64,
        result: std::result::Result<Vec<u8>, (RemoteExceptionCode, String)>,
    ) {
        let response = match result {
            Ok(payload) => Message::Response {
                call_id,
                ret_state: RemoteExceptionCode::Ok.as_i32(),
                error: String::new(),
                payload,
            },
            Err((code, error)) => Message::Response {
                call_id,
                ret_state: match code {
                    // A handler reporting Ok as an error still failed.
                    RemoteExceptionCode::Ok => RemoteExceptionCode::Unknown.as_i32(),
                    code => code.as_i32(),
                },
                error,
                payload: Vec::new(),
            },
        };
        match protocol::encode(&response, version) {
            Ok(frame) => {
                if let Err(e) = self.io.send(conn_id, frame) {
                    log::debug!("[RPC] {}: response {} not sent: {}", self.name, call_id, e);
                }
            }
            Err(e) => log::warn!("[RPC] {}: encoding response {} failed: {}", self.name, call_id, e),
        }
    }

    fn registration(&self) -> ServiceInfo {
        let mut methods: Vec<MethodInfo> = self.methods.iter().map(|m| m.info.clone()).collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        ServiceInfo {
            role: ServiceRole::Server,
            service_name: self.name.clone(),
            methods,
            tcp_port: self.io.local_addr().map_or(0, |a| a.port()),
            protocol_min: self.versions.0,
            protocol_max: self.versions.1,
        }
    }

    fn announce(&self) {
        let info = self.registration();
        if let Some(sample) = self
            .ctx
            .registry
            .update(&self.id, |body| *body = SampleBody::Service(info))
        {
            self.ctx.provider.announce(&[sample]);
        }
    }
}

/// Server side of a named service.
///
/// ```rust,no_run
/// use hcal::{Config, Context};
///
/// let ctx = Context::builder().config(Config::in_process()).start()?;
/// let server = ctx.create_service_server("mirror")?;
/// server.add_method("echo", |_method: &str, request: &[u8]| Ok(request.to_vec()));
/// # Ok::<(), hcal::Error>(())
/// ```
pub struct ServiceServer {
    shared: Arc<ServerShared>,
    events: WorkerThread,
}

impl ServiceServer {
    pub(crate) fn create(ctx: &Arc<ContextInner>, name: &str) -> Result<Self> {
        Self::create_with_versions(ctx, name, (PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_MAX))
    }

    pub(crate) fn create_with_versions(
        ctx: &Arc<ContextInner>,
        name: &str,
        versions: (u8, u8),
    ) -> Result<Self> {
        crate::trace_fn!("ServiceServer::create");
        if name.is_empty() {
            return Err(Error::InvalidName("empty service name".into()));
        }
        ctx.ensure_open()?;
        let tcp = &ctx.config.transport.tcp;
        let io = IoThread::spawn(IoSettings {
            name: "svc-server".to_string(),
            layout: FrameLayout::Envelope,
            max_message_size: tcp.max_message_size,
            nodelay: tcp.nodelay,
            listen: Some(SocketAddr::from((
                Ipv4Addr::UNSPECIFIED,
                ctx.config.service.server_port,
            ))),
        })?;
        let events = io.events().clone();

        let placeholder = ServiceInfo {
            role: ServiceRole::Server,
            service_name: name.to_string(),
            methods: Vec::new(),
            tcp_port: io.local_addr().map_or(0, |a| a.port()),
            protocol_min: versions.0,
            protocol_max: versions.1,
        };
        let id = ctx.registry.register(SampleBody::Service(placeholder));
        let shared = Arc::new(ServerShared {
            ctx: Arc::clone(ctx),
            id,
            name: name.to_string(),
            io,
            methods: DashMap::new(),
            sessions: DashMap::new(),
            versions,
            calls_served: AtomicU64::new(0),
        });

        let handler = Arc::clone(&shared);
        let events = drain_events("svc-server-events", events, move |event| handler.on_event(event))?;
        shared.announce();
        log::info!(
            "[RPC] server {} ({}) listening on {:?}",
            name,
            shared.id,
            shared.io.local_addr()
        );
        Ok(Self { shared, events })
    }

    /// Offer `method` with untyped request and response.
    pub fn add_method<F>(&self, method: &str, handler: F)
    where
        F: Fn(&str, &[u8]) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_typed_method(
            method,
            DataTypeInformation::default(),
            DataTypeInformation::default(),
            handler,
        );
    }

    /// Offer `method`; the types are announced in the registration.
    pub fn add_typed_method<F>(
        &self,
        method: &str,
        request_type: DataTypeInformation,
        response_type: DataTypeInformation,
        handler: F,
    ) where
        F: Fn(&str, &[u8]) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_handler(method, request_type, response_type, Arc::new(handler));
    }

    /// Offer `method` served by a shared handler object.
    pub fn add_handler(
        &self,
        method: &str,
        request_type: DataTypeInformation,
        response_type: DataTypeInformation,
        handler: Arc<dyn RequestHandler>,
    ) {
        self.shared.methods.insert(
            method.to_string(),
            Method {
                info: MethodInfo {
                    name: method.to_string(),
                    request_type,
                    response_type,
                },
                handler,
            },
        );
        self.shared.announce();
    }

    /// Stop offering `method`. Returns false if it was not offered.
    pub fn remove_method(&self, method: &str) -> bool {
        let removed = self.shared.methods.remove(method).is_some();
        if removed {
            self.shared.announce();
        }
        removed
    }

    #[must_use]
    pub fn id(&self) -> &EntityId {
        &self.shared.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Listen port announced to clients.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.shared.io.local_addr().map_or(0, |a| a.port())
    }

    /// Sessions that completed the handshake.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.sessions.iter().filter(|s| s.is_some()).count()
    }

    /// Requests answered by a handler so far.
    #[must_use]
    pub fn calls_served(&self) -> u64 {
        self.shared.calls_served.load(Ordering::Relaxed)
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        self.events.stop();
        self.shared.ctx.leave(&self.shared.id);
        log::debug!("[RPC] server {} stopped", self.shared.name);
    }
}

impl std::fmt::Debug for ServiceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceServer")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("port", &self.port())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::Context;
    use std::time::{Duration, Instant};

    fn raw_client(port: u16) -> (IoThreadHandle, u64) {
        let io = IoThread::spawn(IoSettings {
            name: "test-raw-client".to_string(),
            layout: FrameLayout::Envelope,
            max_message_size: 1 << 20,
            nodelay: true,
            listen: None,
        })
        .expect("io");
        let conn = io
            .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .expect("connect");
        (io, conn)
    }

    fn next_message(io: &IoThreadHandle) -> Option<Message> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if let Ok(TcpEvent::Message { payload, .. }) =
                io.events().recv_timeout(Duration::from_millis(50))
            {
                return protocol::decode(&payload).ok().map(|(_, m)| m);
            }
        }
        None
    }

    fn wait_established(io: &IoThreadHandle) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if let Ok(TcpEvent::Established { .. }) =
                io.events().recv_timeout(Duration::from_millis(50))
            {
                return;
            }
        }
        panic!("connection not established");
    }

    #[test]
    fn test_unsupported_version_refused_at_handshake() {
        let ctx = Context::builder()
            .config(Config::in_process())
            .start()
            .expect("context");
        let server = ctx.create_service_server("versioned").expect("server");
        let (io, conn) = raw_client(server.port());
        wait_established(&io);
        let hello = protocol::encode(
            &Message::HandshakeRequest {
                min_version: 7,
                max_version: 9,
            },
            1,
        )
        .expect("encode");
        io.send(conn, hello).expect("send");
        assert_eq!(
            next_message(&io),
            Some(Message::HandshakeResponse { accepted_version: 0 })
        );
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_unknown_method_keeps_session_usable() {
        let ctx = Context::builder()
            .config(Config::in_process())
            .start()
            .expect("context");
        let server = ctx.create_service_server("calc").expect("server");
        server.add_method("double", |_: &str, req: &[u8]| {
            Ok(req.iter().map(|b| b.wrapping_mul(2)).collect())
        });
        let (io, conn) = raw_client(server.port());
        wait_established(&io);
        let hello = protocol::encode(
            &Message::HandshakeRequest {
                min_version: 1,
                max_version: 1,
            },
            1,
        )
        .expect("encode");
        io.send(conn, hello).expect("send");
        assert_eq!(
            next_message(&io),
            Some(Message::HandshakeResponse { accepted_version: 1 })
        );

        let request = |call_id: u64, method: &str| {
            protocol::encode(
                &Message::Request {
                    call_id,
                    method: method.to_string(),
                    payload: vec![1, 2, 3],
                },
                1,
            )
            .expect("encode")
        };
        io.send(conn, request(1, "triple")).expect("send");
        match next_message(&io) {
            Some(Message::Response {
                call_id, ret_state, ..
            }) => {
                assert_eq!(call_id, 1);
                assert_eq!(ret_state, RemoteExceptionCode::UnsupportedMethod.as_i32());
            }
            other => panic!("unexpected {other:?}"),
        }

        io.send(conn, request(2, "double")).expect("send");
        assert_eq!(
            next_message(&io),
            Some(Message::Response {
                call_id: 2,
                ret_state: 0,
                error: String::new(),
                payload: vec![2, 4, 6],
            })
        );
        assert_eq!(server.calls_served(), 1);
    }

    #[test]
    fn test_methods_are_announced() {
        let ctx = Context::builder()
            .config(Config::in_process())
            .start()
            .expect("context");
        let server = ctx.create_service_server("typed").expect("server");
        server.add_typed_method(
            "get",
            DataTypeInformation::new("Req", "proto"),
            DataTypeInformation::new("Resp", "proto"),
            |_: &str, _: &[u8]| Ok(Vec::new()),
        );
        let sample = ctx.directory().get(server.id().id()).expect("registered");
        let info = sample.service().expect("service");
        assert_eq!(info.tcp_port, server.port());
        assert_eq!(info.methods.len(), 1);
        assert_eq!(info.methods[0].request_type.name, "Req");
        assert!(server.remove_method("get"));
        let sample = ctx.directory().get(server.id().id()).expect("registered");
        assert!(sample.service().expect("service").methods.is_empty());
    }
}
