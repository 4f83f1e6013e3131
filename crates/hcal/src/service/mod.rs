// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/response services over TCP sessions.
//!
//! A [`ServiceServer`] listens on a TCP port and announces its methods in
//! the registration. Every [`ServiceClient`] of the same name opens one
//! session per discovered server and fans calls out over them.

mod client;
mod error;
pub mod protocol;
mod server;

pub use client::{
    CallState, ResponseCallback, ServiceClient, ServiceResponse, SessionEvent,
    SessionEventCallback, SessionInfo, SessionState,
};
pub use error::{ServiceError, ServiceResult};
pub use protocol::{RemoteExceptionCode, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN};
pub use server::{HandlerResult, RequestHandler, ServiceServer};
