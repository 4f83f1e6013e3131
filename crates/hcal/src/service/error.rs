// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for service calls.

use crate::service::RemoteExceptionCode;
use crate::wire::CodecError;
use std::fmt;
use std::io;

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors that can occur during service calls
#[derive(Debug)]
pub enum ServiceError {
    /// No session to a matching server is connected
    RemoteUnavailable(String),

    /// No response arrived before the deadline
    Timeout,

    /// Server answered with a non-zero return state
    Remote {
        code: RemoteExceptionCode,
        message: String,
    },

    /// Server does not offer the method
    MethodNotFound(String),

    /// Peer refused every protocol version we support
    ProtocolVersion { min: u8, max: u8 },

    /// Malformed envelope or message
    Codec(CodecError),

    /// Session closed before the response arrived
    ConnectionLost(String),

    /// Client or server was shut down
    Shutdown,

    /// Socket failure
    Io(io::Error),
}

impl ServiceError {
    /// Error for a failed call's return state.
    pub fn from_ret_state(ret_state: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match RemoteExceptionCode::from_i32(ret_state) {
            RemoteExceptionCode::UnsupportedMethod => Self::MethodNotFound(message),
            RemoteExceptionCode::Timeout => Self::Timeout,
            code => Self::Remote { code, message },
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteUnavailable(name) => write!(f, "No connected server for service {}", name),
            Self::Timeout => write!(f, "Service call timed out"),
            Self::Remote { code, message } => {
                write!(f, "Remote exception: {:?}", code)?;
                if !message.is_empty() {
                    write!(f, " - {}", message)?;
                }
                Ok(())
            }
            Self::MethodNotFound(name) => write!(f, "Method not found: {}", name),
            Self::ProtocolVersion { min, max } => {
                write!(f, "Peer supports none of protocol versions {}..={}", min, max)
            }
            Self::Codec(e) => write!(f, "Service envelope error: {}", e),
            Self::ConnectionLost(reason) => write!(f, "Session lost: {}", reason),
            Self::Shutdown => write!(f, "Service shut down"),
            Self::Io(e) => write!(f, "Service I/O error: {}", e),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for ServiceError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<io::Error> for ServiceError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
