// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-level error type.
//!
//! Each subsystem has its own error enum; [`Error`] wraps them so that the
//! public API (context start, entity creation) can return one type.
//!
//! ```rust,no_run
//! use hcal::{Config, Context, Error};
//!
//! match Context::builder().config(Config::in_process()).start() {
//!     Err(Error::Config(e)) => println!("bad config: {}", e),
//!     Err(e) => println!("other error: {}", e),
//!     Ok(_ctx) => println!("started"),
//! }
//! ```

use crate::config::ConfigError;
use crate::service::ServiceError;
use crate::transport::shm::ShmError;
use crate::transport::LayerError;
use crate::wire::CodecError;
use std::fmt;
use std::io;

/// Result alias for crate-level operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    /// Configuration rejected by [`Config::validate`](crate::Config::validate).
    Config(ConfigError),

    // ========================================================================
    // Entities
    // ========================================================================
    /// Topic or service name is empty.
    InvalidName(String),
    /// Operation on a context that is shutting down.
    ContextClosed,

    // ========================================================================
    // Transport
    // ========================================================================
    /// Socket or thread setup failed.
    Io(io::Error),
    /// Payload layer failure.
    Layer(LayerError),
    /// Shared memory failure.
    Shm(ShmError),
    /// Registration encoding failure.
    Codec(CodecError),

    // ========================================================================
    // Services
    // ========================================================================
    /// Service call failure.
    Service(ServiceError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::InvalidName(what) => write!(f, "Invalid name: {}", what),
            Error::ContextClosed => write!(f, "Context closed"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Layer(e) => write!(f, "Transport layer error: {}", e),
            Error::Shm(e) => write!(f, "Shared memory error: {}", e),
            Error::Codec(e) => write!(f, "Registration codec error: {}", e),
            Error::Service(e) => write!(f, "Service error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Layer(e) => Some(e),
            Error::Shm(e) => Some(e),
            Error::Codec(e) => Some(e),
            Error::Service(e) => Some(e),
            Error::InvalidName(_) | Error::ContextClosed => None,
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<LayerError> for Error {
    fn from(e: LayerError) -> Self {
        Error::Layer(e)
    }
}

impl From<ShmError> for Error {
    fn from(e: ShmError) -> Self {
        Error::Shm(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

impl From<ServiceError> for Error {
    fn from(e: ServiceError) -> Self {
        Error::Service(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_config_error_wraps_with_source() {
        let err: Error = ConfigError::ZeroRefresh.into();
        assert!(err.to_string().starts_with("Configuration error"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_plain_variants_have_no_source() {
        assert!(Error::ContextClosed.source().is_none());
        assert!(Error::InvalidName("empty topic".into()).source().is_none());
    }
}
