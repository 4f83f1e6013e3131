// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload transport layers and the multiplexer that picks one per peer.
//!
//! ```text
//!   Publisher                                          Subscriber
//!   ---------                                          ----------
//!   LayerWriter (shm) ---- ChannelWriter/Reader ------> LayerReader (shm)
//!   LayerWriter (udp) ---- multicast DataFrame -------> LayerReader (udp)
//!   LayerWriter (tcp) ---- length-prefixed DataFrame -> LayerReader (tcp)
//!          ^                                                  ^
//!          +---------- Multiplexer: one layer per peer -------+
//! ```
//!
//! Both ends of a connection run the same [`Multiplexer`] rule over the same
//! registration data, so they converge on the same layer without talking to
//! each other.

pub mod fragment;
pub mod frame;
pub mod mux;
pub mod shm;
pub mod tcp;
pub mod udp;

pub use frame::{DataFrame, ReceivedSample};
pub use mux::{FailureScope, LinkError, LinkOpener, Multiplexer, Reconciled};

use crate::entity::{EntityId, LayerKind, TransportLayer};
use crate::transport::shm::{PayloadWriter, ShmError};
use crate::wire::CodecError;
use std::fmt;
use std::io;
use std::sync::Arc;

// ============================================================================
// Errors
// ============================================================================

/// Failure of one transport layer.
#[derive(Debug)]
pub enum LayerError {
    /// Layer disabled locally or not announced by the peer
    Unavailable(LayerKind),

    /// Peer announced the layer without usable parameters
    MissingParameters(LayerKind),

    /// Payload exceeds what the layer can carry
    PayloadTooLarge {
        layer: LayerKind,
        size: usize,
        max: usize,
    },

    /// Payload writer refused to fill the buffer
    Aborted,

    /// Shared memory failure
    Shm(ShmError),

    /// Socket failure
    Io { layer: LayerKind, source: io::Error },

    /// Frame encoding failure
    Codec(CodecError),
}

impl LayerError {
    pub(crate) fn io(layer: LayerKind, source: io::Error) -> Self {
        Self::Io { layer, source }
    }
}

impl fmt::Display for LayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(layer) => write!(f, "layer {layer} unavailable"),
            Self::MissingParameters(layer) => {
                write!(f, "peer announced layer {layer} without parameters")
            }
            Self::PayloadTooLarge { layer, size, max } => {
                write!(f, "payload of {size} bytes exceeds {layer} limit of {max}")
            }
            Self::Aborted => write!(f, "payload writer aborted the send"),
            Self::Shm(e) => write!(f, "shm: {e}"),
            Self::Io { layer, source } => write!(f, "{layer}: {source}"),
            Self::Codec(e) => write!(f, "frame encoding: {e}"),
        }
    }
}

impl std::error::Error for LayerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Shm(e) => Some(e),
            Self::Io { source, .. } => Some(source),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmError> for LayerError {
    fn from(e: ShmError) -> Self {
        match e {
            ShmError::WriteAborted => Self::Aborted,
            other => Self::Shm(other),
        }
    }
}

impl From<CodecError> for LayerError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Connection-level transport events, delivered to entity event callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerEvent {
    /// `layer` now carries the connection to `peer`
    Selected {
        local: EntityId,
        peer: EntityId,
        layer: LayerKind,
        previous: Option<LayerKind>,
    },
    /// Opening `from` failed; `to` is the layer used instead, if any
    Downgraded {
        local: EntityId,
        peer: EntityId,
        from: LayerKind,
        to: Option<LayerKind>,
        reason: String,
    },
    /// No layer connects to `peer` any more
    Released {
        local: EntityId,
        peer: EntityId,
        layer: LayerKind,
    },
}

// ============================================================================
// Links
// ============================================================================

/// Receives every sample a layer reader decodes, on the reader's thread.
pub type SampleSink = Arc<dyn Fn(&ReceivedSample<'_>) + Send + Sync>;

/// Box a closure as a [`SampleSink`].
pub fn sample_sink<F>(f: F) -> SampleSink
where
    F: Fn(&ReceivedSample<'_>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Header fields of an outgoing sample.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingSample<'a> {
    pub sender_id: u64,
    pub clock: u64,
    /// Send time (microseconds since the Unix epoch)
    pub timestamp: i64,
    pub topic: &'a str,
}

/// Current time in microseconds since the Unix epoch.
#[must_use]
pub fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Sending side of one layer for one publisher.
pub trait LayerWriter: Send {
    fn kind(&self) -> LayerKind;

    /// Send one sample. Returns the payload bytes written.
    fn write(
        &mut self,
        sample: &OutgoingSample<'_>,
        payload: &mut dyn PayloadWriter,
    ) -> Result<usize, LayerError>;
}

/// Receiving side of one layer for one subscriber.
pub trait LayerReader: Send {
    fn kind(&self) -> LayerKind;

    /// Start receiving from `peer` using its announced parameters.
    fn connect(&mut self, peer: &EntityId, layer: &TransportLayer) -> Result<(), LayerError>;

    /// Stop receiving from `peer`.
    fn disconnect(&mut self, peer: &EntityId);
}

/// Serialize a payload into a fresh buffer for the copying layers.
pub(crate) fn serialize(payload: &mut dyn PayloadWriter) -> Result<Vec<u8>, LayerError> {
    let mut buf = vec![0u8; payload.get_size()];
    if !payload.write_full(&mut buf) {
        return Err(LayerError::Aborted);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::shm::BytesPayload;
    use std::error::Error as _;

    #[test]
    fn test_write_aborted_maps_to_aborted() {
        assert!(matches!(
            LayerError::from(ShmError::WriteAborted),
            LayerError::Aborted
        ));
        assert!(matches!(
            LayerError::from(ShmError::Corruption),
            LayerError::Shm(ShmError::Corruption)
        ));
    }

    #[test]
    fn test_error_source() {
        let err = LayerError::io(LayerKind::Udp, io::Error::other("boom"));
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("udp"));
        assert!(LayerError::Unavailable(LayerKind::Shm).source().is_none());
    }

    #[test]
    fn test_serialize_copies_payload() {
        let mut payload = BytesPayload(b"abc");
        assert_eq!(serialize(&mut payload).expect("serialize"), b"abc");

        let mut refusing = (4usize, |_: &mut [u8]| false);
        assert!(matches!(serialize(&mut refusing), Err(LayerError::Aborted)));
    }
}
