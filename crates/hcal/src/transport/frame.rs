// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload frame carried by the network layers (UDP datagrams, TCP
//! length-prefixed frames).
//!
//! ```text
//! +---------+-----------+----------+-----------+---------------+-----------------+
//! | version | sender id | clock    | send time | topic         | payload         |
//! |   u8    |  u64 BE   |  u64 BE  |  i64 BE   | u16 len + str | u32 len + bytes |
//! +---------+-----------+----------+-----------+---------------+-----------------+
//! ```
//!
//! The send time is in microseconds since the Unix epoch.
//!
//! Multicast groups are shared by several topics, so every frame names its
//! topic and receivers drop frames for other topics.

use crate::entity::LayerKind;
use crate::transport::OutgoingSample;
use crate::wire::{CodecError, CodecResult, WireReader, WireWriter};

pub const FRAME_VERSION: u8 = 2;

/// Fixed bytes of a frame besides topic and payload.
pub const FRAME_OVERHEAD: usize = 1 + 8 + 8 + 8 + 2 + 4;

/// Encode one frame.
pub fn encode_frame(sample: &OutgoingSample<'_>, payload: &[u8]) -> CodecResult<Vec<u8>> {
    let mut w = WireWriter::with_capacity(FRAME_OVERHEAD + sample.topic.len() + payload.len());
    w.write_u8(FRAME_VERSION);
    w.write_u64(sample.sender_id);
    w.write_u64(sample.clock);
    w.write_i64(sample.timestamp);
    w.write_str("topic", sample.topic)?;
    w.write_bytes("payload", payload)?;
    Ok(w.into_inner())
}

/// Decoded frame borrowing its payload from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame<'a> {
    pub sender_id: u64,
    pub clock: u64,
    pub timestamp: i64,
    pub topic: String,
    pub payload: &'a [u8],
}

impl<'a> DataFrame<'a> {
    pub fn decode(buf: &'a [u8]) -> CodecResult<Self> {
        let mut r = WireReader::new(buf);
        let version = r.read_u8()?;
        if version != FRAME_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        Ok(Self {
            sender_id: r.read_u64()?,
            clock: r.read_u64()?,
            timestamp: r.read_i64()?,
            topic: r.read_str()?,
            payload: r.read_bytes()?,
        })
    }
}

/// A sample handed from a layer reader to its subscriber.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedSample<'a> {
    pub layer: LayerKind,
    pub sender_id: u64,
    pub clock: u64,
    /// Send time set by the publisher (microseconds since the Unix epoch)
    pub timestamp: i64,
    pub payload: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(topic: &str) -> OutgoingSample<'_> {
        OutgoingSample {
            sender_id: 0x0102,
            clock: 7,
            timestamp: -5,
            topic,
        }
    }

    #[test]
    fn test_frame_layout() {
        let bytes = encode_frame(&sample("ab"), b"xyz").expect("encode");
        assert_eq!(bytes.len(), FRAME_OVERHEAD + 2 + 3);
        assert_eq!(bytes[0], FRAME_VERSION);
        assert_eq!(&bytes[1..9], &0x0102u64.to_be_bytes());
        assert_eq!(&bytes[17..25], &(-5i64).to_be_bytes());

        let frame = DataFrame::decode(&bytes).expect("decode");
        assert_eq!(frame.sender_id, 0x0102);
        assert_eq!(frame.clock, 7);
        assert_eq!(frame.timestamp, -5);
        assert_eq!(frame.topic, "ab");
        assert_eq!(frame.payload, b"xyz");
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = encode_frame(&sample("t"), b"").expect("encode");
        bytes[0] = 9;
        assert_eq!(
            DataFrame::decode(&bytes),
            Err(CodecError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let bytes = encode_frame(&sample("topic"), b"payload").expect("encode");
        assert!(matches!(
            DataFrame::decode(&bytes[..bytes.len() - 2]),
            Err(CodecError::Truncated { .. })
        ));
    }
}
