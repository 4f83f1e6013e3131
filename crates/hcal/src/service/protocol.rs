// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service session wire protocol.
//!
//! Every message travels in an envelope:
//!
//! ```text
//! +---------+------+-------------+-------------+---------------------+
//! | version | type | header size | payload len | payload             |
//! |   u8    |  u8  |  u16 (= 8)  |     u32     | message body        |
//! +---------+------+-------------+-------------+---------------------+
//! ```
//!
//! A session starts with a handshake: the client offers the range of
//! versions it speaks, the server answers with the highest common one or 0
//! and closes the connection. All later envelopes carry the accepted version.

use crate::transport::tcp::ENVELOPE_HEADER_SIZE;
use crate::wire::{CodecError, CodecResult, WireReader, WireWriter};

/// Oldest protocol version spoken by this build.
pub const PROTOCOL_VERSION_MIN: u8 = 1;

/// Newest protocol version spoken by this build.
pub const PROTOCOL_VERSION_MAX: u8 = 1;

/// Handshake envelopes always carry this version so any peer can parse them.
const HANDSHAKE_VERSION: u8 = 1;

const TYPE_HANDSHAKE_REQUEST: u8 = 1;
const TYPE_HANDSHAKE_RESPONSE: u8 = 2;
const TYPE_REQUEST: u8 = 3;
const TYPE_RESPONSE: u8 = 4;

/// Remote exception codes carried as a response's `ret_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum RemoteExceptionCode {
    /// No error, request processed successfully
    #[default]
    Ok = 0,
    /// Service not found
    UnsupportedService = 1,
    /// Method not found in service
    UnsupportedMethod = 2,
    /// Invalid arguments
    InvalidArgument = 3,
    /// Service is unavailable
    ServiceUnavailable = 4,
    /// Request timed out
    Timeout = 5,
    /// Internal error in service
    InternalError = 6,
    /// Unknown/custom error
    Unknown = -1,
}

impl RemoteExceptionCode {
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::UnsupportedService,
            2 => Self::UnsupportedMethod,
            3 => Self::InvalidArgument,
            4 => Self::ServiceUnavailable,
            5 => Self::Timeout,
            6 => Self::InternalError,
            _ => Self::Unknown,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// One session message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HandshakeRequest { min_version: u8, max_version: u8 },
    /// `accepted_version` 0 means refused
    HandshakeResponse { accepted_version: u8 },
    Request {
        call_id: u64,
        method: String,
        payload: Vec<u8>,
    },
    Response {
        call_id: u64,
        ret_state: i32,
        error: String,
        payload: Vec<u8>,
    },
}

impl Message {
    fn type_code(&self) -> u8 {
        match self {
            Self::HandshakeRequest { .. } => TYPE_HANDSHAKE_REQUEST,
            Self::HandshakeResponse { .. } => TYPE_HANDSHAKE_RESPONSE,
            Self::Request { .. } => TYPE_REQUEST,
            Self::Response { .. } => TYPE_RESPONSE,
        }
    }

    fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::HandshakeRequest { .. } | Self::HandshakeResponse { .. }
        )
    }
}

/// Highest version inside both ranges.
#[must_use]
pub fn negotiate(ours: (u8, u8), theirs: (u8, u8)) -> Option<u8> {
    let low = ours.0.max(theirs.0);
    let high = ours.1.min(theirs.1);
    (low <= high && high > 0).then_some(high)
}

/// Wrap `message` in an envelope of `version`.
pub fn encode(message: &Message, version: u8) -> CodecResult<Vec<u8>> {
    let mut body = WireWriter::new();
    match message {
        Message::HandshakeRequest {
            min_version,
            max_version,
        } => {
            body.write_u8(*min_version);
            body.write_u8(*max_version);
        }
        Message::HandshakeResponse { accepted_version } => body.write_u8(*accepted_version),
        Message::Request {
            call_id,
            method,
            payload,
        } => {
            body.write_u64(*call_id);
            body.write_str("method", method)?;
            body.write_raw(payload);
        }
        Message::Response {
            call_id,
            ret_state,
            error,
            payload,
        } => {
            body.write_u64(*call_id);
            body.write_i32(*ret_state);
            body.write_str("error", error)?;
            body.write_raw(payload);
        }
    }
    let body = body.into_inner();
    let payload_len = u32::try_from(body.len()).map_err(|_| CodecError::TooLong {
        field: "payload",
        len: body.len(),
    })?;

    let version = if message.is_handshake() {
        HANDSHAKE_VERSION
    } else {
        version
    };
    let mut frame = WireWriter::with_capacity(ENVELOPE_HEADER_SIZE + body.len());
    frame.write_u8(version);
    frame.write_u8(message.type_code());
    frame.write_u16(ENVELOPE_HEADER_SIZE as u16);
    frame.write_u32(payload_len);
    frame.write_raw(&body);
    Ok(frame.into_inner())
}

/// Parse a complete envelope. Returns the envelope version and message.
///
/// Header bytes beyond the fixed eight are skipped, so later versions may
/// extend the header.
pub fn decode(frame: &[u8]) -> CodecResult<(u8, Message)> {
    let mut r = WireReader::new(frame);
    let version = r.read_u8()?;
    let type_code = r.read_u8()?;
    let header_size = r.read_u16()? as usize;
    let payload_len = r.read_u32()? as usize;
    if header_size < ENVELOPE_HEADER_SIZE {
        return Err(CodecError::Truncated {
            offset: 2,
            needed: ENVELOPE_HEADER_SIZE,
        });
    }
    r.take(header_size - ENVELOPE_HEADER_SIZE)?;
    let mut body = WireReader::new(r.take(payload_len)?);

    let message = match type_code {
        TYPE_HANDSHAKE_REQUEST => Message::HandshakeRequest {
            min_version: body.read_u8()?,
            max_version: body.read_u8()?,
        },
        TYPE_HANDSHAKE_RESPONSE => Message::HandshakeResponse {
            accepted_version: body.read_u8()?,
        },
        TYPE_REQUEST => Message::Request {
            call_id: body.read_u64()?,
            method: body.read_str()?,
            payload: body.rest().to_vec(),
        },
        TYPE_RESPONSE => Message::Response {
            call_id: body.read_u64()?,
            ret_state: body.read_i32()?,
            error: body.read_str()?,
            payload: body.rest().to_vec(),
        },
        value => {
            return Err(CodecError::InvalidTag {
                field: "message type",
                value,
            })
        }
    };
    if !message.is_handshake() && !(PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_MAX).contains(&version)
    {
        return Err(CodecError::UnsupportedVersion(version));
    }
    Ok((version, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_picks_highest_common() {
        assert_eq!(negotiate((1, 3), (2, 5)), Some(3));
        assert_eq!(negotiate((1, 1), (1, 1)), Some(1));
        assert_eq!(negotiate((1, 2), (3, 4)), None);
        assert_eq!(negotiate((0, 0), (0, 0)), None);
    }

    #[test]
    fn test_envelope_header_layout() {
        let frame = encode(&Message::HandshakeResponse { accepted_version: 1 }, 1).expect("encode");
        assert_eq!(frame[0], 1);
        assert_eq!(frame[1], TYPE_HANDSHAKE_RESPONSE);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 8);
        assert_eq!(u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]), 1);
        assert_eq!(frame.len(), 9);
    }

    #[test]
    fn test_response_round_trip_keeps_binary_payload() {
        let message = Message::Response {
            call_id: 9,
            ret_state: RemoteExceptionCode::UnsupportedMethod.as_i32(),
            error: "no such method".into(),
            payload: vec![0, 255, 0],
        };
        let frame = encode(&message, PROTOCOL_VERSION_MAX).expect("encode");
        assert_eq!(decode(&frame).expect("decode"), (PROTOCOL_VERSION_MAX, message));
    }

    #[test]
    fn test_decode_skips_extended_header() {
        let mut frame = encode(
            &Message::Request {
                call_id: 1,
                method: "m".into(),
                payload: b"x".to_vec(),
            },
            1,
        )
        .expect("encode");
        frame[3] = 12;
        frame.splice(8..8, [0xAA; 4]);
        let (_, message) = decode(&frame).expect("decode");
        assert!(matches!(message, Message::Request { method, .. } if method == "m"));
    }

    #[test]
    fn test_decode_rejects_unknown_version_and_type() {
        let mut frame = encode(
            &Message::Request {
                call_id: 1,
                method: "m".into(),
                payload: Vec::new(),
            },
            1,
        )
        .expect("encode");
        frame[0] = 9;
        assert_eq!(decode(&frame), Err(CodecError::UnsupportedVersion(9)));
        frame[0] = 1;
        frame[1] = 77;
        assert!(matches!(
            decode(&frame),
            Err(CodecError::InvalidTag { value: 77, .. })
        ));
        assert!(decode(&frame[..5]).is_err());
    }
}
