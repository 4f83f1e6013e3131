// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental framing for TCP byte streams.
//!
//! Two layouts share one decoder:
//!
//! ```text
//! LengthPrefix (payload streams)
//! +----------------+-----------+
//! | Length (4B BE) | Payload   |
//! +----------------+-----------+
//!
//! Envelope (service sessions)
//! +---------+------+-------------+--------------+--------------+---------+
//! | version | type | header size | payload len  | (extension)  | payload |
//! |   u8    |  u8  |   u16 BE    |   u32 BE     | hdr size - 8 |         |
//! +---------+------+-------------+--------------+--------------+---------+
//! ```
//!
//! `decode` is written for non-blocking sockets: call it while the socket is
//! readable until it returns `Ok(None)`.

use std::io::{self, Read};

/// Length prefix size.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Fixed part of an envelope header.
pub const ENVELOPE_HEADER_SIZE: usize = 8;

/// How frames are delimited on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    /// `[len u32 BE][payload]`; decode yields the payload
    LengthPrefix,
    /// Service envelope; decode yields the whole frame, header included
    Envelope,
}

impl FrameLayout {
    fn header_size(self) -> usize {
        match self {
            Self::LengthPrefix => LENGTH_PREFIX_SIZE,
            Self::Envelope => ENVELOPE_HEADER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    ReadingHeader { bytes_read: usize },
    ReadingBody { expected_len: usize, bytes_read: usize },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingHeader { bytes_read: 0 }
    }
}

/// Stateful frame decoder for one connection.
#[derive(Debug)]
pub struct FrameCodec {
    layout: FrameLayout,
    state: ReadState,
    /// Header bytes, then body bytes once the header is parsed
    buffer: Vec<u8>,
    max_size: usize,
    frames_decoded: u64,
    frames_rejected: u64,
}

impl FrameCodec {
    #[must_use]
    pub fn new(layout: FrameLayout, max_size: usize) -> Self {
        Self {
            layout,
            state: ReadState::default(),
            buffer: vec![0u8; layout.header_size()],
            max_size,
            frames_decoded: 0,
            frames_rejected: 0,
        }
    }

    #[must_use]
    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    #[must_use]
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    #[must_use]
    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Reset after a connection reset.
    pub fn reset(&mut self) {
        self.state = ReadState::default();
        self.buffer.resize(self.layout.header_size(), 0);
    }

    /// True while a frame is half read.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        match self.state {
            ReadState::ReadingHeader { bytes_read } => bytes_read > 0,
            ReadState::ReadingBody { .. } => true,
        }
    }

    /// Frame a payload with a length prefix.
    #[must_use]
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// Body length announced by a complete header.
    fn body_len(&self) -> io::Result<usize> {
        let h = &self.buffer;
        match self.layout {
            FrameLayout::LengthPrefix => Ok(u32::from_be_bytes([h[0], h[1], h[2], h[3]]) as usize),
            FrameLayout::Envelope => {
                let header_size = u16::from_be_bytes([h[2], h[3]]) as usize;
                if header_size < ENVELOPE_HEADER_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("envelope header size {header_size} below {ENVELOPE_HEADER_SIZE}"),
                    ));
                }
                let payload_len = u32::from_be_bytes([h[4], h[5], h[6], h[7]]) as usize;
                Ok(header_size - ENVELOPE_HEADER_SIZE + payload_len)
            }
        }
    }

    fn finish_frame(&mut self, body_len: usize) -> Vec<u8> {
        let header_size = self.layout.header_size();
        let frame = match self.layout {
            FrameLayout::LengthPrefix => self.buffer[header_size..header_size + body_len].to_vec(),
            FrameLayout::Envelope => self.buffer[..header_size + body_len].to_vec(),
        };
        self.frames_decoded += 1;
        self.buffer.truncate(header_size);
        self.state = ReadState::default();
        frame
    }

    /// Try to decode one frame from `reader`.
    ///
    /// - `Ok(Some(frame))`: a complete frame
    /// - `Ok(None)`: need more data (`WouldBlock`)
    /// - `Err(e)`: I/O error, EOF, or an oversized/invalid header
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        let header_size = self.layout.header_size();
        loop {
            match self.state {
                ReadState::ReadingHeader { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..header_size]) {
                        Ok(0) => {
                            let msg = if bytes_read == 0 {
                                "connection closed"
                            } else {
                                "incomplete frame header"
                            };
                            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < header_size {
                                self.state = ReadState::ReadingHeader { bytes_read: total };
                                continue;
                            }

                            let len = self.body_len()?;
                            if len > self.max_size {
                                self.frames_rejected += 1;
                                self.reset();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("frame too large: {} bytes (max {})", len, self.max_size),
                                ));
                            }
                            if len == 0 {
                                return Ok(Some(self.finish_frame(0)));
                            }
                            self.buffer.resize(header_size + len, 0);
                            self.state = ReadState::ReadingBody {
                                expected_len: len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::ReadingHeader { bytes_read };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                ReadState::ReadingBody {
                    expected_len,
                    bytes_read,
                } => {
                    let start = header_size + bytes_read;
                    let end = header_size + expected_len;
                    match reader.read(&mut self.buffer[start..end]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "incomplete frame body",
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < expected_len {
                                self.state = ReadState::ReadingBody {
                                    expected_len,
                                    bytes_read: total,
                                };
                                continue;
                            }
                            return Ok(Some(self.finish_frame(expected_len)));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}
