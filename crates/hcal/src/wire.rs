// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Big-endian read/write cursors for the wire formats.
//!
//! Used by the registration codec, the UDP/TCP data frames and the service
//! envelope. Strings are `u16` length-prefixed UTF-8, byte blobs are `u32`
//! length-prefixed.

use std::fmt;

/// Decoding/encoding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Datagram does not start with the expected magic
    BadMagic,
    /// Unknown schema/protocol version
    UnsupportedVersion(u8),
    /// Buffer ended early
    Truncated { offset: usize, needed: usize },
    /// Enum tag out of range
    InvalidTag { field: &'static str, value: u8 },
    /// String is not UTF-8
    InvalidUtf8 { offset: usize },
    /// Field longer than its length prefix allows
    TooLong { field: &'static str, len: usize },
    /// Fields contradict each other
    Inconsistent(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "bad magic"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported version {v}"),
            Self::Truncated { offset, needed } => {
                write!(f, "truncated at offset {offset} (needed {needed} bytes)")
            }
            Self::InvalidTag { field, value } => write!(f, "invalid {field} tag {value}"),
            Self::InvalidUtf8 { offset } => write!(f, "invalid UTF-8 at offset {offset}"),
            Self::TooLong { field, len } => write!(f, "{field} too long ({len} bytes)"),
            Self::Inconsistent(field) => write!(f, "inconsistent {field}"),
        }
    }
}

impl std::error::Error for CodecError {}

pub type CodecResult<T> = Result<T, CodecError>;

macro_rules! impl_read_be {
    ($name:ident, $type:ty, $size:expr) => {
        pub fn $name(&mut self) -> CodecResult<$type> {
            let bytes = self.take($size)?;
            let mut raw = [0u8; $size];
            raw.copy_from_slice(bytes);
            Ok(<$type>::from_be_bytes(raw))
        }
    };
}

macro_rules! impl_write_be {
    ($name:ident, $type:ty) => {
        pub fn $name(&mut self, value: $type) {
            self.buffer.extend_from_slice(&value.to_be_bytes());
        }
    };
}

/// Growable writer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buffer: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    impl_write_be!(write_u8, u8);
    impl_write_be!(write_u16, u16);
    impl_write_be!(write_u32, u32);
    impl_write_be!(write_u64, u64);
    impl_write_be!(write_i32, i32);
    impl_write_be!(write_i64, i64);

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    pub fn write_raw(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// `u16` length + UTF-8 bytes.
    pub fn write_str(&mut self, field: &'static str, value: &str) -> CodecResult<()> {
        let len = u16::try_from(value.len()).map_err(|_| CodecError::TooLong {
            field,
            len: value.len(),
        })?;
        self.write_u16(len);
        self.write_raw(value.as_bytes());
        Ok(())
    }

    /// `u32` length + bytes.
    pub fn write_bytes(&mut self, field: &'static str, value: &[u8]) -> CodecResult<()> {
        let len = u32::try_from(value.len()).map_err(|_| CodecError::TooLong {
            field,
            len: value.len(),
        })?;
        self.write_u32(len);
        self.write_raw(value);
        Ok(())
    }

    /// Overwrite a `u32` previously written at `offset`.
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        if let Some(slot) = self.buffer.get_mut(offset..offset + 4) {
            slot.copy_from_slice(&value.to_be_bytes());
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

/// Bounds-checked reader.
pub struct WireReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    impl_read_be!(read_u8, u8, 1);
    impl_read_be!(read_u16, u16, 2);
    impl_read_be!(read_u32, u32, 4);
    impl_read_be!(read_u64, u64, 8);
    impl_read_be!(read_i32, i32, 4);
    impl_read_be!(read_i64, i64, 8);

    pub fn read_bool(&mut self) -> CodecResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Borrow the next `len` bytes.
    pub fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.buffer.len())
            .ok_or(CodecError::Truncated {
                offset: self.offset,
                needed: len,
            })?;
        let out = &self.buffer[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    pub fn read_str(&mut self) -> CodecResult<String> {
        let len = self.read_u16()? as usize;
        let offset = self.offset;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8 { offset })
    }

    pub fn read_bytes(&mut self) -> CodecResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buffer[self.offset..];
        self.offset = self.buffer.len();
        out
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.offset)
    }
}
