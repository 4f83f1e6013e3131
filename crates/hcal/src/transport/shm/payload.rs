// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload writer capability used by the zero-copy send path.

/// Serializes a payload straight into a shared memory buffer.
///
/// The channel reserves at least [`get_size`](Self::get_size) bytes and then
/// calls exactly one of the write methods with a buffer of exactly that
/// length. Returning `false` aborts the send: nothing is published and the
/// next send falls back to `write_full`.
pub trait PayloadWriter {
    /// Number of bytes the payload occupies.
    fn get_size(&self) -> usize;

    /// Write the whole payload into `buf` (fresh or resized buffer).
    fn write_full(&mut self, buf: &mut [u8]) -> bool;

    /// Update `buf`, which still holds the previous payload of this writer.
    fn write_modified(&mut self, buf: &mut [u8]) -> bool {
        self.write_full(buf)
    }
}

/// [`PayloadWriter`] over an owned or borrowed byte slice.
#[derive(Debug, Clone, Copy)]
pub struct BytesPayload<'a>(pub &'a [u8]);

impl PayloadWriter for BytesPayload<'_> {
    fn get_size(&self) -> usize {
        self.0.len()
    }

    fn write_full(&mut self, buf: &mut [u8]) -> bool {
        if buf.len() != self.0.len() {
            return false;
        }
        buf.copy_from_slice(self.0);
        true
    }
}

impl<F> PayloadWriter for (usize, F)
where
    F: FnMut(&mut [u8]) -> bool,
{
    fn get_size(&self) -> usize {
        self.0
    }

    fn write_full(&mut self, buf: &mut [u8]) -> bool {
        (self.1)(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_payload() {
        let mut p = BytesPayload(b"abc");
        assert_eq!(p.get_size(), 3);
        let mut buf = [0u8; 3];
        assert!(p.write_modified(&mut buf));
        assert_eq!(&buf, b"abc");
        let mut wrong = [0u8; 2];
        assert!(!p.write_full(&mut wrong));
    }

    #[test]
    fn test_closure_payload() {
        let mut p = (4usize, |buf: &mut [u8]| {
            buf.fill(7);
            true
        });
        let mut buf = [0u8; 4];
        assert!(p.write_full(&mut buf));
        assert_eq!(buf, [7; 4]);
    }
}
