// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fragmentation of UDP messages larger than one datagram.
//!
//! Every UDP datagram, payload or registration, starts with a fragment
//! header. A message that fits is sent as fragment 0 of 1.
//!
//! ```text
//! +------+---------+-----------+------------+-------+-------+-----------+-------+
//! | "HF" | version | sender    | message id | index | count | total len | chunk |
//! |      |   u8    |  u64 BE   |  u64 BE    |  u16  |  u16  |  u32 BE   |       |
//! +------+---------+-----------+------------+-------+-------+-----------+-------+
//! ```
//!
//! Receivers keep incomplete messages keyed by (sender, message id):
//!
//! - Out-of-order and duplicate fragments are accepted
//! - Incomplete messages are evicted after a timeout
//! - The least recently updated message is evicted when the buffer is full

use crate::entity::{hash_string, local_host_name};
use crate::wire::{CodecError, CodecResult, WireReader, WireWriter};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const FRAGMENT_MAGIC: &[u8; 2] = b"HF";
pub const FRAGMENT_VERSION: u8 = 1;

/// Bytes of the fragment header.
pub const FRAGMENT_HEADER_SIZE: usize = 2 + 1 + 8 + 8 + 2 + 2 + 4;

/// Header of one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub sender: u64,
    pub message_id: u64,
    pub index: u16,
    pub count: u16,
    pub total_len: u32,
}

impl FragmentHeader {
    fn encode(&self, w: &mut WireWriter) {
        w.write_raw(FRAGMENT_MAGIC);
        w.write_u8(FRAGMENT_VERSION);
        w.write_u64(self.sender);
        w.write_u64(self.message_id);
        w.write_u16(self.index);
        w.write_u16(self.count);
        w.write_u32(self.total_len);
    }

    /// Split a datagram into its header and chunk.
    pub fn decode(datagram: &[u8]) -> CodecResult<(Self, &[u8])> {
        let mut r = WireReader::new(datagram);
        if r.take(FRAGMENT_MAGIC.len())? != FRAGMENT_MAGIC {
            return Err(CodecError::BadMagic);
        }
        let version = r.read_u8()?;
        if version != FRAGMENT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let header = Self {
            sender: r.read_u64()?,
            message_id: r.read_u64()?,
            index: r.read_u16()?,
            count: r.read_u16()?,
            total_len: r.read_u32()?,
        };
        if header.count == 0 || header.index >= header.count {
            return Err(CodecError::Inconsistent("fragment index"));
        }
        Ok((header, r.rest()))
    }
}

/// Key distinguishing fragmenters across hosts, processes and sockets.
fn sender_key() -> u64 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seed = format!("{}/{}/{}", local_host_name(), std::process::id(), nanos);
    (u64::from(hash_string(&seed)) << 32) | u64::from(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Sending side: cuts messages into datagrams of at most `max_datagram` bytes.
#[derive(Debug)]
pub struct Fragmenter {
    sender: u64,
    next_message: AtomicU64,
    max_datagram: usize,
    max_message: usize,
}

impl Fragmenter {
    #[must_use]
    pub fn new(max_datagram: usize, max_message: usize) -> Self {
        Self {
            sender: sender_key(),
            next_message: AtomicU64::new(1),
            max_datagram: max_datagram.max(FRAGMENT_HEADER_SIZE + 1),
            max_message,
        }
    }

    /// Payload bytes carried per datagram.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.max_datagram - FRAGMENT_HEADER_SIZE
    }

    #[must_use]
    pub fn max_message(&self) -> usize {
        self.max_message
    }

    /// Cut `message` into datagrams.
    pub fn split(&self, message: &[u8]) -> CodecResult<Vec<Vec<u8>>> {
        let too_long = CodecError::TooLong {
            field: "message",
            len: message.len(),
        };
        if message.len() > self.max_message {
            return Err(too_long);
        }
        let total_len = u32::try_from(message.len()).map_err(|_| too_long.clone())?;
        let chunks = message.len().div_ceil(self.chunk_size()).max(1);
        let count = u16::try_from(chunks).map_err(|_| too_long)?;

        let mut header = FragmentHeader {
            sender: self.sender,
            message_id: self.next_message.fetch_add(1, Ordering::Relaxed),
            index: 0,
            count,
            total_len,
        };
        let mut out = Vec::with_capacity(chunks);
        let mut pieces = message.chunks(self.chunk_size());
        for index in 0..count {
            let chunk = pieces.next().unwrap_or(&[]);
            header.index = index;
            let mut w = WireWriter::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
            header.encode(&mut w);
            w.write_raw(chunk);
            out.push(w.into_inner());
        }
        Ok(out)
    }
}

/// Fragments of one message received so far.
struct Partial {
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    total_len: u32,
    first_seen: Instant,
    last_updated: Instant,
}

/// Receiving side: rebuilds messages from fragments.
pub struct Reassembler {
    pending: HashMap<(u64, u64), Partial>,
    max_pending: usize,
    max_message: usize,
    timeout: Duration,
}

impl Reassembler {
    #[must_use]
    pub fn new(max_pending: usize, max_message: usize, timeout: Duration) -> Self {
        Self {
            pending: HashMap::with_capacity(max_pending),
            max_pending: max_pending.max(1),
            max_message,
            timeout,
        }
    }

    /// Feed one datagram. Returns the message once all its fragments arrived.
    ///
    /// Single-fragment messages are borrowed from `datagram`.
    pub fn insert<'a>(&mut self, datagram: &'a [u8]) -> CodecResult<Option<Cow<'a, [u8]>>> {
        let (header, chunk) = FragmentHeader::decode(datagram)?;
        let total_len = header.total_len as usize;
        if total_len > self.max_message {
            return Err(CodecError::TooLong {
                field: "message",
                len: total_len,
            });
        }
        if header.count == 1 {
            if chunk.len() != total_len {
                return Err(CodecError::Inconsistent("fragment length"));
            }
            return Ok(Some(Cow::Borrowed(chunk)));
        }

        let now = Instant::now();
        self.evict_expired(now);

        let key = (header.sender, header.message_id);
        let restart = self.pending.get(&key).is_some_and(|p| {
            p.chunks.len() != usize::from(header.count) || p.total_len != header.total_len
        });
        if restart {
            log::debug!(
                "[UDP] fragment header of message {}:{} changed, restarting",
                header.sender,
                header.message_id
            );
            self.pending.remove(&key);
        }
        if !self.pending.contains_key(&key) && self.pending.len() >= self.max_pending {
            self.evict_oldest();
        }

        let partial = self.pending.entry(key).or_insert_with(|| Partial {
            chunks: vec![None; usize::from(header.count)],
            received: 0,
            total_len: header.total_len,
            first_seen: now,
            last_updated: now,
        });
        partial.last_updated = now;
        let slot = &mut partial.chunks[usize::from(header.index)];
        if slot.is_none() {
            *slot = Some(chunk.to_vec());
            partial.received += 1;
        }
        if partial.received < partial.chunks.len() {
            return Ok(None);
        }

        let Some(partial) = self.pending.remove(&key) else {
            return Ok(None);
        };
        let mut message = Vec::with_capacity(total_len);
        for chunk in partial.chunks.into_iter().flatten() {
            message.extend_from_slice(&chunk);
        }
        if message.len() != total_len {
            return Err(CodecError::Inconsistent("fragment length"));
        }
        Ok(Some(Cow::Owned(message)))
    }

    /// Drop incomplete messages older than the timeout.
    pub fn evict_expired(&mut self, now: Instant) {
        let timeout = self.timeout;
        let before = self.pending.len();
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.first_seen) < timeout);
        let evicted = before - self.pending.len();
        if evicted > 0 {
            log::debug!("[UDP] dropped {} incomplete message(s) after timeout", evicted);
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, p)| p.last_updated)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            log::debug!("[UDP] reassembly buffer full, dropping message {}:{}", key.0, key.1);
            self.pending.remove(&key);
        }
    }

    /// Incomplete messages currently held.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn reassembler() -> Reassembler {
        Reassembler::new(8, 1 << 20, Duration::from_secs(5))
    }

    #[test]
    fn test_small_message_is_one_fragment() {
        let fragmenter = Fragmenter::new(1_000, 1 << 20);
        let datagrams = fragmenter.split(b"hello").expect("split");
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0].len(), FRAGMENT_HEADER_SIZE + 5);

        let mut r = reassembler();
        let got = r.insert(&datagrams[0]).expect("insert").expect("complete");
        assert!(matches!(got, Cow::Borrowed(_)));
        assert_eq!(&*got, b"hello");
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_large_message_out_of_order() {
        let fragmenter = Fragmenter::new(1_000, 1 << 20);
        let original = message(4_500);
        let datagrams = fragmenter.split(&original).expect("split");
        assert_eq!(datagrams.len(), 5);
        assert!(datagrams.iter().all(|d| d.len() <= 1_000));

        let mut r = reassembler();
        for index in [4, 0, 2, 1] {
            assert!(r.insert(&datagrams[index]).expect("insert").is_none());
        }
        // duplicate of a fragment already held
        assert!(r.insert(&datagrams[2]).expect("insert").is_none());
        assert_eq!(r.pending_count(), 1);

        let got = r.insert(&datagrams[3]).expect("insert").expect("complete");
        assert_eq!(got.into_owned(), original);
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_interleaved_senders_kept_apart() {
        let a = Fragmenter::new(100, 1 << 20);
        let b = Fragmenter::new(100, 1 << 20);
        let (ma, mb) = (message(250), vec![7u8; 250]);
        let (da, db) = (a.split(&ma).expect("a"), b.split(&mb).expect("b"));

        let mut r = reassembler();
        let mut done = Vec::new();
        for (x, y) in da.iter().zip(db.iter()) {
            if let Some(m) = r.insert(x).expect("a") {
                done.push(m.into_owned());
            }
            if let Some(m) = r.insert(y).expect("b") {
                done.push(m.into_owned());
            }
        }
        assert_eq!(done, vec![ma, mb]);
    }

    #[test]
    fn test_incomplete_message_times_out() {
        let fragmenter = Fragmenter::new(100, 1 << 20);
        let datagrams = fragmenter.split(&message(140)).expect("split");
        assert_eq!(datagrams.len(), 2);

        let mut r = Reassembler::new(8, 1 << 20, Duration::from_millis(10));
        assert!(r.insert(&datagrams[0]).expect("insert").is_none());
        std::thread::sleep(Duration::from_millis(30));
        // the first fragment expired, so the second one starts over
        assert!(r.insert(&datagrams[1]).expect("insert").is_none());
        assert_eq!(r.pending_count(), 1);

        r.evict_expired(Instant::now() + Duration::from_secs(1));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_full_buffer_evicts_least_recent() {
        let fragmenter = Fragmenter::new(100, 1 << 20);
        let first = fragmenter.split(&message(140)).expect("first");
        let second = fragmenter.split(&message(140)).expect("second");

        let mut r = Reassembler::new(1, 1 << 20, Duration::from_secs(5));
        assert!(r.insert(&first[0]).expect("insert").is_none());
        assert!(r.insert(&second[0]).expect("insert").is_none());
        assert_eq!(r.pending_count(), 1);
        // first message was evicted
        assert!(r.insert(&first[1]).expect("insert").is_none());
        assert_eq!(r.pending_count(), 1);
    }

    #[test]
    fn test_limits_enforced() {
        let fragmenter = Fragmenter::new(100, 1_000);
        assert!(matches!(
            fragmenter.split(&message(1_001)),
            Err(CodecError::TooLong { .. })
        ));

        let big = Fragmenter::new(100, 1 << 20).split(&message(2_000)).expect("split");
        let mut r = Reassembler::new(8, 1_000, Duration::from_secs(5));
        assert!(matches!(r.insert(&big[0]), Err(CodecError::TooLong { .. })));
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let mut r = reassembler();
        assert_eq!(r.insert(b"XX").err(), Some(CodecError::BadMagic));

        let mut d = Fragmenter::new(100, 1 << 20).split(b"abc").expect("split").remove(0);
        // index 1 of 1
        d[20] = 1;
        assert_eq!(
            r.insert(&d).err(),
            Some(CodecError::Inconsistent("fragment index"))
        );
    }
}
