// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Many-to-many broadcast queue over one shared memory object.
//!
//! Carries registration datagrams between the processes of a host when
//! discovery runs over shared memory instead of multicast. Every process
//! opens the same object; pushes are serialized by a named lock and every
//! reader sees every message pushed after it opened the queue, unless it
//! falls more than `capacity` messages behind.
//!
//! ```text
//! +------------------------------+
//! | QueueHeader (64 B)           |
//! | SlotHeader | BROADCAST_SLOT  |  x capacity
//! +------------------------------+
//! ```
//!
//! The object is shared by the whole domain and never unlinked implicitly.

use super::futex::{futex_wait, futex_wake_all};
use super::layout::{SlotHeader, SLOT_HEADER_SIZE};
use super::lock::NamedLock;
use super::segment::{Opened, ShmSegment};
use super::{broadcast_name, lock_name, Result, ShmError};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Maximum message size of one queue slot.
pub const BROADCAST_SLOT_SIZE: usize = 16 * 1024;

const QUEUE_MAGIC: u32 = 0x4843_4251; // "HCBQ"

#[repr(C, align(64))]
struct QueueHeader {
    magic: AtomicU32,
    capacity: u32,
    write_clock: AtomicU64,
    notify: AtomicU32,
    _pad: [u8; 44],
}

const QUEUE_HEADER_SIZE: usize = std::mem::size_of::<QueueHeader>();
const SLOT_STRIDE: usize = SLOT_HEADER_SIZE + BROADCAST_SLOT_SIZE;

fn queue_size(capacity: usize) -> usize {
    QUEUE_HEADER_SIZE + capacity * SLOT_STRIDE
}

/// One process's handle on a domain broadcast queue.
pub struct ShmBroadcastQueue {
    segment: ShmSegment,
    lock: NamedLock,
    capacity: usize,
    next_clock: u64,
    lock_timeout: Duration,
}

impl ShmBroadcastQueue {
    /// Open the queue of `domain`, creating it with `capacity` slots.
    ///
    /// An existing queue keeps the capacity it was created with.
    pub fn open(domain: &str, capacity: usize, lock_timeout: Duration) -> Result<Self> {
        let name = broadcast_name(domain);
        let lock = NamedLock::open(&lock_name(&name))?;
        let capacity = capacity.max(1);

        let segment = {
            let _guard = lock.lock(lock_timeout)?;
            let opened = match ShmSegment::open_or_create(&name, queue_size(capacity)) {
                Err(ShmError::SizeMismatch { .. }) => Opened::Existing(ShmSegment::open(&name)?),
                other => other?,
            };
            match opened {
                Opened::Created(segment) => {
                    // SAFETY: new zeroed object of queue_size(capacity) bytes,
                    // initialized under the queue lock
                    let header = unsafe { &mut *segment.as_ptr().cast::<QueueHeader>() };
                    header.capacity = capacity as u32;
                    header.magic.store(QUEUE_MAGIC, Ordering::Release);
                    segment
                }
                Opened::Existing(segment) => segment,
            }
        };

        // SAFETY: the object holds at least one QueueHeader
        let header = unsafe { &*segment.as_ptr().cast::<QueueHeader>() };
        if header.magic.load(Ordering::Acquire) != QUEUE_MAGIC {
            return Err(ShmError::Corruption);
        }
        let capacity = header.capacity as usize;
        if capacity == 0 || segment.size() < queue_size(capacity) {
            return Err(ShmError::Corruption);
        }
        let next_clock = header.write_clock.load(Ordering::Acquire) + 1;

        log::debug!("[SHM] broadcast queue {} opened ({} slots)", name, capacity);
        Ok(Self {
            segment,
            lock,
            capacity,
            next_clock,
            lock_timeout,
        })
    }

    fn header(&self) -> &QueueHeader {
        // SAFETY: validated in open; the mapping lives as long as self
        unsafe { &*self.segment.as_ptr().cast::<QueueHeader>() }
    }

    fn slot(&self, clock: u64) -> (&SlotHeader, *mut u8) {
        let index = (clock % self.capacity as u64) as usize;
        let offset = QUEUE_HEADER_SIZE + index * SLOT_STRIDE;
        // SAFETY: index < capacity keeps the slot inside queue_size(capacity)
        unsafe {
            let base = self.segment.as_ptr().add(offset);
            (&*base.cast::<SlotHeader>(), base.add(SLOT_HEADER_SIZE))
        }
    }

    /// Append a message for every reader of the domain.
    pub fn push(&self, message: &[u8]) -> Result<()> {
        if message.len() > BROADCAST_SLOT_SIZE {
            return Err(ShmError::PayloadTooLarge {
                size: message.len(),
                capacity: BROADCAST_SLOT_SIZE,
            });
        }
        let _guard = self.lock.lock(self.lock_timeout)?;
        let header = self.header();
        let clock = header.write_clock.load(Ordering::Acquire) + 1;
        let (slot, payload) = self.slot(clock);

        slot.mark_writing(clock);
        // SAFETY: payload has BROADCAST_SLOT_SIZE bytes and the queue lock
        // makes this the only writer
        unsafe { std::ptr::copy_nonoverlapping(message.as_ptr(), payload, message.len()) };
        slot.len.store(message.len() as u64, Ordering::Relaxed);
        slot.commit(clock);

        header.write_clock.store(clock, Ordering::Release);
        header.notify.fetch_add(1, Ordering::Release);
        futex_wake_all(&header.notify);
        Ok(())
    }

    /// Next unread message, if any. Messages overwritten before they were
    /// read are skipped.
    pub fn try_pop(&mut self) -> Option<Vec<u8>> {
        loop {
            let head = self.header().write_clock.load(Ordering::Acquire);
            if head < self.next_clock {
                return None;
            }
            let capacity = self.capacity as u64;
            if head - self.next_clock >= capacity {
                let lost = head - self.next_clock - capacity + 1;
                log::debug!("[SHM] broadcast reader overrun, {} messages lost", lost);
                self.next_clock += lost;
            }

            let clock = self.next_clock;
            self.next_clock += 1;
            let (slot, payload) = self.slot(clock);
            let seq = slot.load_seq();
            if seq != clock << 1 {
                continue;
            }
            let len = (slot.len.load(Ordering::Relaxed) as usize).min(BROADCAST_SLOT_SIZE);
            // SAFETY: len <= BROADCAST_SLOT_SIZE inside the mapped slot
            let message = unsafe { std::slice::from_raw_parts(payload, len) }.to_vec();
            fence(Ordering::Acquire);
            if slot.load_seq() != seq {
                continue;
            }
            return Some(message);
        }
    }

    /// Block until a message may be available or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        let header = self.header();
        let observed = header.notify.load(Ordering::Acquire);
        if header.write_clock.load(Ordering::Acquire) >= self.next_clock {
            return true;
        }
        futex_wait(&header.notify, observed, Some(timeout));
        header.write_clock.load(Ordering::Acquire) >= self.next_clock
    }

    /// Remove the queue names of `domain`. Open handles keep working.
    pub fn unlink(domain: &str) {
        let name = broadcast_name(domain);
        let _ = ShmSegment::unlink(&name);
        let _ = ShmSegment::unlink(&lock_name(&name));
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain() -> String {
        format!("b{:08x}", fastrand::u32(..))
    }

    #[test]
    fn test_every_reader_sees_every_message() {
        let d = domain();
        let writer = ShmBroadcastQueue::open(&d, 8, Duration::from_millis(50)).expect("writer");
        let mut r1 = ShmBroadcastQueue::open(&d, 8, Duration::from_millis(50)).expect("r1");
        let mut r2 = ShmBroadcastQueue::open(&d, 8, Duration::from_millis(50)).expect("r2");

        writer.push(b"a").expect("push a");
        r1.push(b"b").expect("push b");

        assert_eq!(r1.try_pop().as_deref(), Some(&b"a"[..]));
        assert_eq!(r1.try_pop().as_deref(), Some(&b"b"[..]));
        assert!(r1.try_pop().is_none());
        assert_eq!(r2.try_pop().as_deref(), Some(&b"a"[..]));
        assert_eq!(r2.try_pop().as_deref(), Some(&b"b"[..]));
        ShmBroadcastQueue::unlink(&d);
    }

    #[test]
    fn test_overrun_skips_to_recent() {
        let d = domain();
        let writer = ShmBroadcastQueue::open(&d, 4, Duration::from_millis(50)).expect("writer");
        let mut reader = ShmBroadcastQueue::open(&d, 4, Duration::from_millis(50)).expect("reader");
        for i in 0..10u8 {
            writer.push(&[i]).expect("push");
        }
        let got: Vec<u8> = std::iter::from_fn(|| reader.try_pop()).map(|m| m[0]).collect();
        assert_eq!(got, vec![6, 7, 8, 9]);
        ShmBroadcastQueue::unlink(&d);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let d = domain();
        let q = ShmBroadcastQueue::open(&d, 2, Duration::from_millis(50)).expect("queue");
        let big = vec![0u8; BROADCAST_SLOT_SIZE + 1];
        assert!(matches!(
            q.push(&big),
            Err(ShmError::PayloadTooLarge { .. })
        ));
        ShmBroadcastQueue::unlink(&d);
    }

    #[test]
    fn test_existing_queue_keeps_capacity() {
        let d = domain();
        let a = ShmBroadcastQueue::open(&d, 4, Duration::from_millis(50)).expect("a");
        let b = ShmBroadcastQueue::open(&d, 2, Duration::from_millis(50)).expect("b");
        assert_eq!(a.capacity(), 4);
        assert_eq!(b.capacity(), 4);
        let c = ShmBroadcastQueue::open(&d, 16, Duration::from_millis(50)).expect("c");
        assert_eq!(c.capacity(), 4);
        ShmBroadcastQueue::unlink(&d);
    }
}
