// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Memory layout of a shared memory channel.
//!
//! A channel is two objects:
//!
//! ```text
//! control  /hcal_<domain>_t<hash>        (fixed size, lives as long as the channel)
//! +-----------------------------------+
//! | ChannelHeader (128 B)             |
//! | ReaderSlot[MAX_READERS] (64 B ea) |
//! +-----------------------------------+
//!
//! data     /hcal_<domain>_t<hash>_g<N>   (replaced when the payload outgrows it)
//! +-----------------------------------+
//! | DataHeader (64 B)                 |
//! | SlotHeader (64 B) | payload ...   |  x buffer_count
//! +-----------------------------------+
//! ```
//!
//! Slot sequence encoding: `clock << 1 | 1` while a write is in progress,
//! `clock << 1` once committed, 0 for a slot never written.
//!
//! Every structure is `repr(C)` and 64-byte aligned; mmap returns page
//! aligned memory so references into a segment are well aligned.

use crate::config::MEMFILE_MAX_READERS;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

pub(crate) const CHANNEL_MAGIC: u32 = 0x4843_414C; // "HCAL"
pub(crate) const DATA_MAGIC: u32 = 0x4843_4144; // "HCAD"
pub(crate) const LAYOUT_VERSION: u32 = 1;

/// Header at offset 0 of the control object.
#[repr(C, align(64))]
pub(crate) struct ChannelHeader {
    pub magic: AtomicU32,
    pub version: u32,
    pub buffer_count: u32,
    _pad0: u32,
    /// Current data object generation (0 = none yet)
    pub generation: AtomicU64,
    /// Clock of the last committed write (0 = none)
    pub write_clock: AtomicU64,
    /// Bumped after each commit; readers futex-wait on it
    pub notify: AtomicU32,
    /// Bumped after each reader acknowledgement; writers futex-wait on it
    pub ack_notify: AtomicU32,
    /// Writer handles attached across all processes
    pub writers: AtomicU32,
    /// Set once the channel names were unlinked
    pub closed: AtomicU32,
    _pad1: [u8; 72],
}

/// Reader registration entry in the control object.
#[repr(C, align(64))]
pub(crate) struct ReaderSlot {
    /// Owner pid, 0 = free
    pub pid: AtomicU32,
    _pad0: u32,
    /// Highest clock this reader has consumed
    pub ack_clock: AtomicU64,
    /// Distinguishes readers of the same process
    pub token: AtomicU64,
    _pad1: [u8; 40],
}

/// Header at offset 0 of a data object.
#[repr(C, align(64))]
pub(crate) struct DataHeader {
    pub magic: AtomicU32,
    pub buffer_count: u32,
    pub generation: u64,
    pub slot_capacity: u64,
    _pad: [u8; 40],
}

/// Per-slot header preceding the payload in a data object.
#[repr(C, align(64))]
pub(crate) struct SlotHeader {
    pub seq: AtomicU64,
    pub len: AtomicU64,
    /// Entity id of the publisher that wrote the slot
    pub writer_id: AtomicU64,
    /// Send time of the sample (microseconds since the Unix epoch)
    pub timestamp: AtomicI64,
    _pad: [u8; 32],
}

pub(crate) const CHANNEL_HEADER_SIZE: usize = std::mem::size_of::<ChannelHeader>();
pub(crate) const READER_SLOT_SIZE: usize = std::mem::size_of::<ReaderSlot>();
pub(crate) const DATA_HEADER_SIZE: usize = std::mem::size_of::<DataHeader>();
pub(crate) const SLOT_HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();

/// Control object size.
pub(crate) const fn control_size() -> usize {
    CHANNEL_HEADER_SIZE + MEMFILE_MAX_READERS * READER_SLOT_SIZE
}

/// Round a payload capacity up to keep slot headers 64-byte aligned.
pub(crate) const fn align_capacity(capacity: usize) -> usize {
    (capacity + 63) & !63
}

/// Data object size for `buffer_count` slots of `slot_capacity` bytes.
pub(crate) const fn data_size(buffer_count: usize, slot_capacity: usize) -> usize {
    DATA_HEADER_SIZE + buffer_count * (SLOT_HEADER_SIZE + slot_capacity)
}

impl ChannelHeader {
    /// Initialize a freshly created (zeroed) control object.
    ///
    /// # Safety
    ///
    /// `base` must point to at least [`control_size`] writable bytes, be
    /// 64-byte aligned and not yet visible to other users of the channel.
    pub(crate) unsafe fn init(base: *mut u8, buffer_count: u32) {
        let header = &mut *base.cast::<ChannelHeader>();
        header.version = LAYOUT_VERSION;
        header.buffer_count = buffer_count;
        // Readers check magic with Acquire before trusting the other fields.
        header.magic.store(CHANNEL_MAGIC, Ordering::Release);
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Acquire) == CHANNEL_MAGIC && self.version == LAYOUT_VERSION
    }
}

impl DataHeader {
    /// Initialize a freshly created data object.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `data_size(buffer_count, slot_capacity)`
    /// writable, 64-byte aligned bytes not yet published to readers.
    pub(crate) unsafe fn init(
        base: *mut u8,
        generation: u64,
        buffer_count: u32,
        slot_capacity: usize,
    ) {
        let header = &mut *base.cast::<DataHeader>();
        header.buffer_count = buffer_count;
        header.generation = generation;
        header.slot_capacity = slot_capacity as u64;
        header.magic.store(DATA_MAGIC, Ordering::Release);
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Acquire) == DATA_MAGIC
    }
}

impl SlotHeader {
    #[inline]
    pub(crate) fn mark_writing(&self, clock: u64) {
        self.seq.store((clock << 1) | 1, Ordering::Relaxed);
        // Keep payload stores after the odd marker.
        std::sync::atomic::fence(Ordering::Release);
    }

    #[inline]
    pub(crate) fn commit(&self, clock: u64) {
        self.seq.store(clock << 1, Ordering::Release);
    }

    #[inline]
    pub(crate) fn load_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}

/// Typed view over a mapped control object.
pub(crate) struct ControlView {
    base: *mut u8,
}

impl ControlView {
    /// # Safety
    ///
    /// `base` must stay mapped with at least [`control_size`] bytes for the
    /// lifetime of the view.
    pub(crate) unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }

    #[inline]
    pub(crate) fn header(&self) -> &ChannelHeader {
        // SAFETY: base is a valid, aligned control mapping (constructor contract)
        unsafe { &*self.base.cast::<ChannelHeader>() }
    }

    #[inline]
    pub(crate) fn reader(&self, index: usize) -> &ReaderSlot {
        debug_assert!(index < MEMFILE_MAX_READERS);
        // SAFETY: index < MEMFILE_MAX_READERS keeps the offset inside control_size()
        unsafe {
            &*self
                .base
                .add(CHANNEL_HEADER_SIZE + index * READER_SLOT_SIZE)
                .cast::<ReaderSlot>()
        }
    }

    pub(crate) fn readers(&self) -> impl Iterator<Item = &ReaderSlot> {
        (0..MEMFILE_MAX_READERS).map(move |i| self.reader(i))
    }
}

/// Typed view over a mapped data object.
pub(crate) struct DataView {
    base: *mut u8,
    buffer_count: usize,
    slot_capacity: usize,
}

impl DataView {
    /// # Safety
    ///
    /// `base` must stay mapped with at least
    /// `data_size(buffer_count, slot_capacity)` bytes for the view's lifetime.
    pub(crate) unsafe fn new(base: *mut u8, buffer_count: usize, slot_capacity: usize) -> Self {
        Self {
            base,
            buffer_count,
            slot_capacity,
        }
    }

    #[inline]
    pub(crate) fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    #[inline]
    pub(crate) fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    #[inline]
    fn slot_offset(&self, index: usize) -> usize {
        DATA_HEADER_SIZE + index * (SLOT_HEADER_SIZE + self.slot_capacity)
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> &SlotHeader {
        debug_assert!(index < self.buffer_count);
        // SAFETY: index < buffer_count keeps the header inside the mapping
        unsafe { &*self.base.add(self.slot_offset(index)).cast::<SlotHeader>() }
    }

    /// Raw payload pointer of slot `index` (`slot_capacity` bytes).
    #[inline]
    pub(crate) fn payload_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.buffer_count);
        // SAFETY: payload follows its header and ends inside the mapping
        unsafe { self.base.add(self.slot_offset(index) + SLOT_HEADER_SIZE) }
    }
}

/// Slot index for a clock.
#[inline]
pub(crate) fn slot_index(clock: u64, buffer_count: usize) -> usize {
    (clock % buffer_count as u64) as usize
}
