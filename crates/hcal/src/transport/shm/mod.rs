// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared memory channel: zero-copy payload transport between processes on
//! the same host.
//!
//! # Architecture
//!
//! ```text
//! +------------------+                         +------------------+
//! |   Process A      |   control + data (mmap) |   Process B      |
//! |   Publisher      |                         |   Subscriber     |
//! |       |          |                         |       ^          |
//! |       v          |   NamedLock (flock)     |       |          |
//! |  ChannelWriter --+-------------------------+-> ChannelReader  |
//! +------------------+   futex wake / ack      +------------------+
//! ```
//!
//! One channel exists per (topic name, domain). Writers of the same topic
//! share it and serialize through the named lock. The data object grows
//! (never shrinks) when a payload outgrows it; readers follow the
//! generation counter in the control object.
//!
//! # Key Features
//!
//! - **Zero-copy**: [`PayloadWriter`] serializes straight into the mapping;
//!   [`ChannelReader::read_with`] lends the mapped bytes to a closure
//! - **In-place updates**: `write_modified` patches the previous payload
//! - **Back-pressure**: optional acknowledge handshake with a timeout
//! - **Torn read detection**: seqlock per slot, counted in [`ShmMetrics`]

mod arena;
mod broadcast;
mod channel;
mod futex;
mod layout;
mod link;
mod lock;
mod metrics;
mod payload;
mod segment;

pub use arena::{ChannelArena, WriterHandle};
pub use broadcast::{ShmBroadcastQueue, BROADCAST_SLOT_SIZE};
pub use channel::{
    ChannelOptions, ChannelReader, ChannelWriter, SampleInfo, ShmSample, WriteMode, WriteParams,
    WriteReport,
};
pub use futex::{futex_wait, futex_wake_all, WaitOutcome};
pub use link::{announcement, ShmLayerReader, ShmLayerWriter};
pub use lock::{NamedLock, NamedLockGuard};
pub use metrics::{ShmMetrics, ShmMetricsSnapshot};
pub use payload::{BytesPayload, PayloadWriter};
pub use segment::{Opened, ShmSegment};

use std::fmt;
use std::io;

/// Errors raised by shared memory operations.
#[derive(Debug)]
pub enum ShmError {
    /// Shared memory object creation failed
    SegmentCreate(io::Error),

    /// Shared memory object open failed
    SegmentOpen(io::Error),

    /// Memory mapping failed
    Mmap(io::Error),

    /// Object does not exist (or is not sized yet)
    NotFound(String),

    /// Name rejected by the naming rules
    InvalidName(String),

    /// Existing object is smaller than required
    SizeMismatch { expected: usize, actual: usize },

    /// Writer lock not acquired in time
    LockTimeout(String),

    /// Header magic or version mismatch
    Corruption,

    /// Payload writer refused to fill the buffer
    WriteAborted,

    /// Payload larger than the fixed slot size (broadcast queue)
    PayloadTooLarge { size: usize, capacity: usize },
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "Shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "Shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "Memory mapping failed: {e}"),
            Self::NotFound(name) => write!(f, "Segment not found: {name}"),
            Self::InvalidName(name) => write!(f, "Invalid segment name: {name}"),
            Self::SizeMismatch { expected, actual } => {
                write!(
                    f,
                    "Segment size mismatch: expected at least {expected} bytes, found {actual}"
                )
            }
            Self::LockTimeout(name) => write!(f, "Timed out acquiring writer lock {name}"),
            Self::Corruption => write!(f, "Shared memory header corrupted or incompatible"),
            Self::WriteAborted => write!(f, "Payload writer aborted the write"),
            Self::PayloadTooLarge { size, capacity } => {
                write!(
                    f,
                    "Payload too large: {size} bytes exceeds slot capacity {capacity}"
                )
            }
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for shared memory operations
pub type Result<T> = std::result::Result<T, ShmError>;

/// 64-bit FNV-1a, used to fold topic names into object names.
#[must_use]
pub fn hash_topic(topic: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in topic.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Control object name of the channel for `topic` in `domain`.
///
/// Format: `/hcal_{domain}_t{hash:016x}`. Topic names may contain any
/// character, so they are hashed rather than embedded.
#[must_use]
pub fn channel_name(domain: &str, topic: &str) -> String {
    format!("/hcal_{domain}_t{:016x}", hash_topic(topic))
}

/// Writer lock name of a channel.
#[must_use]
pub fn lock_name(channel: &str) -> String {
    format!("{channel}_lock")
}

/// Data object name for a generation of a channel.
#[must_use]
pub fn data_name(channel: &str, generation: u64) -> String {
    format!("{channel}_g{generation}")
}

/// Registration broadcast queue name for a domain.
#[must_use]
pub fn broadcast_name(domain: &str) -> String {
    format!("/hcal_{domain}_registration")
}

/// True if `pid` names a live process.
pub(crate) fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: kill with signal 0 only performs the permission/existence check
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    // EPERM: process exists but belongs to someone else
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
