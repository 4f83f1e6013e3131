// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-process writer lock bound to a channel name.
//!
//! A zero-length shared memory object is opened per channel and locked with
//! `flock(LOCK_EX)`. Locks belong to the open file description, so two
//! handles in the same process exclude each other just like two processes.
//! The kernel drops the lock when its holder dies.

use super::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::time::{Duration, Instant};

/// Named exclusive lock.
#[derive(Debug)]
pub struct NamedLock {
    fd: libc::c_int,
    name: String,
}

impl NamedLock {
    /// Open (or create) the lock object `name`.
    pub fn open(name: &str) -> Result<Self> {
        if !name.starts_with('/') || name.len() > 255 {
            return Err(ShmError::InvalidName(name.to_string()));
        }
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;
        // SAFETY: c_name is a valid NUL-terminated string, flags and mode are valid
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(ShmError::SegmentOpen(io::Error::last_os_error()));
        }
        Ok(Self {
            fd,
            name: name.to_string(),
        })
    }

    /// Acquire the lock, retrying until `timeout` elapses.
    pub fn lock(&self, timeout: Duration) -> Result<NamedLockGuard<'_>> {
        let deadline = Instant::now() + timeout;
        loop {
            // SAFETY: self.fd is a valid descriptor owned by this struct
            let ret = unsafe { libc::flock(self.fd, libc::LOCK_EX | libc::LOCK_NB) };
            if ret == 0 {
                return Ok(NamedLockGuard { lock: self });
            }
            let err = io::Error::last_os_error();
            let busy = err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.kind() == io::ErrorKind::Interrupted;
            if !busy {
                return Err(ShmError::SegmentOpen(err));
            }
            if Instant::now() >= deadline {
                return Err(ShmError::LockTimeout(self.name.clone()));
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    /// Remove the lock object name.
    pub fn unlink(&self) {
        let _ = super::segment::ShmSegment::unlink(&self.name);
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        // SAFETY: fd is owned and closed once; closing releases any held flock
        unsafe { libc::close(self.fd) };
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct NamedLockGuard<'a> {
    lock: &'a NamedLock,
}

impl Drop for NamedLockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: fd is valid for the lifetime of the borrowed NamedLock
        unsafe { libc::flock(self.lock.fd, libc::LOCK_UN) };
    }
}
