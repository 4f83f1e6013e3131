// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Futex wait/wake on words living in shared memory.
//!
//! Uses the SHARED operations (`FUTEX_WAIT` = 0, `FUTEX_WAKE` = 1). The
//! `_PRIVATE` variants never wake a waiter in another process.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken (or spurious wakeup)
    Woken,
    /// Word no longer held the expected value
    Changed,
    /// Timeout elapsed
    TimedOut,
}

#[cfg(target_os = "linux")]
const FUTEX_WAIT: libc::c_int = 0;
#[cfg(target_os = "linux")]
const FUTEX_WAKE: libc::c_int = 1;

/// Block while `word == expected`, up to `timeout` (`None` = forever).
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);

    // SAFETY:
    // - word is a live reference, so the address stays valid for the call
    // - AtomicU32 has the same layout as u32, as the syscall expects
    // - ts_ptr is null or points to a timespec on this stack frame
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0i32,
        )
    };
    if ret == 0 {
        return WaitOutcome::Woken;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => WaitOutcome::Changed,
        Some(libc::ETIMEDOUT) => WaitOutcome::TimedOut,
        _ => WaitOutcome::Woken,
    }
}

/// Wake every waiter blocked on `word`.
#[cfg(target_os = "linux")]
pub fn futex_wake_all(word: &AtomicU32) -> i32 {
    // SAFETY:
    // - word is a live reference to an aligned u32-sized atomic
    // - FUTEX_WAKE ignores the timeout, uaddr2 and val3 arguments
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

// Other platforms poll with a short sleep.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    use std::sync::atomic::Ordering;
    if word.load(Ordering::Acquire) != expected {
        return WaitOutcome::Changed;
    }
    let nap = timeout
        .unwrap_or(Duration::from_millis(1))
        .min(Duration::from_millis(1));
    std::thread::sleep(nap);
    if word.load(Ordering::Acquire) != expected {
        WaitOutcome::Woken
    } else {
        WaitOutcome::TimedOut
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake_all(_word: &AtomicU32) -> i32 {
    0
}
