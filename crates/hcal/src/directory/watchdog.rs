// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Directory expiry thread.
//!
//! Sweeps the directory once per period; entries not refreshed within the
//! registration timeout are removed and reported as expired.

use super::Directory;
use crate::worker::WorkerThread;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(50);

/// Background sweeper of one directory. Stops on drop.
#[derive(Debug)]
pub struct Watchdog {
    _worker: WorkerThread,
}

impl Watchdog {
    /// Sweep `directory` every `period` until dropped.
    pub fn start(directory: Arc<Directory>, period: Duration) -> std::io::Result<Self> {
        let worker = WorkerThread::spawn("dir-watchdog", move |shutdown| {
            let mut next = Instant::now() + period;
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(POLL.min(period));
                if Instant::now() < next {
                    continue;
                }
                next += period;
                let removed = directory.sweep();
                if removed > 0 {
                    log::debug!("[DIR] watchdog expired {} entries", removed);
                }
            }
        })?;
        Ok(Self { _worker: worker })
    }
}
