// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named background thread with a shutdown flag.
//!
//! Automatically shuts down and joins the thread on Drop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub(crate) struct WorkerThread {
    name: String,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawn `hcal-<name>` running `body` until it returns.
    ///
    /// `body` receives the shutdown flag and must poll it at least every
    /// few hundred milliseconds.
    pub(crate) fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(&AtomicBool) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread_name = format!("hcal-{name}");
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || body(&flag))?;
        Ok(Self {
            name: thread_name,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Raise the shutdown flag without waiting.
    pub(crate) fn signal(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Raise the shutdown flag and join.
    pub(crate) fn stop(&mut self) {
        self.signal();
        let Some(handle) = self.handle.take() else {
            return;
        };
        // Dropped from inside its own body (e.g. a callback releasing its
        // owner): the loop exits on the flag, nothing to join.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            log::error!("[hcal] thread {} panicked", self.name);
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("name", &self.name)
            .field("running", &self.handle.is_some())
            .finish()
    }
}
