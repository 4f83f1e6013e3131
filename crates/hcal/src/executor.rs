// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-size job pool.
//!
//! Asynchronous user callbacks (service responses, session and layer
//! events) and server method handlers are queued here, never run on the
//! thread that produced them. Jobs are taken FIFO by `size` workers named
//! `hcal-<name>-<n>`.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool fed through an unbounded crossbeam channel.
pub struct Executor {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    completed: Arc<AtomicU64>,
}

impl Executor {
    /// Start `size` workers (at least one).
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let completed = Arc::new(AtomicU64::new(0));
        let mut workers = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            let rx: Receiver<Job> = rx.clone();
            let done = Arc::clone(&completed);
            let handle = thread::Builder::new()
                .name(format!("hcal-{name}-{index}"))
                .spawn(move || {
                    for job in rx.iter() {
                        job();
                        done.fetch_add(1, Ordering::Relaxed);
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            completed,
        })
    }

    /// Queue `job`. Returns false once the pool is shut down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Jobs finished so far.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stop accepting jobs, drain the queue and join the workers.
    ///
    /// A worker calling this on its own pool is not joined.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("[hcal] {} worker panicked", self.name);
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.name)
            .field("size", &self.size())
            .field("completed", &self.completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_off_caller_thread() {
        let pool = Executor::new("test-pool", 2).expect("pool");
        let (tx, rx) = bounded(1);
        let caller = thread::current().id();
        assert!(pool.submit(move || {
            let _ = tx.send(thread::current().id());
        }));
        let worker = rx.recv_timeout(Duration::from_secs(1)).expect("ran");
        assert_ne!(worker, caller);
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let pool = Executor::new("test-drain", 1).expect("pool");
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..20 {
            let c = Arc::clone(&counter);
            pool.submit(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 20);
        assert!(!pool.submit(|| {}));
    }
}
