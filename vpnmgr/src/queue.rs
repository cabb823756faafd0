// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A key-partitioned work queue.
//!
//! Jobs enqueued under the same key run one at a time in submission order.
//! Jobs under different keys run in parallel on a fixed set of worker
//! threads. A key is "scheduled" from the moment its first job is queued
//! until its queue drains, and only a scheduled key sits in the ready
//! channel, so at most one worker ever holds a given key.

use crate::error::Error;
use crate::log::queue_log;
use slog::Logger;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use vpn_common::lock;
use vpn_common::thread::ManagedThread;

/// How often an idle worker checks whether it should stop.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A job may run more than once, so it is `FnMut`.
pub type Job = Box<dyn FnMut() -> Result<(), Error> + Send + 'static>;

struct QueuedJob {
    name: String,
    job: Job,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<QueuedJob>>,
    scheduled: HashSet<String>,
    pending: usize,
}

struct Shared {
    state: Mutex<QueueState>,
    ready_tx: Mutex<Sender<String>>,
    ready_rx: Mutex<Receiver<String>>,
    idle: Condvar,
    max_retries: u32,
    log: Logger,
}

pub struct JobCoordinator {
    shared: Arc<Shared>,
    workers: Vec<ManagedThread>,
}

impl JobCoordinator {
    pub fn new(
        workers: usize,
        max_retries: u32,
        log: Logger,
    ) -> Result<Self, Error> {
        let (tx, rx) = channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            ready_tx: Mutex::new(tx),
            ready_rx: Mutex::new(rx),
            idle: Condvar::new(),
            max_retries,
            log,
        });

        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers.max(1) {
            let t = ManagedThread::new();
            let shared = shared.clone();
            t.spawn(format!("vpnmgr-worker-{i}"), move |stop| loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let next =
                    lock!(shared.ready_rx).recv_timeout(WORKER_POLL_INTERVAL);
                match next {
                    Ok(key) => shared.run_next(&key),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
            threads.push(t);
        }

        Ok(Self {
            shared,
            workers: threads,
        })
    }

    /// Queue `job` behind every job already queued under `key`.
    pub fn enqueue<F>(&self, key: &str, name: &str, job: F)
    where
        F: FnMut() -> Result<(), Error> + Send + 'static,
    {
        self.shared.enqueue(key, name, Box::new(job));
    }

    /// A handle for queueing jobs from inside other jobs. It does not keep
    /// the workers alive.
    pub fn sender(&self) -> JobSender {
        JobSender {
            shared: self.shared.clone(),
        }
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        lock!(self.shared.state).pending
    }

    /// Wait until nothing is queued or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock!(self.shared.state);
        while state.pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .idle
                .wait_timeout(state, deadline - now)
                .expect("queue idle wait")
                .0;
        }
        true
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

#[derive(Clone)]
pub struct JobSender {
    shared: Arc<Shared>,
}

impl JobSender {
    pub fn enqueue<F>(&self, key: &str, name: &str, job: F)
    where
        F: FnMut() -> Result<(), Error> + Send + 'static,
    {
        self.shared.enqueue(key, name, Box::new(job));
    }
}

impl Shared {
    fn enqueue(&self, key: &str, name: &str, job: Job) {
        let mut state = lock!(self.state);
        state
            .queues
            .entry(key.to_string())
            .or_default()
            .push_back(QueuedJob {
                name: name.to_string(),
                job,
            });
        state.pending += 1;
        if state.scheduled.insert(key.to_string()) {
            self.schedule(key);
        }
    }

    fn schedule(&self, key: &str) {
        if let Err(e) = lock!(self.ready_tx).send(key.to_string()) {
            queue_log!(self.log, error,
                "ready channel closed";
                "key" => key,
                "error" => format!("{e}")
            );
        }
    }

    fn run_next(&self, key: &str) {
        let next = {
            let mut state = lock!(self.state);
            state.queues.get_mut(key).and_then(|q| q.pop_front())
        };
        let Some(mut queued) = next else {
            self.finish(key, false);
            return;
        };

        let attempts = self.max_retries + 1;
        for attempt in 1..=attempts {
            let result = catch_unwind(AssertUnwindSafe(|| (queued.job)()));
            match result {
                Ok(Ok(())) => break,
                Ok(Err(e)) if e.is_retryable() && attempt < attempts => {
                    queue_log!(self.log, warn,
                        "job failed, retrying";
                        "key" => key,
                        "job" => &queued.name,
                        "attempt" => attempt,
                        "error" => format!("{e}")
                    );
                }
                Ok(Err(e)) => {
                    queue_log!(self.log, error,
                        "job failed";
                        "key" => key,
                        "job" => &queued.name,
                        "attempt" => attempt,
                        "kind" => format!("{:?}", e.kind()),
                        "error" => format!("{e}")
                    );
                    break;
                }
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    queue_log!(self.log, error,
                        "job panicked";
                        "key" => key,
                        "job" => &queued.name,
                        "attempt" => attempt,
                        "panic" => msg
                    );
                    if attempt == attempts {
                        break;
                    }
                }
            }
        }

        self.finish(key, true);
    }

    /// Reschedule `key` if more work arrived for it, otherwise retire it.
    fn finish(&self, key: &str, ran: bool) {
        let mut state = lock!(self.state);
        if ran {
            state.pending -= 1;
        }
        let more = state.queues.get(key).is_some_and(|q| !q.is_empty());
        if more {
            self.schedule(key);
        } else {
            state.queues.remove(key);
            state.scheduled.remove(key);
        }
        if state.pending == 0 {
            self.idle.notify_all();
        }
    }
}

impl Drop for JobCoordinator {
    fn drop(&mut self) {
        for w in &self.workers {
            w.signal_stop();
        }
        // dropping each ManagedThread joins it
        self.workers.clear();
    }
}
