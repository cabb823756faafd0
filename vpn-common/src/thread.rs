// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle handling for long running worker threads.

use crate::lock;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

/// Status of a managed worker thread.
#[derive(Debug)]
pub enum WorkerState {
    /// Worker has not been started yet.
    Ready,
    /// Worker is running with the given handle.
    Running(JoinHandle<()>),
}

impl WorkerState {
    pub fn is_ready(&self) -> bool {
        matches!(self, WorkerState::Ready)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, WorkerState::Running(_))
    }
}

/// A worker thread bundled with its stop flag. Dropping a `ManagedThread`
/// raises the flag and joins the thread, so the thread body must poll
/// [`ManagedThread::stop_flag`] at a bounded interval.
///
/// Not `Clone`: wrap it in an `Arc` if it must be shared so that the join
/// happens exactly once.
#[derive(Debug)]
pub struct ManagedThread {
    state: Mutex<WorkerState>,
    stop: Arc<AtomicBool>,
}

impl ManagedThread {
    pub fn new() -> Self {
        ManagedThread {
            state: Mutex::new(WorkerState::Ready),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn `f` on a named thread. The closure receives the stop flag it
    /// is expected to watch. Starting an already running thread is a no-op.
    pub fn spawn<F>(&self, name: String, f: F) -> std::io::Result<()>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let mut state = lock!(self.state);
        if !state.is_ready() {
            return Ok(());
        }
        let stop = self.stop.clone();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || f(stop))?;
        *state = WorkerState::Running(handle);
        Ok(())
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        lock!(self.state).is_running()
    }

    /// Ask the thread to stop without waiting for it.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for ManagedThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        let mut state = lock!(self.state);
        if let WorkerState::Running(handle) =
            std::mem::replace(&mut *state, WorkerState::Ready)
        {
            drop(state);
            let _ = handle.join();
        }
    }
}

impl Default for ManagedThread {
    fn default() -> Self {
        Self::new()
    }
}
