// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Worker thread abstraction

use std::io;
use std::panic;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::sync::Condvar;
use crate::sync::Mutex;

/// A latch shared between a worker thread and its owner.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the latch and wakes every waiter. Can be called multiple times.
    pub fn signal(&self) {
        let (stopped, cvar) = &*self.inner;
        *stopped.lock() = true;
        cvar.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleeps for up to `timeout`, returning early with `true` if the latch is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (stopped, cvar) = &*self.inner;
        let (guard, _) = cvar.wait_timeout_while(stopped.lock(), timeout, |stopped| !*stopped);
        *guard
    }
}

/// Wrapper object for creating a worker thread that can be stopped by signaling a [`StopSignal`].
pub struct WorkerThread<T: Send + 'static> {
    worker: Option<(StopSignal, JoinHandle<T>)>,
}

impl<T: Send + 'static> WorkerThread<T> {
    /// Starts a worker thread named `thread_name` running the `thread_func` function.
    ///
    /// The `thread_func` implementation must monitor the provided `StopSignal` and return from
    /// the thread when it is signaled.
    pub fn start<F>(thread_name: impl Into<String>, thread_func: F) -> io::Result<Self>
    where
        F: FnOnce(StopSignal) -> T + Send + 'static,
    {
        let stop = StopSignal::new();
        let thread_stop = stop.clone();
        let thread_handle = thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || thread_func(thread_stop))?;
        Ok(WorkerThread {
            worker: Some((stop, thread_handle)),
        })
    }

    /// Stops the worker thread.
    ///
    /// Returns the value returned by the function running in the thread.
    pub fn stop(mut self) -> T {
        // The internal `Option` is only `None` in a `drop` after `stop`.
        self.stop_internal().expect("invalid worker state")
    }

    /// Signals the thread without joining it.
    pub fn signal(&self) {
        if let Some((stop, _)) = &self.worker {
            stop.signal();
        }
    }

    /// Returns true once the thread function has returned.
    pub fn is_finished(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(true, |(_, handle)| handle.is_finished())
    }

    fn stop_internal(&mut self) -> Option<T> {
        self.worker.take().map(|(stop, thread_handle)| {
            stop.signal();
            match thread_handle.join() {
                Ok(v) => v,
                Err(e) => panic::resume_unwind(e),
            }
        })
    }
}

impl<T: Send + 'static> Drop for WorkerThread<T> {
    /// Stops the thread if the `WorkerThread` is dropped without calling [`stop()`](Self::stop).
    fn drop(&mut self) {
        let _ = self.stop_internal();
    }
}
