// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Thread groups for long-lived background tasks.

use std::fmt;
use std::io;
use std::mem::drop;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::error;

////////////////////////////////////////////////////////////////////////
// THREAD GROUPS                                                      //
////////////////////////////////////////////////////////////////////////

/// A group of threads managed together.
///
/// A `ThreadGroup` tracks a number of long-lived threads (see
/// [`ThreadGroup::start`]) so that they can be shut down together.
/// Once shutdown is initiated through [`ThreadGroup::shut_down`], no
/// new threads may be started, and [`ThreadGroup::await_shutdown`] can
/// be used to wait until every thread has exited.
///
/// Threads that spend most of their life sleeping between ticks (such
/// as the maintenance loops) should sleep through
/// [`ThreadGroup::shutdown_wait`] rather than [`thread::sleep`]: the
/// former is woken as soon as shutdown is initiated, so a loop with a
/// long tick interval still exits promptly.
pub struct ThreadGroup {
    records: Mutex<GroupRecords>,

    /// Allows threads to wait for group shutdown events. Used with the
    /// `records` mutex; all waiting threads are notified when shutdown
    /// is initiated and when it is complete.
    shutdown_wakeup: Condvar,
}

/// The internal records of a [`ThreadGroup`].
#[derive(Default)]
struct GroupRecords {
    thread_count: usize,
    shutting_down: bool,
}

impl ThreadGroup {
    /// Creates a new thread group.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(GroupRecords::default()),
            shutdown_wakeup: Condvar::new(),
        })
    }

    /// Starts a thread in the `ThreadGroup`. The thread executes `task`
    /// once; it is not restarted, even if it panics.
    pub fn start<F>(self: &Arc<Self>, name: Option<String>, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut records = self.records.lock().unwrap();
        if records.shutting_down {
            return Err(Error::ShuttingDown);
        }

        records.thread_count += 1;
        let handle = ThreadHandle {
            group: self.clone(),
            parent: thread::current().id(),
        };
        let result = thread::Builder::new()
            .name(name.unwrap_or_else(|| "anonymous".to_owned()))
            .spawn(move || {
                task();
                drop(handle);
            });
        if result.is_err() {
            records.thread_count -= 1;
        }
        result.map_err(Into::into).and(Ok(()))
    }

    /// Shuts down the `ThreadGroup`, waking any thread blocked in
    /// [`ThreadGroup::shutdown_wait`].
    pub fn shut_down(&self) {
        let mut records = self.records.lock().unwrap();
        records.shutting_down = true;
        self.shutdown_wakeup.notify_all();
    }

    /// Waits for the `ThreadGroup` to shut down. This is defined as (1)
    /// shutdown having been initiated and (2) the thread count having
    /// dropped to zero. Calling this from a thread within the group
    /// deadlocks, since the thread count can then never become zero.
    pub fn await_shutdown(&self) {
        let records = self.records.lock().unwrap();
        let _guard = self
            .shutdown_wakeup
            .wait_while(records, |r| !r.shutting_down || r.thread_count > 0)
            .unwrap();
    }

    /// Returns whether the `ThreadGroup` is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.records.lock().unwrap().shutting_down
    }

    /// Sleeps for up to `timeout`, returning early if the group begins
    /// shutting down. Returns whether the group is shutting down.
    pub fn shutdown_wait(&self, timeout: Duration) -> bool {
        let records = self.records.lock().unwrap();
        let (records, _) = self
            .shutdown_wakeup
            .wait_timeout_while(records, timeout, |r| !r.shutting_down)
            .unwrap();
        records.shutting_down
    }
}

/// A handle owned by each thread in a group. When dropped (when the
/// thread exits or panics), it performs the necessary clean-up.
struct ThreadHandle {
    group: Arc<ThreadGroup>,
    parent: ThreadId,
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        let current_thread = thread::current();

        // If we are being dropped in the parent thread, the new thread
        // failed to start on the OS level, and ThreadGroup::start does
        // the clean-up itself. This matters: otherwise we would lock
        // the records mutex twice from the same thread.
        if current_thread.id() == self.parent {
            return;
        }

        if thread::panicking() {
            let thread_name = current_thread.name().unwrap_or("anonymous");
            error!("Thread {} panicked", thread_name);
        }

        let mut records = self.group.records.lock().unwrap();
        end_thread(&mut records, &self.group.shutdown_wakeup);
    }
}

/// Performs clean-up actions when a thread exits.
fn end_thread(records: &mut MutexGuard<GroupRecords>, shutdown_wakeup: &Condvar) {
    records.thread_count -= 1;
    if records.shutting_down && records.thread_count == 0 {
        shutdown_wakeup.notify_all();
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for [`ThreadGroup`] operations.
#[derive(Debug)]
pub enum Error {
    /// An OS-level error occurred during the creation of a thread.
    Io(io::Error),

    /// The [`ThreadGroup`] is shutting down.
    ShuttingDown,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::ShuttingDown => f.write_str("thread group is shutting down"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
