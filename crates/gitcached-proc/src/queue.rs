//! Bounded subprocess execution.
//!
//! Every helper process the proxy runs goes through a [`ProcessQueue`],
//! which caps how many run at once. Submissions beyond the cap wait in
//! a FIFO backlog, so a burst of object lookups cannot fork-bomb the
//! host while a pack transfer is in flight.

use std::collections::VecDeque;
use std::io;
use std::process::Output;
use std::sync::Arc;

use parking_lot::Mutex;

use tokio::process::Command;
use tokio::sync::{oneshot, Notify};

/// Snapshot of queue occupancy, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub running: usize,
    pub queued: usize,
}

struct Job {
    label: String,
    command: Command,
    done: oneshot::Sender<io::Result<Output>>,
}

struct State {
    running: usize,
    backlog: VecDeque<Job>,
}

struct Inner {
    limit: usize,
    state: Mutex<State>,
    drained: Notify,
}

/// Runs subprocesses with a fixed concurrency limit.
///
/// Cloning shares the queue; all clones observe the same limit and
/// backlog.
#[derive(Clone)]
pub struct ProcessQueue {
    inner: Arc<Inner>,
}

impl ProcessQueue {
    /// A queue that runs at most `limit` subprocesses concurrently.
    ///
    /// `limit` must be at least 1.
    pub fn new(limit: usize) -> Self {
        assert!(limit >= 1, "process queue limit must be at least 1");
        Self {
            inner: Arc::new(Inner {
                limit,
                state: Mutex::new(State {
                    running: 0,
                    backlog: VecDeque::new(),
                }),
                drained: Notify::new(),
            }),
        }
    }

    /// Submits a command. It starts immediately if a slot is free,
    /// otherwise it waits behind earlier submissions.
    ///
    /// The returned receiver yields the collected output once the
    /// process exits. Dropping the receiver does not cancel the
    /// process; it runs to completion and frees its slot either way.
    pub fn exec(
        &self,
        label: impl Into<String>,
        command: Command,
    ) -> oneshot::Receiver<io::Result<Output>> {
        let (done, rx) = oneshot::channel();
        let job = Job {
            label: label.into(),
            command,
            done,
        };
        {
            let mut state = self.inner.state.lock();
            if state.running >= self.inner.limit {
                tracing::debug!(
                    job = %job.label,
                    queued = state.backlog.len() + 1,
                    "process queue full, job deferred"
                );
                state.backlog.push_back(job);
                return rx;
            }
            state.running += 1;
        }
        launch(Arc::clone(&self.inner), job);
        rx
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            running: state.running,
            queued: state.backlog.len(),
        }
    }

    pub fn is_idle(&self) -> bool {
        let stats = self.stats();
        stats.running == 0 && stats.queued == 0
    }

    /// Resolves once nothing is running and the backlog is empty.
    /// Resolves immediately on an idle queue.
    pub async fn drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

fn launch(inner: Arc<Inner>, mut job: Job) {
    tokio::spawn(async move {
        tracing::debug!(job = %job.label, "process starting");
        let result = job.command.output().await;
        if let Err(error) = &result {
            tracing::warn!(job = %job.label, %error, "process failed to run");
        }
        // Receiver may have lost interest; the slot is freed regardless.
        let _ = job.done.send(result);

        let next = {
            let mut state = inner.state.lock();
            match state.backlog.pop_front() {
                Some(next) => Some(next),
                None => {
                    state.running -= 1;
                    if state.running == 0 {
                        inner.drained.notify_waiters();
                    }
                    None
                }
            }
        };
        if let Some(next) = next {
            launch(inner, next);
        }
    });
}
