// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Named serial work queues multiplexed onto a worker thread pool.
//!
//! A [`Domain`] owns the worker threads and a timer thread. Queues are
//! created lazily by name. At most one job of a queue runs at a time while
//! different queues run in parallel up to the pool size.
//!
//! ```ignore
//! let domain = Domain::new("ima", 4)?;
//! domain.post("broadcast", move || send_to_peers())?;
//! let id = domain.repeat("tracking", move || check_mined(), Duration::from_secs(90))?;
//! domain.stop(id);
//! ```

mod domain;
mod timer;

use domain::DomainCore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use timer::Timers;
use tracing::{info, warn};

pub type QueueId = String;

/// Scheduling weight of a queue. Smaller values get more turns.
pub type Priority = u64;

pub mod priority {
    use super::Priority;

    pub const GOD: Priority = 0;
    pub const BELOW_GOD: Priority = 1;
    pub const ABSOLUTE: Priority = 10;
    pub const HIGHEST: Priority = 100;
    pub const HIGH: Priority = 1_000;
    pub const NORMAL: Priority = 10_000;
    pub const LOW: Priority = 100_000;
    pub const LOWEST: Priority = 1_000_000;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatch domain is shut down")]
    ShutDown,
    #[error("queue {0:?} was removed")]
    QueueRemoved(String),
    #[error("job on queue {queue:?} panicked: {message}")]
    JobPanicked { queue: String, message: String },
    #[error("repeat interval must be positive")]
    ZeroInterval,
    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(String),
}

/// Called with the queue id and panic message whenever a job panics.
pub type ExceptionHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStats {
    pub id: QueueId,
    pub priority: Priority,
    pub pending_jobs: usize,
    pub is_running: bool,
}

struct Shared {
    core: DomainCore,
    timers: Timers,
}

/// Cloneable handle for submitting work to a [`Domain`].
#[derive(Clone)]
pub struct DispatchHandle {
    shared: Arc<Shared>,
}

impl DispatchHandle {
    pub fn name(&self) -> &str {
        &self.shared.core.name
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.core.is_shutting_down()
    }

    /// Creates the queue if it does not exist yet. An existing queue keeps its priority.
    pub fn add(&self, queue_id: &str, priority: Option<Priority>) {
        self.shared
            .core
            .add(queue_id, priority.unwrap_or(priority::NORMAL));
    }

    /// Drops the queue, its pending jobs and its delayed or periodic jobs.
    /// A running job finishes normally.
    pub fn remove(&self, queue_id: &str) -> bool {
        let timers = self.shared.timers.cancel_queue(queue_id);
        self.shared.core.remove(queue_id) || timers > 0
    }

    pub fn remove_all(&self) {
        self.shared.timers.clear();
        self.shared.core.remove_all();
    }

    /// Returns the queue state, creating the queue on first reference.
    pub fn get(&self, queue_id: &str) -> QueueStats {
        self.shared.core.stats(queue_id)
    }

    pub fn queue_names(&self) -> Vec<QueueId> {
        self.shared.core.queue_names()
    }

    pub fn set_exception_hook(&self, hook: ExceptionHook) {
        self.shared.core.set_exception_hook(hook);
    }

    /// Runs `job` once on the queue as soon as it gets a turn.
    pub fn post<F>(&self, queue_id: &str, job: F) -> Result<JobId, DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.shared.core.next_job_id();
        self.shared.core.enqueue(queue_id, id, Box::new(job))?;
        Ok(id)
    }

    /// Runs `job` once after `delay`.
    pub fn once<F>(&self, queue_id: &str, job: F, delay: Duration) -> Result<JobId, DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        if delay.is_zero() {
            return self.post(queue_id, job);
        }
        self.ensure_running()?;
        self.add(queue_id, None);
        let id = self.shared.core.next_job_id();
        self.shared
            .timers
            .schedule_once(queue_id, id, Box::new(job), Instant::now() + delay);
        Ok(id)
    }

    /// Runs `job` every `interval`, the first time after one interval.
    pub fn repeat<F>(&self, queue_id: &str, job: F, interval: Duration) -> Result<JobId, DispatchError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(DispatchError::ZeroInterval);
        }
        self.async_job(queue_id, job, interval, interval)
    }

    /// General form: first run after `delay`, then every `repeat_interval`
    /// when it is non-zero. A periodic tick is skipped while the previous run
    /// is still queued or running.
    pub fn async_job<F>(
        &self,
        queue_id: &str,
        job: F,
        delay: Duration,
        repeat_interval: Duration,
    ) -> Result<JobId, DispatchError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if repeat_interval.is_zero() {
            return self.once(queue_id, move || job(), delay);
        }
        self.ensure_running()?;
        self.add(queue_id, None);
        let id = self.shared.core.next_job_id();
        self.shared.timers.schedule_repeat(
            queue_id,
            id,
            Arc::new(job),
            Instant::now() + delay,
            repeat_interval,
        );
        Ok(id)
    }

    /// Runs `job` on the calling thread while holding the queue, so it never
    /// overlaps another job of that queue. Blocks until every job queued
    /// before the call has run. Called from inside a job of the same queue it
    /// runs inline.
    pub fn sync<R>(&self, queue_id: &str, job: impl FnOnce() -> R) -> Result<R, DispatchError> {
        self.shared.core.sync(queue_id, job)
    }

    /// Cancels a delayed or periodic job, or a queued job that has not started.
    /// Returns false when nothing was cancelled, e.g. the job already ran.
    pub fn stop(&self, id: JobId) -> bool {
        let timer = self.shared.timers.cancel(id);
        let queued = self.shared.core.cancel_queued(id);
        timer || queued
    }

    fn ensure_running(&self) -> Result<(), DispatchError> {
        if self.is_shut_down() {
            return Err(DispatchError::ShutDown);
        }
        Ok(())
    }
}

/// Owner of the worker and timer threads. Dropping it shuts the domain down.
pub struct Domain {
    handle: DispatchHandle,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Domain {
    pub fn new(name: &str, worker_count: usize) -> Result<Self, DispatchError> {
        let shared = Arc::new(Shared {
            core: DomainCore::new(name),
            timers: Timers::default(),
        });
        let domain = Self {
            handle: DispatchHandle {
                shared: shared.clone(),
            },
            threads: Mutex::new(Vec::new()),
        };
        let worker_count = worker_count.max(1);
        for i in 0..worker_count {
            let shared = shared.clone();
            domain.spawn(format!("{}-worker-{}", name, i), move || {
                shared.core.worker_loop()
            })?;
        }
        let timer_shared = shared;
        domain.spawn(format!("{}-timer", name), move || {
            timer_shared.timers.timer_loop(&timer_shared.core)
        })?;
        info!(domain = name, worker_count, "Dispatch domain started");
        Ok(domain)
    }

    fn spawn(
        &self,
        thread_name: String,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), DispatchError> {
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(f)
            .map_err(|e| DispatchError::Spawn(e.to_string()))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Stops accepting work, drops pending jobs and timers, and joins the
    /// threads. Jobs already running finish first.
    pub fn shutdown(&self) {
        let shared = &self.handle.shared;
        if shared
            .core
            .shutting_down
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        shared.core.wake_all();
        shared.timers.wake();
        let me = std::thread::current().id();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for t in threads {
            if t.thread().id() == me {
                continue;
            }
            if t.join().is_err() {
                warn!(domain = self.handle.name(), "Dispatch thread exited with a panic");
            }
        }
        shared.timers.clear();
        shared.core.remove_all();
        info!(domain = self.handle.name(), "Dispatch domain shut down");
    }
}

impl std::ops::Deref for Domain {
    type Target = DispatchHandle;

    fn deref(&self) -> &DispatchHandle {
        &self.handle
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.shutdown();
    }
}
