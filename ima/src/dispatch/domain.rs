// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Queue registry and worker pool of one dispatch domain.
//!
//! Queues are picked with stride scheduling: every queue carries an
//! accumulator that grows by its priority value after each job, and the
//! worker always takes the runnable queue with the smallest accumulator.
//! A queue that was idle restarts from the accumulator of the last picked
//! queue so it cannot bank credit while idle.

use super::{priority, DispatchError, ExceptionHook, JobId, Priority, QueueId, QueueStats};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use tracing::{debug, error};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

const ACCUMULATOR_REBASE_THRESHOLD: u64 = 1 << 62;

struct QueuedJob {
    id: JobId,
    job: Job,
}

struct QueueState {
    priority: Priority,
    accumulator: u64,
    // bumped on every re-creation so a late release of a removed queue is ignored
    generation: u64,
    jobs: VecDeque<QueuedJob>,
    running_on: Option<ThreadId>,
    // jobs ever pushed, and jobs that left the deque by starting or being cancelled
    enqueued: u64,
    dequeued: u64,
    // sync callers in arrival order as (jobs that must leave the deque first, waiter id)
    sync_waiters: VecDeque<(u64, u64)>,
}

impl QueueState {
    fn is_runnable(&self) -> bool {
        !self.jobs.is_empty() && self.running_on.is_none() && !self.is_sync_turn()
    }

    /// The oldest sync caller has every job submitted before it behind it.
    fn is_sync_turn(&self) -> bool {
        self.sync_waiters
            .front()
            .is_some_and(|(ticket, _)| *ticket <= self.dequeued)
    }

    fn is_idle(&self) -> bool {
        self.jobs.is_empty() && self.running_on.is_none()
    }
}

#[derive(Default)]
struct Registry {
    queues: HashMap<QueueId, QueueState>,
    accumulator_base: u64,
    next_generation: u64,
    next_waiter_id: u64,
}

impl Registry {
    fn get_or_create(&mut self, queue_id: &str, priority: Priority) -> &mut QueueState {
        let base = self.accumulator_base;
        let next_generation = &mut self.next_generation;
        self.queues
            .entry(queue_id.to_string())
            .or_insert_with(|| {
                *next_generation += 1;
                debug!(queue = queue_id, priority, "Adding dispatch queue");
                QueueState {
                    priority,
                    accumulator: base,
                    generation: *next_generation,
                    jobs: VecDeque::new(),
                    running_on: None,
                    enqueued: 0,
                    dequeued: 0,
                    sync_waiters: VecDeque::new(),
                }
            })
    }

    fn pick_runnable(&mut self, me: ThreadId) -> Option<(QueueId, u64, QueuedJob)> {
        let queue_id = self
            .queues
            .iter()
            .filter(|(_, q)| q.is_runnable())
            .min_by(|(a_id, a), (b_id, b)| {
                (a.accumulator, a.priority, a_id.as_str()).cmp(&(
                    b.accumulator,
                    b.priority,
                    b_id.as_str(),
                ))
            })
            .map(|(id, _)| id.clone())?;
        let q = self.queues.get_mut(&queue_id)?;
        let job = q.jobs.pop_front()?;
        q.dequeued += 1;
        q.running_on = Some(me);
        self.accumulator_base = q.accumulator;
        Some((queue_id, q.generation, job))
    }

    fn release(&mut self, queue_id: &str, generation: u64) {
        let rebase = match self.queues.get_mut(queue_id) {
            Some(q) if q.generation == generation => {
                q.running_on = None;
                q.accumulator = q.accumulator.saturating_add(q.priority);
                q.accumulator > ACCUMULATOR_REBASE_THRESHOLD
            }
            _ => false,
        };
        if rebase {
            let min = self
                .queues
                .values()
                .map(|q| q.accumulator)
                .min()
                .unwrap_or(0);
            for q in self.queues.values_mut() {
                q.accumulator -= min;
            }
            self.accumulator_base = self.accumulator_base.saturating_sub(min);
        }
    }
}

pub(crate) struct DomainCore {
    pub(crate) name: String,
    registry: Mutex<Registry>,
    // signalled whenever a job arrives or a queue is released
    changed: Condvar,
    next_job_id: AtomicU64,
    pub(crate) shutting_down: AtomicBool,
    exception_hook: RwLock<Option<ExceptionHook>>,
}

impl DomainCore {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            registry: Mutex::new(Registry::default()),
            changed: Condvar::new(),
            next_job_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            exception_hook: RwLock::new(None),
        }
    }

    pub(crate) fn next_job_id(&self) -> JobId {
        JobId(self.next_job_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn set_exception_hook(&self, hook: ExceptionHook) {
        *self.exception_hook.write() = Some(hook);
    }

    pub(crate) fn add(&self, queue_id: &str, priority: Priority) {
        self.registry.lock().get_or_create(queue_id, priority);
    }

    pub(crate) fn remove(&self, queue_id: &str) -> bool {
        let removed = self.registry.lock().queues.remove(queue_id);
        match removed {
            Some(q) => {
                debug!(
                    queue = queue_id,
                    dropped_jobs = q.jobs.len(),
                    "Removed dispatch queue"
                );
                // wake sync callers waiting on this queue
                self.changed.notify_all();
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_all(&self) {
        self.registry.lock().queues.clear();
        self.changed.notify_all();
    }

    pub(crate) fn stats(&self, queue_id: &str) -> QueueStats {
        let mut registry = self.registry.lock();
        let q = registry.get_or_create(queue_id, priority::NORMAL);
        QueueStats {
            id: queue_id.to_string(),
            priority: q.priority,
            pending_jobs: q.jobs.len(),
            is_running: q.running_on.is_some(),
        }
    }

    pub(crate) fn queue_names(&self) -> Vec<QueueId> {
        let mut names: Vec<_> = self.registry.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn enqueue(&self, queue_id: &str, id: JobId, job: Job) -> Result<(), DispatchError> {
        if self.is_shutting_down() {
            return Err(DispatchError::ShutDown);
        }
        {
            let mut registry = self.registry.lock();
            let base = registry.accumulator_base;
            let q = registry.get_or_create(queue_id, priority::NORMAL);
            if q.is_idle() {
                q.accumulator = q.accumulator.max(base);
            }
            q.jobs.push_back(QueuedJob { id, job });
            q.enqueued += 1;
        }
        self.changed.notify_all();
        Ok(())
    }

    /// Drops a queued, not yet started job.
    pub(crate) fn cancel_queued(&self, id: JobId) -> bool {
        let cancelled = {
            let mut registry = self.registry.lock();
            registry.queues.values_mut().any(|q| {
                match q.jobs.iter().position(|j| j.id == id) {
                    Some(pos) => {
                        q.jobs.remove(pos);
                        q.dequeued += 1;
                        true
                    }
                    None => false,
                }
            })
        };
        if cancelled {
            // a sync caller may have been waiting behind this job
            self.changed.notify_all();
        }
        cancelled
    }

    pub(crate) fn worker_loop(&self) {
        let me = thread::current().id();
        loop {
            let (queue_id, generation, queued) = {
                let mut registry = self.registry.lock();
                loop {
                    if self.is_shutting_down() {
                        return;
                    }
                    if let Some(picked) = registry.pick_runnable(me) {
                        break picked;
                    }
                    self.changed.wait(&mut registry);
                }
            };
            if let Err(message) = run_guarded(queued.job) {
                self.report_panic(&queue_id, Some(queued.id), &message);
            }
            self.registry.lock().release(&queue_id, generation);
            self.changed.notify_all();
        }
    }

    pub(crate) fn sync<R>(&self, queue_id: &str, f: impl FnOnce() -> R) -> Result<R, DispatchError> {
        if self.is_shutting_down() {
            return Err(DispatchError::ShutDown);
        }
        let me = thread::current().id();
        let generation = {
            let mut registry = self.registry.lock();
            registry.next_waiter_id += 1;
            let waiter = registry.next_waiter_id;
            let q = registry.get_or_create(queue_id, priority::NORMAL);
            if q.running_on == Some(me) {
                // already inside this queue on this thread, run inline
                drop(registry);
                return run_guarded(f).map_err(|message| {
                    self.report_panic(queue_id, None, &message);
                    DispatchError::JobPanicked {
                        queue: queue_id.to_string(),
                        message,
                    }
                });
            }
            // runs once every job submitted so far has left the queue
            q.sync_waiters.push_back((q.enqueued, waiter));
            let generation = q.generation;
            loop {
                if self.is_shutting_down() {
                    if let Some(q) = registry.queues.get_mut(queue_id) {
                        q.sync_waiters.retain(|(_, id)| *id != waiter);
                    }
                    return Err(DispatchError::ShutDown);
                }
                match registry.queues.get_mut(queue_id) {
                    Some(q) if q.generation == generation => {
                        let my_turn = q.is_sync_turn()
                            && q.sync_waiters.front().map(|(_, id)| *id) == Some(waiter);
                        if my_turn && q.running_on.is_none() {
                            q.sync_waiters.pop_front();
                            q.running_on = Some(me);
                            break;
                        }
                    }
                    _ => return Err(DispatchError::QueueRemoved(queue_id.to_string())),
                }
                self.changed.wait(&mut registry);
            }
            generation
        };

        let result = run_guarded(f);
        self.registry.lock().release(queue_id, generation);
        self.changed.notify_all();
        result.map_err(|message| {
            self.report_panic(queue_id, None, &message);
            DispatchError::JobPanicked {
                queue: queue_id.to_string(),
                message,
            }
        })
    }

    pub(crate) fn wake_all(&self) {
        self.changed.notify_all();
    }

    fn report_panic(&self, queue_id: &str, job_id: Option<JobId>, message: &str) {
        error!(
            domain = self.name.as_str(),
            queue = queue_id,
            job = ?job_id,
            "Dispatch job panicked: {}",
            message
        );
        if let Some(hook) = self.exception_hook.read().as_ref() {
            hook(queue_id, message);
        }
    }
}

fn run_guarded<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        }
    })
}
