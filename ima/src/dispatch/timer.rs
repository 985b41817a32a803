// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Delayed and periodic jobs. A single timer thread moves due jobs into
//! their queue; the queue then runs them like any other job.

use super::domain::{DomainCore, Job};
use super::{JobId, QueueId};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

pub(crate) type RepeatJob = Arc<dyn Fn() + Send + Sync + 'static>;

enum TimerTask {
    Once(Option<Job>),
    Repeat {
        job: RepeatJob,
        interval: Duration,
        // set while a fired instance sits in the queue or runs
        in_flight: Arc<AtomicBool>,
    },
}

struct TimerEntry {
    queue_id: QueueId,
    task: TimerTask,
}

#[derive(Default)]
struct TimerState {
    due: BinaryHeap<Reverse<(Instant, JobId)>>,
    entries: HashMap<JobId, TimerEntry>,
}

#[derive(Default)]
pub(crate) struct Timers {
    state: Mutex<TimerState>,
    changed: Condvar,
}

struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Timers {
    pub(crate) fn schedule_once(&self, queue_id: &str, id: JobId, job: Job, at: Instant) {
        self.insert(
            id,
            TimerEntry {
                queue_id: queue_id.to_string(),
                task: TimerTask::Once(Some(job)),
            },
            at,
        );
    }

    pub(crate) fn schedule_repeat(
        &self,
        queue_id: &str,
        id: JobId,
        job: RepeatJob,
        first: Instant,
        interval: Duration,
    ) {
        self.insert(
            id,
            TimerEntry {
                queue_id: queue_id.to_string(),
                task: TimerTask::Repeat {
                    job,
                    interval,
                    in_flight: Arc::new(AtomicBool::new(false)),
                },
            },
            first,
        );
    }

    fn insert(&self, id: JobId, entry: TimerEntry, at: Instant) {
        {
            let mut state = self.state.lock();
            state.entries.insert(id, entry);
            state.due.push(Reverse((at, id)));
        }
        self.changed.notify_all();
    }

    /// Forgets a timer. Stale heap entries are skipped when they come due.
    pub(crate) fn cancel(&self, id: JobId) -> bool {
        self.state.lock().entries.remove(&id).is_some()
    }

    /// Forgets every timer that targets `queue_id`. Returns how many were dropped.
    pub(crate) fn cancel_queue(&self, queue_id: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.queue_id != queue_id);
        before - state.entries.len()
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.due.clear();
    }

    pub(crate) fn wake(&self) {
        self.changed.notify_all();
    }

    // Due jobs are enqueued while the timer state is locked, so a concurrent
    // `cancel_queue` either sees the entry or finds the job already queued.
    pub(crate) fn timer_loop(&self, core: &DomainCore) {
        let mut state = self.state.lock();
        loop {
            if core.is_shutting_down() {
                return;
            }
            let now = Instant::now();
            match state.due.peek() {
                None => {
                    self.changed.wait(&mut state);
                }
                Some(Reverse((at, _))) if *at > now => {
                    let at = *at;
                    self.changed.wait_until(&mut state, at);
                }
                Some(_) => {
                    if let Some((queue_id, id, job)) = Self::take_due(&mut state, now) {
                        if let Err(e) = core.enqueue(&queue_id, id, job) {
                            warn!(queue = queue_id.as_str(), job = %id, "Dropping timer job: {}", e);
                        }
                    }
                }
            }
        }
    }

    // Pops the earliest due entry and turns it into a runnable job, re-arming
    // periodic entries. Returns None for cancelled or still in-flight entries.
    fn take_due(state: &mut TimerState, now: Instant) -> Option<(QueueId, JobId, Job)> {
        let Reverse((at, id)) = state.due.pop()?;
        let entry = state.entries.get_mut(&id)?;
        let queue_id = entry.queue_id.clone();
        match &mut entry.task {
            TimerTask::Once(job) => {
                let job = job.take();
                state.entries.remove(&id);
                job.map(|job| (queue_id, id, job))
            }
            TimerTask::Repeat {
                job,
                interval,
                in_flight,
            } => {
                let mut next = at + *interval;
                if next <= now {
                    next = now + *interval;
                }
                let job = job.clone();
                let in_flight = in_flight.clone();
                state.due.push(Reverse((next, id)));
                if in_flight.swap(true, Ordering::SeqCst) {
                    // previous run has not finished, skip this tick
                    return None;
                }
                let guard = InFlightGuard(in_flight);
                let run: Job = Box::new(move || {
                    let _guard = guard;
                    job();
                });
                Some((queue_id, id, run))
            }
        }
    }
}
