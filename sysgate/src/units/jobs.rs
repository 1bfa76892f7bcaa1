//! Tracking of the asynchronous systemd job issued by a state change.
//!
//! systemd answers `StartUnit` and friends with a job path right away and
//! reports the outcome later through the `JobRemoved` signal. A job outlives
//! the request and the connection that started it, so one tracker is shared
//! by the whole process:
//!
//! ```text
//! Idle ──begin──▶ Pending(job?) ──finish(job)──▶ Completed(result) ──wait──▶ Idle
//!                     │
//!                     └── wait deadline ──▶ StillRunning (stays Pending)
//! ```
//!
//! Completions are matched by job path. A completion that arrives before its
//! job is registered (the signal can outrun the method reply) is parked in a
//! small bounded buffer instead of being attributed to whatever is pending.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use super::UnitAction;
use crate::context::CancelToken;
use crate::error::UnitError;

/// Completions for unregistered jobs kept around for late registration.
const UNCLAIMED_CAPACITY: usize = 8;

/// Granularity at which a waiting call notices cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Job results that count as success.
const SUCCESS_RESULTS: [&str; 2] = ["done", "skipped"];

/// One `JobRemoved` signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub job: String,
    pub unit: String,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Completed {
        unit: String,
        action: UnitAction,
        job: String,
        result: String,
    },
    StillRunning {
        unit: String,
        action: UnitAction,
        job: String,
    },
    NoPendingOperation,
}

#[derive(Debug)]
enum State {
    Idle,
    /// `job` is `None` while the dispatching call is still in flight.
    Pending {
        unit: String,
        action: UnitAction,
        job: Option<String>,
    },
    Completed {
        unit: String,
        action: UnitAction,
        job: String,
        result: String,
    },
}

#[derive(Debug)]
struct Inner {
    state: State,
    unclaimed: VecDeque<JobCompletion>,
}

#[derive(Debug)]
pub struct JobTracker {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Idle,
                unclaimed: VecDeque::with_capacity(UNCLAIMED_CAPACITY),
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve the tracker for a new job on `unit`.
    pub fn begin(&self, unit: &str, action: UnitAction) -> Result<(), UnitError> {
        let mut inner = self.lock();
        match &inner.state {
            State::Pending {
                unit: pending, job, ..
            } => {
                return Err(UnitError::OperationInProgress {
                    unit: pending.clone(),
                    job: job.clone().unwrap_or_else(|| "dispatching".to_string()),
                });
            }
            State::Completed { unit, job, result, .. } => {
                debug!(%unit, %job, %result, "discarding unreported job result");
            }
            State::Idle => {}
        }
        inner.state = State::Pending {
            unit: unit.to_string(),
            action,
            job: None,
        };
        Ok(())
    }

    /// The dispatching call failed; release the reservation.
    pub fn abort(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, State::Pending { job: None, .. }) {
            inner.state = State::Idle;
        }
    }

    /// Attach the job path returned by systemd to the pending reservation.
    pub fn register(&self, job: &str) {
        let mut inner = self.lock();
        let early = inner
            .unclaimed
            .iter()
            .position(|c| c.job == job)
            .and_then(|idx| inner.unclaimed.remove(idx));

        let State::Pending { unit, action, .. } = &inner.state else {
            warn!(job, "job registered without a reservation");
            return;
        };
        let (unit, action) = (unit.clone(), *action);

        inner.state = match early {
            Some(completion) => {
                debug!(job, result = %completion.result, "job finished before registration");
                State::Completed {
                    unit,
                    action,
                    job: job.to_string(),
                    result: completion.result,
                }
            }
            None => State::Pending {
                unit,
                action,
                job: Some(job.to_string()),
            },
        };
        self.changed.notify_all();
    }

    /// Record a `JobRemoved` signal.
    pub fn finish(&self, completion: JobCompletion) {
        let mut inner = self.lock();
        let matches_pending = matches!(
            &inner.state,
            State::Pending { job: Some(job), .. } if *job == completion.job
        );

        if matches_pending {
            if let State::Pending { unit, action, .. } = &inner.state {
                debug!(job = %completion.job, result = %completion.result, "job finished");
                inner.state = State::Completed {
                    unit: unit.clone(),
                    action: *action,
                    job: completion.job,
                    result: completion.result,
                };
            }
            self.changed.notify_all();
            return;
        }

        // Only completions that may still be claimed are worth keeping.
        if matches!(inner.state, State::Pending { job: None, .. }) {
            if inner.unclaimed.len() == UNCLAIMED_CAPACITY {
                inner.unclaimed.pop_front();
            }
            inner.unclaimed.push_back(completion);
        }
    }

    /// True while a job is reserved or running.
    pub fn is_pending(&self) -> bool {
        matches!(self.lock().state, State::Pending { .. })
    }

    /// Wait up to `timeout` for the tracked job.
    ///
    /// A finished job is reported once and the tracker returns to idle. A
    /// job still running at the deadline stays tracked for a later call.
    pub fn wait(&self, timeout: Duration, cancel: &CancelToken) -> Result<JobStatus, UnitError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            match &inner.state {
                State::Idle => return Ok(JobStatus::NoPendingOperation),
                State::Completed { .. } => {
                    let State::Completed {
                        unit,
                        action,
                        job,
                        result,
                    } = std::mem::replace(&mut inner.state, State::Idle)
                    else {
                        unreachable!("state checked above");
                    };
                    return report(unit, action, job, result);
                }
                State::Pending { unit, action, job } => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(JobStatus::StillRunning {
                            unit: unit.clone(),
                            action: *action,
                            job: job.clone().unwrap_or_default(),
                        });
                    }
                    if cancel.is_cancelled() {
                        return Err(UnitError::Cancelled);
                    }
                    let slice = (deadline - now).min(POLL_INTERVAL);
                    inner = self
                        .changed
                        .wait_timeout(inner, slice)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }
}

fn report(
    unit: String,
    action: UnitAction,
    job: String,
    result: String,
) -> Result<JobStatus, UnitError> {
    if SUCCESS_RESULTS.contains(&result.as_str()) {
        Ok(JobStatus::Completed {
            unit,
            action,
            job,
            result,
        })
    } else {
        Err(UnitError::OperationFailed { unit, result })
    }
}
