//! Supervision of background runs: live status, blocking wait, cooperative
//! cancellation.
//!
//! [`Flow::run_background`](crate::flow::Flow::run_background) hands the
//! scheduler loop to a detached worker thread and returns a [`RunHandle`].
//! The handle never shares the store with the worker; the store comes back
//! only as the final result of [`RunHandle::wait`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::info;

use crate::db::{RunStatus, WorkflowDB};
use crate::error::{FlowError, Result};
use crate::store::Store;

type Outcome = Result<(RunStatus, Store)>;

struct FinishedRun {
    status: RunStatus,
    /// Taken by the first `wait` call that returns it.
    result: Option<Result<Store>>,
    /// Sticky failure text, kept after `result` is handed out.
    error: Option<String>,
}

struct HandleState {
    rx: Receiver<Outcome>,
    finished: Option<FinishedRun>,
}

/// Handle for a flow running on a background worker thread.
///
/// Returned by `Flow::run_background`; not constructed directly.
pub struct RunHandle {
    run_id: String,
    cancel: Arc<AtomicBool>,
    db: Option<WorkflowDB>,
    state: Mutex<HandleState>,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: String,
        cancel: Arc<AtomicBool>,
        rx: Receiver<Outcome>,
        db: Option<WorkflowDB>,
    ) -> Self {
        Self {
            run_id,
            cancel,
            db,
            state: Mutex::new(HandleState { rx, finished: None }),
        }
    }

    /// Unique identifier of this run (`pf_runs.run_id` when a database is
    /// configured).
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Live status.
    ///
    /// Reads `pf_runs.status` on every call when a database is configured
    /// (the row is updated as the run progresses); otherwise the status is
    /// inferred from the worker's result channel.
    pub fn status(&self) -> Result<RunStatus> {
        if let Some(db) = &self.db {
            if let Some(run) = db.get_run(&self.run_id)? {
                return Ok(run.status);
            }
        }
        let mut state = self.lock();
        poll_worker(&mut state);
        Ok(match &state.finished {
            Some(finished) => finished.status,
            None => RunStatus::Running,
        })
    }

    /// True once the worker has reported a result (any terminal status).
    pub fn is_finished(&self) -> bool {
        let mut state = self.lock();
        poll_worker(&mut state);
        state.finished.is_some()
    }

    /// Block until the run finishes and return the resulting store.
    ///
    /// Returns `Ok(None)` if `timeout` elapses first (the run keeps going;
    /// call again, or [`RunHandle::cancel`] to stop it). A failed run
    /// returns its error; a cancelled run returns the store as of the last
    /// completed step.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Option<Store>> {
        let mut state = self.lock();
        if state.finished.is_none() {
            let outcome = match timeout {
                Some(duration) => match state.rx.recv_timeout(duration) {
                    Ok(outcome) => outcome,
                    Err(RecvTimeoutError::Timeout) => return Ok(None),
                    Err(RecvTimeoutError::Disconnected) => Err(worker_lost()),
                },
                None => state.rx.recv().unwrap_or_else(|_| Err(worker_lost())),
            };
            state.finished = Some(finish(outcome));
        }
        let finished = match state.finished.as_mut() {
            Some(finished) => finished,
            None => return Ok(None),
        };
        match finished.result.take() {
            Some(Ok(store)) => Ok(Some(store)),
            Some(Err(err)) => Err(err),
            // A previous wait already took the result. Re-raise a recorded
            // failure; a consumed success has nothing left to hand out.
            None => match &finished.error {
                Some(text) => Err(FlowError::msg(text.clone())),
                None => Ok(None),
            },
        }
    }

    /// Request cooperative cancellation. The scheduler checks the flag
    /// between nodes; a node already executing runs to completion. Safe to
    /// call any number of times.
    pub fn cancel(&self) {
        info!(run_id = %self.run_id, "cancel requested");
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// The captured failure, if the run failed.
    pub fn error(&self) -> Option<String> {
        {
            let mut state = self.lock();
            poll_worker(&mut state);
            if let Some(finished) = &state.finished {
                if finished.error.is_some() {
                    return finished.error.clone();
                }
            }
        }
        if let Some(db) = &self.db {
            if let Ok(Some(run)) = db.get_run(&self.run_id) {
                return run.error;
            }
        }
        None
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("cancel_requested", &self.cancel.load(Ordering::SeqCst))
            .finish()
    }
}

fn finish(outcome: Outcome) -> FinishedRun {
    match outcome {
        Ok((status, store)) => FinishedRun {
            status,
            result: Some(Ok(store)),
            error: None,
        },
        Err(err) => {
            let text = err.to_string();
            FinishedRun {
                status: RunStatus::Failed,
                result: Some(Err(err)),
                error: Some(text),
            }
        }
    }
}

/// Non-blocking check for a worker result.
fn poll_worker(state: &mut HandleState) {
    if state.finished.is_some() {
        return;
    }
    match state.rx.try_recv() {
        Ok(outcome) => state.finished = Some(finish(outcome)),
        Err(TryRecvError::Empty) => {}
        Err(TryRecvError::Disconnected) => state.finished = Some(finish(Err(worker_lost()))),
    }
}

fn worker_lost() -> FlowError {
    FlowError::msg("worker thread exited without reporting a result")
}
