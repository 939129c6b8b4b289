//! Directed-graph scheduler: steps from node to node along action edges,
//! fires lifecycle hooks, writes checkpoints, and records every run in the
//! workflow database.
//!
//! A flow owns a start node and walks the wired graph one node at a time:
//! run the node's three phases, take the returned action, look up the next
//! node, snapshot the store, repeat. Foreground runs execute on the calling
//! thread; [`Flow::run_background`] hands the same loop to a dedicated
//! worker thread supervised by a [`RunHandle`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{RunStatus, WorkflowDB, now_ts};
use crate::error::{FlowError, Result};
use crate::node::Node;
use crate::runner::RunHandle;
use crate::store::Store;

/// Default infinite-loop guard: a run may not exceed this many steps.
pub const DEFAULT_MAX_STEPS: u64 = 10_000;

/// Lifecycle event passed to hooks registered with [`Flow::on`].
#[derive(Debug)]
pub enum FlowEvent<'a> {
    /// The run is about to execute its first node.
    FlowStart { flow_name: &'a str, store: &'a Store },
    /// A node is about to run.
    NodeStart { node: &'a str, store: &'a Store },
    /// A node completed; `action` is what its post phase returned.
    NodeEnd {
        node: &'a str,
        action: &'a str,
        elapsed: Duration,
        store: &'a Store,
    },
    /// A node failed; the run is about to abort.
    NodeError {
        node: &'a str,
        error: &'a FlowError,
        store: &'a Store,
    },
    /// The run terminated naturally after `total_steps` completed nodes.
    FlowEnd { total_steps: u64, store: &'a Store },
}

type Hook = Arc<dyn Fn(&FlowEvent<'_>) + Send + Sync>;

#[derive(Clone, Default)]
struct Hooks {
    flow_start: Vec<Hook>,
    node_start: Vec<Hook>,
    node_end: Vec<Hook>,
    node_error: Vec<Hook>,
    flow_end: Vec<Hook>,
}

fn fire(hooks: &[Hook], event: FlowEvent<'_>) {
    for hook in hooks {
        hook(&event);
    }
}

/// Executes a directed graph of [`Node`]s against a shared [`Store`].
#[derive(Clone)]
pub struct Flow {
    start: Node,
    flow_name: String,
    db: Option<WorkflowDB>,
    checkpoint_dir: Option<PathBuf>,
    max_steps: u64,
    hooks: Hooks,
}

impl Flow {
    /// Build a flow starting at `start`. The flow name defaults to the
    /// start node's name.
    pub fn new(start: &Node) -> Self {
        Self {
            start: start.clone(),
            flow_name: start.name().to_string(),
            db: None,
            checkpoint_dir: None,
            max_steps: DEFAULT_MAX_STEPS,
            hooks: Hooks::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.flow_name = name.into();
        self
    }

    /// Persist runs, events, and checkpoints to the database at `path`
    /// (created on first open).
    pub fn with_db_path(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.db = Some(WorkflowDB::open(path)?);
        Ok(self)
    }

    /// Persist to an already-open database handle.
    pub fn with_db(mut self, db: WorkflowDB) -> Self {
        self.db = Some(db);
        self
    }

    /// Snapshot the store to `dir/step_NNN_<NodeName>.json` after every node.
    pub fn with_checkpoint_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.checkpoint_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Register a hook. Valid events: `flow_start`, `node_start`,
    /// `node_end`, `node_error`, `flow_end`; anything else is an
    /// `InvalidArg` error. Hooks for one event fire in registration order.
    pub fn on(
        mut self,
        event: &str,
        hook: impl Fn(&FlowEvent<'_>) + Send + Sync + 'static,
    ) -> Result<Self> {
        let list = match event {
            "flow_start" => &mut self.hooks.flow_start,
            "node_start" => &mut self.hooks.node_start,
            "node_end" => &mut self.hooks.node_end,
            "node_error" => &mut self.hooks.node_error,
            "flow_end" => &mut self.hooks.flow_end,
            other => {
                return Err(FlowError::InvalidArg(format!(
                    "unknown hook event '{other}' \
                     (valid: flow_start, node_start, node_end, node_error, flow_end)"
                )));
            }
        };
        list.push(Arc::new(hook));
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.flow_name
    }

    pub fn start(&self) -> &Node {
        &self.start
    }

    pub fn db(&self) -> Option<&WorkflowDB> {
        self.db.as_ref()
    }

    // ── Execution ────────────────────────────────────────────────────────

    /// Run the flow to termination on the calling thread and return the
    /// mutated store.
    pub fn run(&self, store: Store) -> Result<Store> {
        let cancel = AtomicBool::new(false);
        let run_id = new_run_id(&self.flow_name);
        let (_status, store) = self.execute(store, None, 0, &cancel, &run_id)?;
        Ok(store)
    }

    /// Run starting from `from` instead of the start node, numbering new
    /// checkpoints from `start_step`. Used after restoring a checkpoint:
    /// the resumed execution gets a fresh run id and its own event log;
    /// the original run's rows are left intact.
    pub fn resume(&self, store: Store, from: &Node, start_step: u64) -> Result<Store> {
        let cancel = AtomicBool::new(false);
        let run_id = new_run_id(&self.flow_name);
        let (_status, store) =
            self.execute(store, Some(from.clone()), start_step, &cancel, &run_id)?;
        Ok(store)
    }

    /// Start the flow on a dedicated worker thread and return immediately.
    pub fn run_background(&self, store: Store) -> Result<RunHandle> {
        self.spawn_background(store, None, 0)
    }

    /// Background variant of [`Flow::resume`].
    pub fn resume_background(
        &self,
        store: Store,
        from: &Node,
        start_step: u64,
    ) -> Result<RunHandle> {
        self.spawn_background(store, Some(from.clone()), start_step)
    }

    fn spawn_background(
        &self,
        store: Store,
        resume_from: Option<Node>,
        start_step: u64,
    ) -> Result<RunHandle> {
        let run_id = new_run_id(&self.flow_name);
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let flow = self.clone();
        let worker_cancel = cancel.clone();
        let worker_run_id = run_id.clone();
        std::thread::Builder::new()
            .name(format!("nanoflow-{run_id}"))
            .spawn(move || {
                let outcome = flow.execute(
                    store,
                    resume_from,
                    start_step,
                    worker_cancel.as_ref(),
                    &worker_run_id,
                );
                // The receiver may be gone if the caller dropped the handle.
                let _ = tx.send(outcome);
            })?;

        info!(run_id = %run_id, flow = %self.flow_name, "background run started");
        Ok(RunHandle::new(run_id, cancel, rx, self.db.clone()))
    }

    /// The scheduler loop. Single-threaded per run; `cancel` is consulted
    /// between nodes only.
    fn execute(
        &self,
        mut store: Store,
        resume_from: Option<Node>,
        start_step: u64,
        cancel: &AtomicBool,
        run_id: &str,
    ) -> Result<(RunStatus, Store)> {
        let flow_t0 = Instant::now();

        if let Some(db) = &self.db {
            db.create_run(run_id, &self.flow_name, now_ts())?;
            db.insert_event(run_id, "flow_start", None, None, None, None)?;
        }
        info!(
            run_id = %run_id,
            flow = %self.flow_name,
            resume = resume_from.is_some(),
            "flow starting"
        );
        fire(
            &self.hooks.flow_start,
            FlowEvent::FlowStart {
                flow_name: &self.flow_name,
                store: &store,
            },
        );

        let mut current = Some(resume_from.unwrap_or_else(|| self.start.clone()));
        let mut step = start_step;
        let mut last_action: Option<String> = None;

        let status = loop {
            let Some(node) = current.take() else {
                break RunStatus::Completed;
            };

            if cancel.load(Ordering::SeqCst) {
                info!(run_id = %run_id, node = %node.name(), "cancelled before node");
                break RunStatus::Cancelled;
            }

            if step >= self.max_steps {
                if self.max_steps == 0 {
                    // Degenerate zero-step flow: nothing ran, nothing failed.
                    break RunStatus::Completed;
                }
                let err = FlowError::MaxStepsExceeded {
                    limit: self.max_steps,
                };
                error!(run_id = %run_id, steps = step, "flow exceeded max_steps");
                self.record_failure(run_id, None, "max_steps exceeded", step);
                return Err(err);
            }

            let name = node.name().to_string();
            if let Some(db) = &self.db {
                if let Err(db_err) = db.insert_event(run_id, "node_start", Some(&name), None, None, None)
                {
                    self.record_failure(run_id, Some(&name), &db_err.to_string(), step);
                    return Err(db_err);
                }
            }
            fire(
                &self.hooks.node_start,
                FlowEvent::NodeStart {
                    node: &name,
                    store: &store,
                },
            );
            let node_t0 = Instant::now();

            let action = match node.run(&mut store) {
                Ok(action) => action,
                Err(err) => {
                    fire(
                        &self.hooks.node_error,
                        FlowEvent::NodeError {
                            node: &name,
                            error: &err,
                            store: &store,
                        },
                    );
                    error!(run_id = %run_id, node = %name, error = %err, "flow aborted at node");
                    self.record_failure(run_id, Some(&name), &err.to_string(), step);
                    return Err(err);
                }
            };
            let elapsed = node_t0.elapsed();

            // Durability order matters: the step checkpoint commits before
            // (or atomically with) its node_end event, and both land before
            // the node_end hook fires.
            if let Some(db) = &self.db {
                let result = store.to_json().and_then(|json| {
                    db.record_step(
                        run_id,
                        step,
                        &name,
                        &json,
                        &action,
                        elapsed.as_secs_f64() * 1000.0,
                    )
                });
                if let Err(db_err) = result {
                    self.record_failure(run_id, Some(&name), &db_err.to_string(), step);
                    return Err(db_err);
                }
            }
            if let Some(dir) = &self.checkpoint_dir {
                let file = dir.join(format!("step_{step:03}_{name}.json"));
                if let Err(io_err) = store.snapshot(&file) {
                    self.record_failure(run_id, Some(&name), &io_err.to_string(), step);
                    return Err(io_err);
                }
            }
            fire(
                &self.hooks.node_end,
                FlowEvent::NodeEnd {
                    node: &name,
                    action: &action,
                    elapsed,
                    store: &store,
                },
            );

            current = node.next_node(&action);
            last_action = Some(action);
            step += 1;
        };

        let total_elapsed = flow_t0.elapsed();
        match status {
            RunStatus::Completed => {
                if let Some(db) = &self.db {
                    db.update_run_status(run_id, RunStatus::Completed, Some(now_ts()), Some(step), None)?;
                    db.insert_event(
                        run_id,
                        "flow_end",
                        None,
                        last_action.as_deref(),
                        Some(total_elapsed.as_secs_f64() * 1000.0),
                        None,
                    )?;
                }
                info!(
                    run_id = %run_id,
                    steps = step,
                    elapsed_ms = total_elapsed.as_millis() as u64,
                    "flow complete"
                );
                fire(
                    &self.hooks.flow_end,
                    FlowEvent::FlowEnd {
                        total_steps: step,
                        store: &store,
                    },
                );
            }
            RunStatus::Cancelled => {
                if let Some(db) = &self.db {
                    db.update_run_status(run_id, RunStatus::Cancelled, Some(now_ts()), Some(step), None)?;
                    db.insert_event(run_id, "flow_cancel", None, None, None, None)?;
                }
                info!(run_id = %run_id, steps = step, "flow cancelled");
            }
            // The loop only breaks with Completed or Cancelled.
            RunStatus::Running | RunStatus::Failed => {}
        }

        Ok((status, store))
    }

    /// Best-effort failure bookkeeping. The database may itself be the
    /// reason the run is failing, so every write here is logged rather than
    /// propagated; the original error must reach the caller unmasked.
    fn record_failure(&self, run_id: &str, node_name: Option<&str>, message: &str, steps: u64) {
        let Some(db) = &self.db else {
            return;
        };
        if let Some(name) = node_name {
            if let Err(db_err) = db.insert_event(run_id, "node_error", Some(name), None, None, Some(message))
            {
                warn!(run_id = %run_id, error = %db_err, "failed to record node_error event");
            }
        }
        if let Err(db_err) = db.insert_event(run_id, "flow_error", node_name, None, None, Some(message))
        {
            warn!(run_id = %run_id, error = %db_err, "failed to record flow_error event");
        }
        if let Err(db_err) =
            db.update_run_status(run_id, RunStatus::Failed, Some(now_ts()), Some(steps), Some(message))
        {
            warn!(run_id = %run_id, error = %db_err, "failed to mark run as failed");
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.flow_name)
            .field("start", &self.start.name())
            .field("max_steps", &self.max_steps)
            .field("db", &self.db.is_some())
            .field("checkpoint_dir", &self.checkpoint_dir)
            .finish()
    }
}

/// Globally unique run id: `<flow_name>-<8-hex-random>`.
fn new_run_id(flow_name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{flow_name}-{}", &suffix[..8])
}
