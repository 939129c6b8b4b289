//! Nano-ETL execution unit: prep → exec (retryable) → post.
//!
//! A [`Node`] wraps user logic, sync ([`NodeLogic`]) or async
//! ([`AsyncNodeLogic`]), together with its retry policy and the outbound
//! edge table that routes the action string returned by `post`. Handles are
//! cheap clones of a shared inner, so the same node can appear in several
//! places of a graph and graphs may contain cycles.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{FlowError, Result};
use crate::store::Store;

/// Action returned by `post` when it has nothing more specific to say.
pub const DEFAULT_ACTION: &str = "default";

/// Edge key matched when no exact action matches.
pub const WILDCARD_ACTION: &str = "*";

/// Synchronous node behavior.
///
/// `prep` reads from the store, `exec` does the work without touching the
/// store, `post` writes results back and returns the outbound action.
/// Only `exec` is retried; `exec_fallback` may recover a failed attempt by
/// returning a substitute exec result (the default re-raises).
pub trait NodeLogic: Send + Sync + 'static {
    fn prep(&self, _store: &Store) -> Result<Value> {
        Ok(Value::Null)
    }

    fn exec(&self, prep: &Value) -> Result<Value>;

    fn exec_fallback(&self, _prep: &Value, error: FlowError) -> Result<Value> {
        Err(error)
    }

    fn post(&self, _store: &mut Store, _prep: &Value, _exec: &Value) -> Result<String> {
        Ok(DEFAULT_ACTION.to_string())
    }
}

/// Asynchronous node behavior: `exec_async` replaces `exec`.
///
/// The scheduler drives `exec_async` to completion on a current-thread
/// runtime before moving on, so fan-out/fan-in happens inside the node and
/// the surrounding flow stays synchronous. `prep` and `post` never suspend.
#[async_trait]
pub trait AsyncNodeLogic: Send + Sync + 'static {
    fn prep(&self, _store: &Store) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn exec_async(&self, prep: &Value) -> Result<Value>;

    fn exec_fallback(&self, _prep: &Value, error: FlowError) -> Result<Value> {
        Err(error)
    }

    fn post(&self, _store: &mut Store, _prep: &Value, _exec: &Value) -> Result<String> {
        Ok(DEFAULT_ACTION.to_string())
    }
}

/// Which exec variant a node carries, fixed at construction.
enum Behavior {
    Sync(Box<dyn NodeLogic>),
    Async(Box<dyn AsyncNodeLogic>),
}

/// Optional construction parameters for [`Node::with_options`].
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Display name; defaults to the logic type's name.
    pub name: Option<String>,
    /// Total exec attempts, at least 1.
    pub max_retries: u32,
    /// Pause between failed attempts.
    pub retry_delay: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            name: None,
            max_retries: 1,
            retry_delay: Duration::ZERO,
        }
    }
}

struct NodeInner {
    name: String,
    max_retries: u32,
    retry_delay: Duration,
    behavior: Behavior,
    successors: RwLock<HashMap<String, Node>>,
}

/// A graph vertex: user logic plus retry policy plus outbound edges.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Wrap synchronous logic with default options.
    pub fn new<L: NodeLogic>(logic: L) -> Self {
        Self::assemble(
            short_type_name::<L>().to_string(),
            1,
            Duration::ZERO,
            Behavior::Sync(Box::new(logic)),
        )
    }

    /// Wrap asynchronous logic with default options.
    pub fn new_async<L: AsyncNodeLogic>(logic: L) -> Self {
        Self::assemble(
            short_type_name::<L>().to_string(),
            1,
            Duration::ZERO,
            Behavior::Async(Box::new(logic)),
        )
    }

    /// Wrap synchronous logic with explicit options.
    pub fn with_options<L: NodeLogic>(logic: L, options: NodeOptions) -> Result<Self> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| short_type_name::<L>().to_string());
        Self::checked(name, options, Behavior::Sync(Box::new(logic)))
    }

    /// Wrap asynchronous logic with explicit options.
    pub fn with_async_options<L: AsyncNodeLogic>(logic: L, options: NodeOptions) -> Result<Self> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| short_type_name::<L>().to_string());
        Self::checked(name, options, Behavior::Async(Box::new(logic)))
    }

    fn checked(name: String, options: NodeOptions, behavior: Behavior) -> Result<Self> {
        if options.max_retries == 0 {
            return Err(FlowError::InvalidArg(format!(
                "node '{name}': max_retries must be at least 1"
            )));
        }
        Ok(Self::assemble(
            name,
            options.max_retries,
            options.retry_delay,
            behavior,
        ))
    }

    fn assemble(name: String, max_retries: u32, retry_delay: Duration, behavior: Behavior) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                name,
                max_retries,
                retry_delay,
                behavior,
                successors: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_retries(&self) -> u32 {
        self.inner.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.inner.retry_delay
    }

    pub fn is_async(&self) -> bool {
        matches!(self.inner.behavior, Behavior::Async(_))
    }

    // ── Wiring ───────────────────────────────────────────────────────────

    /// Route `action` to `next`. Use [`WILDCARD_ACTION`] to catch any action
    /// without a named edge. Returns a clone of `self` for chaining:
    ///
    /// `a.then("ok", &b).then("error", &c)`
    pub fn then(&self, action: impl Into<String>, next: &Node) -> Node {
        let action = action.into();
        let mut successors = self
            .inner
            .successors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if successors.insert(action.clone(), next.clone()).is_some() {
            warn!(node = %self.inner.name, action = %action, "overwriting existing edge");
        }
        self.clone()
    }

    /// Successor for `action`: exact match first, then the wildcard edge,
    /// then `None` (the flow terminates here).
    pub fn next_node(&self, action: &str) -> Option<Node> {
        let successors = self
            .inner
            .successors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(next) = successors.get(action) {
            return Some(next.clone());
        }
        if let Some(next) = successors.get(WILDCARD_ACTION) {
            debug!(node = %self.inner.name, action = %action, "action matched wildcard edge");
            return Some(next.clone());
        }
        if !successors.is_empty() {
            debug!(node = %self.inner.name, action = %action, "no successor — flow terminates here");
        }
        None
    }

    /// Outbound edges, sorted by action for deterministic traversal.
    pub fn successors(&self) -> Vec<(String, Node)> {
        let successors = self
            .inner
            .successors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<(String, Node)> = successors
            .iter()
            .map(|(action, next)| (action.clone(), next.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Stable identity of the shared inner, for graph walks.
    pub(crate) fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    // ── Execution (driven by Flow) ───────────────────────────────────────

    /// Run prep → exec (with retries) → post. Returns the action string,
    /// with an empty action normalised to [`DEFAULT_ACTION`].
    pub(crate) fn run(&self, store: &mut Store) -> Result<String> {
        let name = &self.inner.name;
        debug!(node = %name, "node starting");

        let prep = self.invoke_prep(store).map_err(|err| FlowError::PrepFailed {
            node: name.clone(),
            source: Box::new(err),
        })?;

        let exec = self.run_exec(&prep)?;

        let action = self
            .invoke_post(store, &prep, &exec)
            .map_err(|err| FlowError::PostFailed {
                node: name.clone(),
                source: Box::new(err),
            })?;
        let action = if action.is_empty() {
            DEFAULT_ACTION.to_string()
        } else {
            action
        };
        debug!(node = %name, action = %action, "node done");
        Ok(action)
    }

    fn run_exec(&self, prep: &Value) -> Result<Value> {
        let name = &self.inner.name;
        let max_retries = self.inner.max_retries;
        let mut attempt = 1u32;
        loop {
            let exec_err = match self.invoke_exec(prep) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= max_retries {
                error!(node = %name, attempts = attempt, error = %exec_err, "exec failed, no attempts left");
                return Err(FlowError::ExecFailed {
                    node: name.clone(),
                    attempts: attempt,
                    source: Box::new(exec_err),
                });
            }

            warn!(
                node = %name,
                attempt,
                max_retries,
                error = %exec_err,
                "exec attempt failed — consulting fallback before retry"
            );
            if let Ok(recovered) = self.invoke_fallback(prep, exec_err) {
                debug!(node = %name, attempt, "exec_fallback recovered the attempt");
                return Ok(recovered);
            }

            if self.inner.retry_delay > Duration::ZERO {
                std::thread::sleep(self.inner.retry_delay);
            }
            attempt += 1;
        }
    }

    fn invoke_prep(&self, store: &Store) -> Result<Value> {
        match &self.inner.behavior {
            Behavior::Sync(logic) => logic.prep(store),
            Behavior::Async(logic) => logic.prep(store),
        }
    }

    fn invoke_exec(&self, prep: &Value) -> Result<Value> {
        match &self.inner.behavior {
            Behavior::Sync(logic) => logic.exec(prep),
            Behavior::Async(logic) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(logic.exec_async(prep))
            }
        }
    }

    fn invoke_fallback(&self, prep: &Value, error: FlowError) -> Result<Value> {
        match &self.inner.behavior {
            Behavior::Sync(logic) => logic.exec_fallback(prep, error),
            Behavior::Async(logic) => logic.exec_fallback(prep, error),
        }
    }

    fn invoke_post(&self, store: &mut Store, prep: &Value, exec: &Value) -> Result<String> {
        match &self.inner.behavior {
            Behavior::Sync(logic) => logic.post(store, prep, exec),
            Behavior::Async(logic) => logic.post(store, prep, exec),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let actions: Vec<String> = self
            .successors()
            .into_iter()
            .map(|(action, _)| action)
            .collect();
        f.debug_struct("Node")
            .field("name", &self.inner.name)
            .field("max_retries", &self.inner.max_retries)
            .field("async", &self.is_async())
            .field("edges", &actions)
            .finish()
    }
}

/// Last path segment of a type name, e.g. `my_app::nodes::Summarise` → `Summarise`.
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
