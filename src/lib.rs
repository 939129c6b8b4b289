//! nanoflow: lightweight orchestration for directed-graph workflows.
//!
//! Every node is a nano-ETL unit (prep | exec | post), nodes connect via
//! named action edges, and a shared [`Store`] is the single source of
//! truth: typed, observable, checkpointable. Runs, lifecycle events, and
//! per-step checkpoints persist to an embedded SQLite database that
//! external monitors can read while a run is in flight.
//!
//! ```
//! use nanoflow::error::Result;
//! use nanoflow::{Flow, Node, NodeLogic, Store};
//! use serde_json::{Value, json};
//!
//! struct Shout;
//!
//! impl NodeLogic for Shout {
//!     fn prep(&self, store: &Store) -> Result<Value> {
//!         Ok(store.get("text")?.clone())
//!     }
//!
//!     fn exec(&self, prep: &Value) -> Result<Value> {
//!         let text = prep.as_str().unwrap_or_default();
//!         Ok(json!(format!("{text}!")))
//!     }
//!
//!     fn post(&self, store: &mut Store, _prep: &Value, exec: &Value) -> Result<String> {
//!         store.set("out", exec.clone())?;
//!         Ok("done".to_string())
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let shout = Node::new(Shout);
//! let flow = Flow::new(&shout);
//! let store = Store::new("demo").with_data([("text".to_string(), json!("hi"))])?;
//! let store = flow.run(store)?;
//! assert_eq!(store.get("out")?, &json!("hi!"));
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod error;
pub mod flow;
pub mod node;
pub mod runner;
pub mod store;
pub mod visualize;

pub use db::{CheckpointRow, EventRow, RunRow, RunStatus, WorkflowDB};
pub use error::{FlowError, Result};
pub use flow::{DEFAULT_MAX_STEPS, Flow, FlowEvent};
pub use node::{
    AsyncNodeLogic, DEFAULT_ACTION, Node, NodeLogic, NodeOptions, WILDCARD_ACTION,
};
pub use runner::RunHandle;
pub use store::{ObserverId, Store, TypeTag};
