//! Tests for background execution: RunHandle status, wait, and cooperative
//! cancellation.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nanoflow::error::Result;
use nanoflow::{Flow, FlowError, Node, NodeLogic, NodeOptions, RunStatus, Store};
use serde_json::{Value, json};

mod common;

struct Sleep {
    millis: u64,
}

impl NodeLogic for Sleep {
    fn exec(&self, _prep: &Value) -> Result<Value> {
        std::thread::sleep(Duration::from_millis(self.millis));
        Ok(Value::Null)
    }
}

struct Mark {
    key: &'static str,
}

impl NodeLogic for Mark {
    fn exec(&self, _prep: &Value) -> Result<Value> {
        Ok(json!(true))
    }

    fn post(&self, store: &mut Store, _prep: &Value, exec: &Value) -> Result<String> {
        store.set(self.key, exec.clone())?;
        Ok("done".to_string())
    }
}

struct Boom;

impl NodeLogic for Boom {
    fn exec(&self, _prep: &Value) -> Result<Value> {
        Err(FlowError::msg("kaput"))
    }
}

/// Chain of `count` sleeping nodes wired along the default action.
fn sleepy_chain(count: usize, millis: u64) -> Node {
    let nodes: Vec<Node> = (0..count)
        .map(|i| {
            Node::with_options(
                Sleep { millis },
                NodeOptions {
                    name: Some(format!("Sleep{i}")),
                    ..Default::default()
                },
            )
            .unwrap()
        })
        .collect();
    for pair in nodes.windows(2) {
        pair[0].then("default", &pair[1]);
    }
    nodes[0].clone()
}

// --- Completion ---

#[test]
fn background_run_completes_and_returns_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let a = Node::new(Mark { key: "done" });
    let flow = Flow::new(&a)
        .with_name("bg")
        .with_db_path(dir.path().join("flow.db"))
        .unwrap();

    let handle = flow.run_background(Store::new("s")).unwrap();
    assert!(handle.run_id().starts_with("bg-"));

    let store = handle.wait(None).unwrap().unwrap();
    assert_eq!(store.get("done").unwrap(), &json!(true));
    assert!(handle.is_finished());
    assert_eq!(handle.status().unwrap(), RunStatus::Completed);
    assert!(handle.error().is_none());
}

#[test]
fn wait_with_timeout_returns_none_while_running() {
    let start = sleepy_chain(1, 300);
    let flow = Flow::new(&start);

    let handle = flow.run_background(Store::new("s")).unwrap();
    assert!(handle.wait(Some(Duration::from_millis(50))).unwrap().is_none());
    assert!(!handle.is_finished());

    // The run is still going; a full wait gets the store.
    assert!(handle.wait(None).unwrap().is_some());
}

#[test]
fn status_without_a_database_is_inferred_from_the_worker() {
    let start = sleepy_chain(1, 200);
    let flow = Flow::new(&start);

    let handle = flow.run_background(Store::new("s")).unwrap();
    assert_eq!(handle.status().unwrap(), RunStatus::Running);

    handle.wait(None).unwrap().unwrap();
    assert_eq!(handle.status().unwrap(), RunStatus::Completed);
}

// --- Cancellation ---

#[test]
fn cancel_mid_run_stops_between_nodes() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let start = sleepy_chain(10, 50);
    let flow = Flow::new(&start)
        .with_name("cancellable")
        .with_db_path(dir.path().join("flow.db"))
        .unwrap();

    let handle = flow.run_background(Store::new("s")).unwrap();
    std::thread::sleep(Duration::from_millis(120));
    handle.cancel();
    handle.cancel(); // idempotent

    // Cancellation is not an error: the partial store comes back.
    let store = handle.wait(Some(Duration::from_secs(5))).unwrap();
    assert!(store.is_some());
    assert_eq!(handle.status().unwrap(), RunStatus::Cancelled);

    let db = flow.db().unwrap();
    let run = db.get_run(handle.run_id()).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    // Checkpoints exist only for the steps that finished before the flag
    // was seen.
    let checkpoints = db.get_checkpoints(handle.run_id()).unwrap();
    assert!(!checkpoints.is_empty());
    assert!(checkpoints.len() < 10);

    let events = db.get_events(handle.run_id()).unwrap();
    assert_eq!(events.last().unwrap().event, "flow_cancel");
}

#[test]
fn cancel_before_the_first_node_leaves_zero_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let gate_rx = Mutex::new(gate_rx);

    let a = Node::new(Mark { key: "ran" });
    let flow = Flow::new(&a)
        .with_name("gated")
        .with_db_path(dir.path().join("flow.db"))
        .unwrap()
        // Hold the worker inside flow_start until the test says go.
        .on("flow_start", move |_| {
            let _ = gate_rx.lock().unwrap().recv();
        })
        .unwrap();

    let handle = flow.run_background(Store::new("s")).unwrap();
    handle.cancel();
    gate_tx.send(()).unwrap();

    let store = handle.wait(Some(Duration::from_secs(5))).unwrap().unwrap();
    assert!(!store.contains("ran"));
    assert_eq!(handle.status().unwrap(), RunStatus::Cancelled);

    let db = flow.db().unwrap();
    assert!(db.get_checkpoints(handle.run_id()).unwrap().is_empty());
    let events: Vec<String> = db
        .get_events(handle.run_id())
        .unwrap()
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert_eq!(events, vec!["flow_start", "flow_cancel"]);
}

// --- Failures ---

#[test]
fn failed_background_run_surfaces_through_wait_and_error() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let flow = Flow::new(&Node::new(Boom))
        .with_db_path(dir.path().join("flow.db"))
        .unwrap();

    let handle = flow.run_background(Store::new("s")).unwrap();
    let err = handle.wait(None).unwrap_err();
    assert!(matches!(err, FlowError::ExecFailed { .. }));

    assert_eq!(handle.status().unwrap(), RunStatus::Failed);
    let error = handle.error().unwrap();
    assert!(error.contains("Boom"));
    assert!(error.contains("kaput"));
}

// --- Coexisting handles ---

#[test]
fn multiple_background_runs_coexist() {
    let dir = tempfile::tempdir().unwrap();
    let a = Node::new(Mark { key: "done" });
    let flow = Flow::new(&a)
        .with_name("multi")
        .with_db_path(dir.path().join("flow.db"))
        .unwrap();

    let first = flow.run_background(Store::new("one")).unwrap();
    let second = flow.run_background(Store::new("two")).unwrap();
    assert_ne!(first.run_id(), second.run_id());

    let store_one = first.wait(None).unwrap().unwrap();
    let store_two = second.wait(None).unwrap().unwrap();
    assert_eq!(store_one.name(), "one");
    assert_eq!(store_two.name(), "two");

    let db = flow.db().unwrap();
    assert_eq!(db.list_runs(None).unwrap().len(), 2);
}

// --- Hook-driven observation of a background run ---

#[test]
fn hooks_fire_on_the_worker_thread() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let a = Node::new(Mark { key: "done" });
    let flow = Flow::new(&a)
        .on("node_end", {
            let seen = seen.clone();
            move |event| {
                if let nanoflow::FlowEvent::NodeEnd { node, action, .. } = event {
                    seen.lock().unwrap().push(format!("{node}:{action}"));
                }
            }
        })
        .unwrap();

    let handle = flow.run_background(Store::new("s")).unwrap();
    handle.wait(None).unwrap().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["Mark:done"]);
}
