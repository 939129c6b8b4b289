//! Typed, observable, checkpointable shared state.
//!
//! A [`Store`] is the single source of truth for a pipeline run: nodes read
//! from it in `prep` and write back in `post`. An optional schema constrains
//! the value type of individual keys, observers see every successful write,
//! and the whole store serialises to a JSON document for file snapshots and
//! database checkpoints.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FlowError, Result};

/// Type tag a schema key constrains its values to.
///
/// Booleans never satisfy `int`; `int` satisfies `float` only when the store
/// was built with numeric widening; `null` is accepted only by `null`.
/// `list` and `mapping` accept any element content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    String,
    Int,
    Float,
    Bool,
    List,
    Mapping,
    Null,
}

impl TypeTag {
    fn matches(&self, value: &Value, widen_numeric: bool) -> bool {
        match self {
            TypeTag::String => value.is_string(),
            TypeTag::Bool => value.is_boolean(),
            TypeTag::Int => matches!(value, Value::Number(n) if n.is_i64() || n.is_u64()),
            TypeTag::Float => match value {
                Value::Number(n) => n.is_f64() || (widen_numeric && (n.is_i64() || n.is_u64())),
                _ => false,
            },
            TypeTag::List => value.is_array(),
            TypeTag::Mapping => value.is_object(),
            TypeTag::Null => value.is_null(),
        }
    }

    /// Tag name for the actual type of a value, for error messages.
    fn name_of(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(n) if n.is_f64() => "float",
            Value::Number(_) => "int",
            Value::String(_) => "string",
            Value::Array(_) => "list",
            Value::Object(_) => "mapping",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeTag::String => "string",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Bool => "bool",
            TypeTag::List => "list",
            TypeTag::Mapping => "mapping",
            TypeTag::Null => "null",
        };
        write!(f, "{name}")
    }
}

/// Handle returned by [`Store::add_observer`], used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

type Observer = Box<dyn Fn(&str, Option<&Value>, &Value) -> Result<()> + Send + Sync>;

/// Serialised form shared by file snapshots and database checkpoints.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    name: &'a str,
    schema: &'a BTreeMap<String, TypeTag>,
    data: &'a serde_json::Map<String, Value>,
}

#[derive(Deserialize)]
struct SnapshotDoc {
    name: String,
    #[serde(default)]
    schema: BTreeMap<String, TypeTag>,
    data: serde_json::Map<String, Value>,
}

/// Shared state container for a pipeline run.
pub struct Store {
    name: String,
    data: serde_json::Map<String, Value>,
    schema: BTreeMap<String, TypeTag>,
    widen_numeric: bool,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
}

impl Store {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: serde_json::Map::new(),
            schema: BTreeMap::new(),
            widen_numeric: false,
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Declare per-key type constraints checked on every write.
    pub fn with_schema(mut self, schema: impl IntoIterator<Item = (String, TypeTag)>) -> Self {
        self.schema = schema.into_iter().collect();
        self
    }

    /// Allow `int` values to satisfy a `float` schema tag. Off by default.
    pub fn with_numeric_widening(mut self, widen: bool) -> Self {
        self.widen_numeric = widen;
        self
    }

    /// Seed initial key-value pairs through the normal type-checked path.
    pub fn with_data(mut self, data: impl IntoIterator<Item = (String, Value)>) -> Result<Self> {
        for (key, value) in data {
            self.set(key, value)?;
        }
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read a key, failing if it is absent.
    pub fn get(&self, key: &str) -> Result<&Value> {
        self.data.get(key).ok_or_else(|| FlowError::MissingKey {
            scope: format!("store '{}'", self.name),
            key: key.to_string(),
        })
    }

    /// Read a key, returning `None` if it is absent.
    pub fn get_opt(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read-only view of the underlying data.
    pub fn data(&self) -> &serde_json::Map<String, Value> {
        &self.data
    }

    /// The declared schema, keyed by store key.
    pub fn schema(&self) -> &BTreeMap<String, TypeTag> {
        &self.schema
    }

    /// Write a key.
    ///
    /// The value is type-checked against the schema first; on mismatch the
    /// store is left untouched and no observer fires. Observers run in
    /// registration order before this call returns; an observer failure is
    /// logged and does not abort the write.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        if let Some(expected) = self.schema.get(&key) {
            if !expected.matches(&value, self.widen_numeric) {
                return Err(FlowError::TypeKind {
                    store: self.name.clone(),
                    key,
                    expected: *expected,
                    actual: TypeTag::name_of(&value),
                });
            }
        }
        let old = self.data.insert(key.clone(), value);
        let new = match self.data.get(&key) {
            Some(v) => v,
            None => return Ok(()),
        };
        for (id, observer) in &self.observers {
            if let Err(err) = observer(&key, old.as_ref(), new) {
                warn!(store = %self.name, key = %key, observer = id.0, error = %err, "store observer failed");
            }
        }
        Ok(())
    }

    /// Write several keys through the same type-check/observer path.
    pub fn update(&mut self, entries: impl IntoIterator<Item = (String, Value)>) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Check that every schema-declared key is present.
    pub fn validate(&self) -> Result<()> {
        for key in self.schema.keys() {
            if !self.data.contains_key(key) {
                return Err(FlowError::MissingKey {
                    scope: format!("store '{}'", self.name),
                    key: key.clone(),
                });
            }
        }
        Ok(())
    }

    /// Register `callback(key, old_value, new_value)`, fired on every write.
    pub fn add_observer(
        &mut self,
        callback: impl Fn(&str, Option<&Value>, &Value) -> Result<()> + Send + Sync + 'static,
    ) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(callback)));
        id
    }

    /// Unregister an observer. Returns false if the id was already gone.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    /// Serialise to the `{name, schema, data}` checkpoint document.
    pub fn to_json(&self) -> Result<String> {
        let doc = SnapshotRef {
            name: &self.name,
            schema: &self.schema,
            data: &self.data,
        };
        Ok(serde_json::to_string(&doc)?)
    }

    /// Rebuild a store from a checkpoint document, schema included.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: SnapshotDoc = serde_json::from_str(json)?;
        Ok(Self {
            name: doc.name,
            data: doc.data,
            schema: doc.schema,
            widen_numeric: false,
            observers: Vec::new(),
            next_observer: 0,
        })
    }

    /// Snapshot to a JSON file, creating parent directories as needed.
    ///
    /// The write is atomic: a sibling temp file is written first, then
    /// renamed over the destination.
    pub fn snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let doc = SnapshotRef {
            name: &self.name,
            schema: &self.schema,
            data: &self.data,
        };
        let json = serde_json::to_string_pretty(&doc)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &json)?;
        fs::rename(&tmp_path, path)?;
        debug!(store = %self.name, path = %path.display(), "store snapshot saved");
        Ok(())
    }

    /// Restore a store from a snapshot file.
    pub fn restore(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let store = Self::from_json(&json)?;
        debug!(store = %store.name, path = %path.display(), "store restored");
        Ok(store)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("schema", &self.schema)
            .finish()
    }
}

/// Equality over name, schema, and data; observers are not compared.
impl PartialEq for Store {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.schema == other.schema && self.data == other.data
    }
}
