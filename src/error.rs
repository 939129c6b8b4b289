use thiserror::Error;

use crate::store::TypeTag;

/// Crate-wide result alias.
pub type Result<T, E = FlowError> = std::result::Result<T, E>;

/// Every failure the engine can surface.
///
/// Phase errors (`PrepFailed`, `ExecFailed`, `PostFailed`) wrap the original
/// cause so callers can walk the chain via `std::error::Error::source`.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("no key '{key}' in {scope}")]
    MissingKey { scope: String, key: String },

    #[error("store '{store}': key '{key}' expects {expected}, got {actual}")]
    TypeKind {
        store: String,
        key: String,
        expected: TypeTag,
        actual: &'static str,
    },

    #[error("node '{node}': prep failed: {source}")]
    PrepFailed {
        node: String,
        #[source]
        source: Box<FlowError>,
    },

    #[error("node '{node}': exec failed after {attempts} attempt(s): {source}")]
    ExecFailed {
        node: String,
        attempts: u32,
        #[source]
        source: Box<FlowError>,
    },

    #[error("node '{node}': post failed: {source}")]
    PostFailed {
        node: String,
        #[source]
        source: Box<FlowError>,
    },

    #[error("max_steps exceeded (limit {limit})")]
    MaxStepsExceeded { limit: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("{0}")]
    Message(String),
}

impl FlowError {
    /// Free-form error for user node code.
    pub fn msg(message: impl Into<String>) -> Self {
        FlowError::Message(message.into())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Malformed(err.to_string())
    }
}
