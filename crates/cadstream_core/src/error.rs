//! Error taxonomy for the assembly engine
//!
//! - [`ParseError`]: malformed structure documents or assembly data
//! - [`LoadError`]: anything that fails one load call, including cancellation
//!   and missing external models
//! - [`EngineError`]: failures reported by the rendering engine
//! - [`TreeError`]: programmer misuse of the tree registry

use crate::id::{InclusionKey, ModelKey, RuntimeNodeId};
use thiserror::Error;

/// Malformed XML or binary assembly data
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Malformed XML: {0}")]
    Xml(String),

    #[error("Missing required attribute '{attribute}' on <{element}>")]
    MissingAttribute { element: String, attribute: String },

    #[error("Invalid value '{value}' for attribute '{attribute}' on <{element}>")]
    InvalidAttribute {
        element: String,
        attribute: String,
        value: String,
    },

    #[error("Unexpected element <{0}>")]
    UnexpectedElement(String),

    #[error("Bad assembly data magic")]
    BadMagic,

    #[error("Unsupported assembly data version {found} (supported {min}..={max})")]
    UnsupportedVersion { found: u32, min: u32, max: u32 },

    #[error("Truncated assembly data: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("Assembly data decode failed: {0}")]
    Decode(String),

    #[error("Record {child} references unknown parent {parent}")]
    OrphanRecord { child: u32, parent: u32 },

    #[error("Duplicate authored id {0}")]
    DuplicateAuthoredId(u32),
}

/// Failures reported by the rendering engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Unknown model key: {0}")]
    UnknownModelKey(ModelKey),

    #[error("Unknown inclusion key: {0}")]
    UnknownInclusionKey(InclusionKey),

    #[error("Engine allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Rendering context lost")]
    ContextLost,

    #[error("Engine rejected request: {0}")]
    Rejected(String),
}

/// Failure of one load call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Load cancelled")]
    Cancelled,

    #[error("Missing external model: {0}")]
    MissingModel(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid load target: {0}")]
    InvalidTarget(RuntimeNodeId),

    #[error("Batch failed after an earlier failure")]
    BatchFailed,

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),
}

impl LoadError {
    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error is a missing external model
    pub fn is_missing_model(&self) -> bool {
        matches!(self, Self::MissingModel(_))
            || matches!(self, Self::Engine(EngineError::UnknownModel(_)))
    }
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        LoadError::Io(e.to_string())
    }
}

/// Programmer misuse of the tree registry
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TreeError {
    #[error("Unknown node: {0}")]
    UnknownNode(RuntimeNodeId),

    #[error("Node {id} is not a {expected}")]
    WrongNodeType {
        id: RuntimeNodeId,
        expected: &'static str,
    },

    #[error("Node id already registered: {0}")]
    DuplicateNodeId(RuntimeNodeId),

    #[error("Invalid node id")]
    InvalidNodeId,

    #[error("Unknown or stale context")]
    UnknownContext,

    #[error("Entry is not a {0} context")]
    WrongContextType(&'static str),

    #[error("Node id range exhausted")]
    IdRangeExhausted,

    #[error("Key {key} already remapped to {existing}, refusing {requested}")]
    RemapConflict {
        key: u32,
        existing: u32,
        requested: u32,
    },
}

/// Result alias for tree operations
pub type TreeResult<T> = Result<T, TreeError>;

/// Result alias for load operations
pub type LoadResult<T> = Result<T, LoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_kinds() {
        assert!(LoadError::Cancelled.is_cancelled());
        assert!(LoadError::MissingModel("a.scs".into()).is_missing_model());
        assert!(LoadError::Engine(EngineError::UnknownModel("b".into())).is_missing_model());
        assert!(!LoadError::Io("disk".into()).is_cancelled());
    }

    #[test]
    fn test_parse_error_converts() {
        let err: LoadError = ParseError::BadMagic.into();
        assert!(matches!(err, LoadError::Parse(ParseError::BadMagic)));
        assert_eq!(err.to_string(), "Parse error: Bad assembly data magic");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: LoadError = io.into();
        assert!(matches!(err, LoadError::Io(msg) if msg.contains("gone")));
    }
}
