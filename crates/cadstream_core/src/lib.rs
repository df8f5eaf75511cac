//! # cadstream_core - Assembly Engine Foundations
//!
//! Shared vocabulary of the assembly streaming engine:
//! - Node identifier schemes and engine keys
//! - Error taxonomy
//! - Bounding boxes and projected-size math
//! - Streaming configuration
//! - Tree lifecycle callbacks
//! - The rendering engine boundary and an in-memory engine
//!
//! ## Example
//!
//! ```ignore
//! use cadstream_core::prelude::*;
//!
//! let offset = NodeIdOffset::new(100);
//! let runtime = RuntimeNodeId::from_authored(AuthoredNodeId::new(5), offset).unwrap();
//! assert_eq!(runtime.raw(), 105);
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod id;
pub mod math;

pub use config::{BoundingPreviewMode, ConfigError, StreamingConfig};
pub use engine::{
    Attribute, AttributeKind, EngineAttachRequest, EngineAttachment, MemoryEngine, MemoryModel,
    ModelSource, ModelStream, ScEngine,
};
pub use error::{EngineError, LoadError, LoadResult, ParseError, TreeError, TreeResult};
pub use events::{CallbackManager, EventRecorder, LoadId, Priority, SubscriberId, TreeEvent};
pub use id::{
    AuthoredNodeId, DynamicIdGenerator, DynamicNodeId, InclusionKey, InstanceHandle, InstanceKey,
    MeshKey, ModelKey, NodeIdOffset, RuntimeNodeId,
};
pub use math::{matrix_from_array, matrix_to_array, BoundingBox, MatrixArray};

/// Prelude - commonly used types
pub mod prelude {
    pub use crate::config::{BoundingPreviewMode, StreamingConfig};
    pub use crate::engine::{EngineAttachRequest, EngineAttachment, MemoryEngine, ModelSource, ScEngine};
    pub use crate::error::{EngineError, LoadError, ParseError, TreeError};
    pub use crate::events::{CallbackManager, TreeEvent};
    pub use crate::id::{
        AuthoredNodeId, DynamicNodeId, InclusionKey, InstanceHandle, InstanceKey, MeshKey, ModelKey,
        NodeIdOffset, RuntimeNodeId,
    };
    pub use crate::math::BoundingBox;
}
