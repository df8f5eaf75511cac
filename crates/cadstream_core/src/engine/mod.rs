//! Rendering engine boundary
//!
//! The tree engine never renders; it issues intents to an [`ScEngine`] and
//! receives opaque keys back. [`MemoryEngine`] is a complete in-memory
//! implementation for headless sessions and tests.

mod memory;

pub use memory::{MemoryEngine, MemoryModel};

use crate::error::EngineError;
use crate::id::{InclusionKey, InstanceHandle, MeshKey, ModelKey};
use crate::math::BoundingBox;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use glam::Mat4;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where an external model's data comes from
#[derive(Clone, Debug, PartialEq)]
pub enum ModelSource {
    /// Raw SCS bytes
    Buffer(Arc<[u8]>),
    /// A model the engine can fetch by name
    Named(String),
}

impl ModelSource {
    /// Wrap a byte buffer
    pub fn buffer(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Buffer(Arc::from(bytes.into()))
    }

    /// Reference a named model
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

/// Request for one low-level attach
#[derive(Clone, Debug)]
pub struct EngineAttachRequest {
    /// Model data
    pub source: ModelSource,
    /// Human-readable model name, for logs and diagnostics
    pub label: String,
    /// Inclusion the new model is attached under, if any
    pub parent_inclusion: Option<InclusionKey>,
    /// Placement of the new inclusion
    pub matrix: Mat4,
    /// Attach without making geometry visible
    pub invisible: bool,
}

/// Result of one low-level attach
#[derive(Clone, Debug)]
pub struct EngineAttachment {
    /// Effective key of the attached model
    pub model_key: ModelKey,
    /// Key of the created inclusion
    pub inclusion_key: InclusionKey,
    /// Structure data embedded in the model, if any
    pub assembly_data: Option<Arc<[u8]>>,
    /// Number of prototype instances the engine created
    pub prototype_instance_count: u32,
    /// Model bounds, when known
    pub bounds: Option<BoundingBox>,
    /// Engine memory consumed by the model
    pub memory_bytes: u64,
}

/// A streamed model: the master attach plus incremental structure segments
pub struct ModelStream {
    /// Master attach
    pub attachment: EngineAttachment,
    /// Assembly data segments in stream order
    pub segments: BoxStream<'static, Result<Vec<u8>, EngineError>>,
}

impl core::fmt::Debug for ModelStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModelStream")
            .field("attachment", &self.attachment)
            .finish_non_exhaustive()
    }
}

/// Attribute value kind
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeKind {
    #[default]
    String,
    Int,
    Float,
    Time,
}

/// One node attribute
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
    pub kind: AttributeKind,
}

impl Attribute {
    /// Create a string attribute
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            kind: AttributeKind::String,
        }
    }
}

/// Rendering engine interface consumed by the tree engine
#[async_trait]
pub trait ScEngine: Send + Sync {
    /// Attach a model, creating a new inclusion
    async fn attach_model(&self, request: EngineAttachRequest) -> Result<EngineAttachment, EngineError>;

    /// Open a streamed model
    async fn open_stream(&self, model_name: &str) -> Result<ModelStream, EngineError>;

    /// Detach inclusions and everything they own
    async fn detach_inclusions(&self, inclusions: &[InclusionKey]) -> Result<(), EngineError>;

    /// Create an instance of a mesh outside any attached model
    async fn create_mesh_instance(
        &self,
        mesh: MeshKey,
        matrix: Mat4,
        visible: bool,
    ) -> Result<InstanceHandle, EngineError>;

    /// Destroy instances
    async fn delete_instances(&self, instances: &[InstanceHandle]) -> Result<(), EngineError>;

    /// Destroy meshes
    async fn delete_meshes(&self, meshes: &[MeshKey]) -> Result<(), EngineError>;

    /// Set instance visibility
    async fn set_visibility(&self, instances: &[InstanceHandle], visible: bool) -> Result<(), EngineError>;

    /// Set instance matrices
    async fn set_instance_matrix(&self, instances: &[InstanceHandle], matrix: Mat4) -> Result<(), EngineError>;

    /// Set the placement of an inclusion
    async fn set_inclusion_matrix(&self, inclusion: InclusionKey, matrix: Mat4) -> Result<(), EngineError>;

    /// World bounds of a set of instances
    async fn bounding(&self, instances: &[InstanceHandle]) -> Result<BoundingBox, EngineError>;

    /// Metadata attached to an instance
    async fn request_attributes(&self, instance: InstanceHandle) -> Result<Vec<Attribute>, EngineError>;
}
