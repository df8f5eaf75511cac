//! In-memory engine
//!
//! Keeps every intent in plain maps. Attach calls yield to the scheduler a
//! configurable number of times so concurrent attaches genuinely interleave,
//! and the engine records peak attach concurrency and completion order.

use super::{Attribute, EngineAttachRequest, EngineAttachment, ModelSource, ModelStream, ScEngine};
use crate::error::EngineError;
use crate::id::{InclusionKey, InstanceHandle, InstanceKey, MeshKey, ModelKey};
use crate::math::BoundingBox;
use async_trait::async_trait;
use futures_util::stream;
use glam::Mat4;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Model key reserved for instances created outside attached models
const SESSION_MODEL: ModelKey = ModelKey(0);

/// A model known to the engine by name
#[derive(Clone, Debug, Default)]
pub struct MemoryModel {
    /// Structure data handed back on attach
    pub assembly_data: Vec<u8>,
    /// Additional structure segments delivered when streamed
    pub stream_segments: Vec<Vec<u8>>,
    /// Model bounds
    pub bounds: Option<BoundingBox>,
    /// Memory the model consumes once attached
    pub memory_bytes: u64,
}

#[derive(Clone, Debug)]
struct InstanceState {
    visible: bool,
    matrix: Mat4,
}

#[derive(Default)]
struct EngineState {
    models: HashMap<String, MemoryModel>,
    failing: HashSet<String>,
    next_model_key: u32,
    next_inclusion_key: u32,
    next_instance_key: u32,
    inclusions: HashMap<InclusionKey, (ModelKey, String)>,
    instances: HashMap<InstanceHandle, InstanceState>,
    visibility: HashMap<InstanceHandle, bool>,
    inclusion_matrices: HashMap<InclusionKey, Mat4>,
    meshes: HashSet<MeshKey>,
    attributes: HashMap<InstanceHandle, Vec<Attribute>>,
    active_attaches: usize,
    peak_attaches: usize,
    attach_started: Vec<String>,
    attach_completed: Vec<String>,
    detached: Vec<InclusionKey>,
    deleted_instances: Vec<InstanceHandle>,
    deleted_meshes: Vec<MeshKey>,
}

/// Engine that keeps every intent in memory
pub struct MemoryEngine {
    state: Mutex<EngineState>,
    attach_yields: usize,
}

impl MemoryEngine {
    /// Create an empty engine
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState {
                next_model_key: 1,
                next_inclusion_key: 1,
                next_instance_key: 1,
                ..Default::default()
            }),
            attach_yields: 4,
        }
    }

    /// Builder: number of scheduler yields inside each attach
    pub fn with_attach_yields(mut self, yields: usize) -> Self {
        self.attach_yields = yields;
        self
    }

    /// Shared handle
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Register a model fetchable by name
    pub fn register_model(&self, name: impl Into<String>, model: MemoryModel) {
        self.state.lock().models.insert(name.into(), model);
    }

    /// Make attaches of a model fail with an allocation error
    pub fn fail_model(&self, name: impl Into<String>) {
        self.state.lock().failing.insert(name.into());
    }

    /// Register a mesh usable by `create_mesh_instance`
    pub fn register_mesh(&self, mesh: MeshKey) {
        self.state.lock().meshes.insert(mesh);
    }

    /// Attach metadata to an instance
    pub fn set_attributes(&self, instance: InstanceHandle, attributes: Vec<Attribute>) {
        self.state.lock().attributes.insert(instance, attributes);
    }

    /// Highest number of attaches observed in flight at once
    pub fn peak_concurrent_attaches(&self) -> usize {
        self.state.lock().peak_attaches
    }

    /// Attaches currently in flight
    pub fn active_attaches(&self) -> usize {
        self.state.lock().active_attaches
    }

    /// Labels of attaches in start order
    pub fn attach_start_order(&self) -> Vec<String> {
        self.state.lock().attach_started.clone()
    }

    /// Labels of attaches in completion order
    pub fn attach_completion_order(&self) -> Vec<String> {
        self.state.lock().attach_completed.clone()
    }

    /// Live inclusions
    pub fn inclusion_count(&self) -> usize {
        self.state.lock().inclusions.len()
    }

    /// Check if an inclusion is live
    pub fn has_inclusion(&self, inclusion: InclusionKey) -> bool {
        self.state.lock().inclusions.contains_key(&inclusion)
    }

    /// Inclusions detached so far
    pub fn detached_inclusions(&self) -> Vec<InclusionKey> {
        self.state.lock().detached.clone()
    }

    /// Instances deleted so far
    pub fn deleted_instances(&self) -> Vec<InstanceHandle> {
        self.state.lock().deleted_instances.clone()
    }

    /// Meshes deleted so far
    pub fn deleted_meshes(&self) -> Vec<MeshKey> {
        self.state.lock().deleted_meshes.clone()
    }

    /// Last visibility set for an instance
    pub fn instance_visibility(&self, instance: InstanceHandle) -> Option<bool> {
        let state = self.state.lock();
        state
            .visibility
            .get(&instance)
            .copied()
            .or_else(|| state.instances.get(&instance).map(|i| i.visible))
    }

    /// Current placement of an inclusion
    pub fn inclusion_matrix(&self, inclusion: InclusionKey) -> Option<Mat4> {
        self.state.lock().inclusion_matrices.get(&inclusion).copied()
    }

    fn model_is_live(state: &EngineState, model: ModelKey) -> bool {
        model == SESSION_MODEL || state.inclusions.values().any(|(m, _)| *m == model)
    }

    fn begin_attach(&self, request: &EngineAttachRequest) -> Result<EngineAttachment, EngineError> {
        let mut state = self.state.lock();

        if state.failing.contains(&request.label) {
            return Err(EngineError::AllocationFailed(request.label.clone()));
        }
        if let Some(parent) = request.parent_inclusion {
            if !state.inclusions.contains_key(&parent) {
                return Err(EngineError::UnknownInclusionKey(parent));
            }
        }

        let (assembly_data, bounds, memory_bytes) = match &request.source {
            ModelSource::Buffer(bytes) => (Some(bytes.clone()), None, bytes.len() as u64),
            ModelSource::Named(name) => {
                let model = state
                    .models
                    .get(name)
                    .ok_or_else(|| EngineError::UnknownModel(name.clone()))?;
                let data = (!model.assembly_data.is_empty())
                    .then(|| Arc::<[u8]>::from(model.assembly_data.clone()));
                (data, model.bounds, model.memory_bytes)
            }
        };

        let model_key = ModelKey(state.next_model_key);
        state.next_model_key += 1;
        let inclusion_key = InclusionKey(state.next_inclusion_key);
        state.next_inclusion_key += 1;

        state.active_attaches += 1;
        state.peak_attaches = state.peak_attaches.max(state.active_attaches);
        state.attach_started.push(request.label.clone());

        Ok(EngineAttachment {
            model_key,
            inclusion_key,
            assembly_data,
            prototype_instance_count: 0,
            bounds,
            memory_bytes,
        })
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScEngine for MemoryEngine {
    async fn attach_model(&self, request: EngineAttachRequest) -> Result<EngineAttachment, EngineError> {
        let attachment = self.begin_attach(&request)?;

        for _ in 0..self.attach_yields {
            tokio::task::yield_now().await;
        }

        let mut state = self.state.lock();
        state.active_attaches -= 1;
        state.attach_completed.push(request.label.clone());
        state
            .inclusions
            .insert(attachment.inclusion_key, (attachment.model_key, request.label.clone()));
        state.inclusion_matrices.insert(attachment.inclusion_key, request.matrix);
        log::trace!(
            "MemoryEngine: attached '{}' as model {} inclusion {}",
            request.label,
            attachment.model_key,
            attachment.inclusion_key
        );
        Ok(attachment)
    }

    async fn open_stream(&self, model_name: &str) -> Result<ModelStream, EngineError> {
        let segments = {
            let state = self.state.lock();
            state
                .models
                .get(model_name)
                .map(|m| m.stream_segments.clone())
                .ok_or_else(|| EngineError::UnknownModel(model_name.to_string()))?
        };

        let attachment = self
            .attach_model(EngineAttachRequest {
                source: ModelSource::named(model_name),
                label: model_name.to_string(),
                parent_inclusion: None,
                matrix: Mat4::IDENTITY,
                invisible: false,
            })
            .await?;

        Ok(ModelStream {
            attachment,
            segments: Box::pin(stream::iter(segments.into_iter().map(Ok))),
        })
    }

    async fn detach_inclusions(&self, inclusions: &[InclusionKey]) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        for key in inclusions {
            if state.inclusions.remove(key).is_none() {
                return Err(EngineError::UnknownInclusionKey(*key));
            }
            state.inclusion_matrices.remove(key);
            state.detached.push(*key);
        }
        Ok(())
    }

    async fn create_mesh_instance(
        &self,
        mesh: MeshKey,
        matrix: Mat4,
        visible: bool,
    ) -> Result<InstanceHandle, EngineError> {
        let mut state = self.state.lock();
        if !state.meshes.contains(&mesh) {
            return Err(EngineError::Rejected(format!("unknown mesh {}", mesh)));
        }
        let handle = InstanceHandle::new(SESSION_MODEL, InstanceKey(state.next_instance_key));
        state.next_instance_key += 1;
        state.instances.insert(handle, InstanceState { visible, matrix });
        Ok(handle)
    }

    async fn delete_instances(&self, instances: &[InstanceHandle]) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        for handle in instances {
            state.instances.remove(handle);
            state.visibility.remove(handle);
            state.deleted_instances.push(*handle);
        }
        Ok(())
    }

    async fn delete_meshes(&self, meshes: &[MeshKey]) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        for mesh in meshes {
            state.meshes.remove(mesh);
            state.deleted_meshes.push(*mesh);
        }
        Ok(())
    }

    async fn set_visibility(&self, instances: &[InstanceHandle], visible: bool) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        for handle in instances {
            if !Self::model_is_live(&state, handle.model) {
                return Err(EngineError::UnknownModelKey(handle.model));
            }
            if let Some(instance) = state.instances.get_mut(handle) {
                instance.visible = visible;
            }
            state.visibility.insert(*handle, visible);
        }
        Ok(())
    }

    async fn set_instance_matrix(&self, instances: &[InstanceHandle], matrix: Mat4) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        for handle in instances {
            if let Some(instance) = state.instances.get_mut(handle) {
                instance.matrix = matrix;
            }
        }
        Ok(())
    }

    async fn set_inclusion_matrix(&self, inclusion: InclusionKey, matrix: Mat4) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.inclusions.contains_key(&inclusion) {
            return Err(EngineError::UnknownInclusionKey(inclusion));
        }
        state.inclusion_matrices.insert(inclusion, matrix);
        Ok(())
    }

    async fn bounding(&self, instances: &[InstanceHandle]) -> Result<BoundingBox, EngineError> {
        let state = self.state.lock();
        let mut bounds = BoundingBox::EMPTY;
        for handle in instances {
            if let Some(instance) = state.instances.get(handle) {
                let unit = BoundingBox::new(glam::Vec3::ZERO, glam::Vec3::ONE);
                bounds = bounds.merge(&unit.transform(&instance.matrix));
            }
        }
        Ok(bounds)
    }

    async fn request_attributes(&self, instance: InstanceHandle) -> Result<Vec<Attribute>, EngineError> {
        Ok(self
            .state
            .lock()
            .attributes
            .get(&instance)
            .cloned()
            .unwrap_or_default())
    }
}
