//! Model structure facade
//!
//! [`ModelStructure`] owns one session: the shared [`AssemblyTree`], the
//! engine, the callback dispatcher, the attacher and the loader. Mutations go
//! to the tree first and are mirrored to the engine afterwards, with the tree
//! lock released before any engine call.

use crate::attacher::ScAttacher;
use crate::loader::{LoadOutcome, TreeLoader};
use cadstream_core::config::{BoundingPreviewMode, ConfigError, StreamingConfig};
use cadstream_core::engine::{Attribute, ScEngine};
use cadstream_core::error::{LoadError, LoadResult, TreeError};
use cadstream_core::events::{CallbackManager, TreeEvent};
use cadstream_core::id::{InstanceHandle, MeshKey, RuntimeNodeId};
use cadstream_core::math::BoundingBox;
use cadstream_tasks::LazyFuture;
use cadstream_tree::{AssemblyTree, DeleteOutcome, DeletionReport, ExternalModelInfo, LoadStatus, NodeKind};
use futures_util::future::BoxFuture;
use glam::Mat4;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type AttributeCache = HashMap<RuntimeNodeId, Arc<LazyFuture<Vec<Attribute>, LoadError>>>;

/// One assembly session over an engine
pub struct ModelStructure {
    tree: Arc<Mutex<AssemblyTree>>,
    engine: Arc<dyn ScEngine>,
    callbacks: Arc<CallbackManager>,
    attacher: ScAttacher,
    loader: TreeLoader,
    config: StreamingConfig,
    attributes: Mutex<AttributeCache>,
}

impl ModelStructure {
    /// Create a session over `engine`
    pub fn new(engine: Arc<dyn ScEngine>, config: StreamingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let tree = Arc::new(Mutex::new(AssemblyTree::new()));
        let callbacks = Arc::new(CallbackManager::new());
        let attacher = ScAttacher::new(engine.clone(), &config);
        let loader = TreeLoader::new(tree.clone(), attacher.clone(), callbacks.clone(), config.clone());

        log::info!(
            "ModelStructure: session created, {} concurrent attachment(s), cutoff scale {}",
            config.max_concurrent_attachments,
            config.stream_cutoff_scale
        );
        Ok(Self {
            tree,
            engine,
            callbacks,
            attacher,
            loader,
            config,
            attributes: Mutex::new(HashMap::new()),
        })
    }

    /// Create a session configured from TOML text
    pub fn from_toml_str(engine: Arc<dyn ScEngine>, toml: &str) -> Result<Self, ConfigError> {
        Self::new(engine, StreamingConfig::from_toml_str(toml)?)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn tree(&self) -> &Arc<Mutex<AssemblyTree>> {
        &self.tree
    }

    /// Run `f` against the tree
    pub fn with_tree<R>(&self, f: impl FnOnce(&AssemblyTree) -> R) -> R {
        f(&*self.tree.lock())
    }

    pub fn root_id(&self) -> RuntimeNodeId {
        self.tree.lock().root_id()
    }

    pub fn engine(&self) -> &Arc<dyn ScEngine> {
        &self.engine
    }

    pub fn callbacks(&self) -> &Arc<CallbackManager> {
        &self.callbacks
    }

    pub fn attacher(&self) -> &ScAttacher {
        &self.attacher
    }

    pub fn loader(&self) -> &TreeLoader {
        &self.loader
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create an empty container node
    pub fn create_node(
        &self,
        parent: RuntimeNodeId,
        name: &str,
        matrix: Mat4,
        visible: bool,
    ) -> LoadResult<RuntimeNodeId> {
        let id = self
            .tree
            .lock()
            .create_node(parent, NodeKind::ProductOccurrence, name, matrix, visible)?;
        log::debug!("ModelStructure: created node {} '{}' under {}", id, name, parent);
        Ok(id)
    }

    /// Instantiate a mesh in the engine and register a body node for it
    pub async fn create_mesh_instance(
        &self,
        parent: RuntimeNodeId,
        name: &str,
        mesh: MeshKey,
        matrix: Mat4,
        visible: bool,
    ) -> LoadResult<RuntimeNodeId> {
        let (world, shown) = {
            let tree = self.tree.lock();
            if tree.lookup_container_node(parent).is_none() {
                return Err(LoadError::InvalidTarget(parent));
            }
            let world = tree.net_matrix(parent).unwrap_or(Mat4::IDENTITY) * matrix;
            (world, visible && tree.is_effectively_shown(parent))
        };
        let instance = self.engine.create_mesh_instance(mesh, world, shown).await?;

        let created = self
            .tree
            .lock()
            .create_mesh_instance_node(parent, name, mesh, instance, matrix, visible);
        match created {
            Ok(id) => {
                self.callbacks.trigger(TreeEvent::NodesLoaded { nodes: vec![id] });
                Ok(id)
            }
            Err(e) => {
                log::warn!("ModelStructure: parent {} vanished while instancing mesh {}", parent, mesh);
                if let Err(cleanup) = self.engine.delete_instances(&[instance]).await {
                    log::error!("ModelStructure: deleting orphan instance {} failed: {}", instance, cleanup);
                }
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Delete a node and its subtree, waiting for the engine
    ///
    /// A protected node anywhere in the subtree makes this a no-op returning
    /// [`DeleteOutcome::Blocked`].
    pub async fn delete_node(&self, id: RuntimeNodeId) -> LoadResult<DeleteOutcome> {
        let outcome = self.tree.lock().delete_node(id)?;
        let report = match outcome {
            DeleteOutcome::Deleted(report) => report,
            DeleteOutcome::Blocked { blocker } => {
                log::warn!("ModelStructure: delete of {} blocked by {}", id, blocker);
                return Ok(DeleteOutcome::Blocked { blocker });
            }
        };

        let killed = self.attacher.kill_anchored(&report.nodes);
        if killed > 0 {
            log::debug!("ModelStructure: dropped {} queued attachment(s) under {}", killed, id);
        }
        {
            let mut cache = self.attributes.lock();
            for node in &report.nodes {
                cache.remove(node);
            }
        }
        self.release(&report).await?;

        self.callbacks.trigger(TreeEvent::SubtreeDeleted { roots: vec![id] });
        Ok(DeleteOutcome::Deleted(report))
    }

    /// Release engine resources listed in a deletion report
    async fn release(&self, report: &DeletionReport) -> LoadResult<()> {
        if !report.inclusions.is_empty() {
            self.attacher.release_inclusions(&report.inclusions);
            self.engine.detach_inclusions(&report.inclusions).await?;
        }
        if !report.instances.is_empty() {
            self.engine.delete_instances(&report.instances).await?;
        }
        if !report.meshes.is_empty() {
            self.engine.delete_meshes(&report.meshes).await?;
        }
        if !report.deferred_meshes.is_empty() {
            log::debug!(
                "ModelStructure: {} mesh(es) kept alive by blockers",
                report.deferred_meshes.len()
            );
        }
        Ok(())
    }

    pub fn prevent_node_deletion(&self, id: RuntimeNodeId) -> LoadResult<()> {
        Ok(self.tree.lock().prevent_node_deletion(id)?)
    }

    pub fn allow_node_deletion(&self, id: RuntimeNodeId) -> bool {
        self.tree.lock().allow_node_deletion(id)
    }

    pub fn prevent_mesh_deletion(&self, mesh: MeshKey) {
        self.tree.lock().prevent_mesh_deletion(mesh);
    }

    /// Lift one mesh blocker, deleting the mesh if its nodes are already gone
    pub async fn allow_mesh_deletion(&self, mesh: MeshKey) -> LoadResult<bool> {
        let released = self.tree.lock().allow_mesh_deletion(mesh);
        match released {
            Some(mesh) => {
                self.engine.delete_meshes(&[mesh]).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ========================================================================
    // View state
    // ========================================================================

    async fn push_visibility(&self, shown: Vec<InstanceHandle>, hidden: Vec<InstanceHandle>) -> LoadResult<()> {
        if !shown.is_empty() {
            self.engine.set_visibility(&shown, true).await?;
        }
        if !hidden.is_empty() {
            self.engine.set_visibility(&hidden, false).await?;
        }
        Ok(())
    }

    fn split_visibility(tree: &AssemblyTree, nodes: &[RuntimeNodeId]) -> (Vec<InstanceHandle>, Vec<InstanceHandle>) {
        let mut shown = Vec::new();
        let mut hidden = Vec::new();
        for node in nodes {
            for (instance, visible) in tree.effective_instance_visibility(*node) {
                if visible {
                    shown.push(instance);
                } else {
                    hidden.push(instance);
                }
            }
        }
        (shown, hidden)
    }

    /// Show or hide nodes
    pub async fn set_node_visibility(&self, ids: &[RuntimeNodeId], shown: bool) -> LoadResult<()> {
        let (changed, on, off) = {
            let mut tree = self.tree.lock();
            let mut changed = Vec::new();
            for id in ids {
                if tree.set_node_visibility(*id, shown)? {
                    changed.push(*id);
                }
            }
            let (on, off) = Self::split_visibility(&tree, &changed);
            (changed, on, off)
        };
        if changed.is_empty() {
            return Ok(());
        }
        self.push_visibility(on, off).await?;
        self.callbacks.trigger(TreeEvent::VisibilityChanged { nodes: changed });
        Ok(())
    }

    /// Restore authored visibility below a node
    pub async fn reset_node_visibility(&self, id: RuntimeNodeId) -> LoadResult<()> {
        let (changed, on, off) = {
            let mut tree = self.tree.lock();
            let changed = tree.reset_node_visibility(id)?;
            let (on, off) = Self::split_visibility(&tree, &[id]);
            (changed, on, off)
        };
        if changed.is_empty() {
            return Ok(());
        }
        self.push_visibility(on, off).await?;
        self.callbacks.trigger(TreeEvent::VisibilityChanged { nodes: changed });
        Ok(())
    }

    async fn push_matrices(&self, matrices: Vec<(InstanceHandle, Mat4)>) -> LoadResult<()> {
        for (instance, matrix) in matrices {
            self.engine.set_instance_matrix(&[instance], matrix).await?;
        }
        Ok(())
    }

    /// Override a node's local matrix
    pub async fn set_node_matrix(&self, id: RuntimeNodeId, matrix: Mat4) -> LoadResult<()> {
        let matrices = {
            let mut tree = self.tree.lock();
            tree.set_node_matrix(id, matrix)?;
            tree.instance_matrices(id)
        };
        self.push_matrices(matrices).await
    }

    /// Restore a node's authored matrix
    pub async fn reset_node_matrix(&self, id: RuntimeNodeId) -> LoadResult<()> {
        let matrices = {
            let mut tree = self.tree.lock();
            tree.reset_node_matrix(id)?;
            tree.instance_matrices(id)
        };
        self.push_matrices(matrices).await
    }

    /// Update the camera driving attachment priorities
    pub fn set_camera(&self, view_projection: Mat4) {
        self.attacher.priorities().set_camera(view_projection);
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    /// Mark nodes as directly requested
    ///
    /// Pending attachments anchored in the nodes' subtrees or ancestor chains
    /// jump the queue. Unloaded placeholders below the nodes start attaching;
    /// one load future is returned per placeholder.
    pub fn request_nodes(&self, ids: &[RuntimeNodeId]) -> Vec<BoxFuture<'static, LoadResult<LoadOutcome>>> {
        let (chain, unloaded) = {
            let tree = self.tree.lock();
            let mut chain = Vec::new();
            let mut unloaded: Vec<(RuntimeNodeId, ExternalModelInfo)> = Vec::new();
            for id in ids {
                if !tree.contains_node(*id) {
                    continue;
                }
                chain.extend(tree.ancestors(*id));
                for node in std::iter::once(*id).chain(tree.descendants(*id)) {
                    chain.push(node);
                    let Some(tree_node) = tree.lookup_any_tree_node(node) else {
                        continue;
                    };
                    if let Some(name) = tree_node.external_model() {
                        if tree_node.status() == LoadStatus::Unloaded {
                            unloaded.push((
                                node,
                                ExternalModelInfo {
                                    name: name.to_string(),
                                    bounds: tree_node.bounds(),
                                },
                            ));
                        }
                    }
                }
            }
            chain.sort();
            chain.dedup();
            unloaded.sort_by_key(|(node, _)| *node);
            unloaded.dedup_by_key(|(node, _)| *node);
            (chain, unloaded)
        };

        self.attacher.notify_direct_request(&chain);
        unloaded
            .into_iter()
            .map(|(node, info)| self.loader.attach_by_external_model_info(node, info))
            .collect()
    }

    /// Bounding boxes to draw in place of models, per the preview mode
    pub fn preview_boxes(&self) -> Vec<(RuntimeNodeId, BoundingBox)> {
        let mode = self.config.bounding_preview_mode;
        if mode == BoundingPreviewMode::None {
            return Vec::new();
        }
        let tree = self.tree.lock();
        let root = tree.root_id();
        tree.descendants(root)
            .into_iter()
            .filter(|id| {
                tree.lookup_any_tree_node(*id).is_some_and(|node| {
                    node.external_model().is_some()
                        && (mode == BoundingPreviewMode::All || node.status() != LoadStatus::Loaded)
                })
            })
            .filter_map(|id| tree.world_bounds(id).map(|bounds| (id, bounds)))
            .collect()
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    /// Attributes of a node, fetched from the engine once when not authored
    pub async fn node_attributes(&self, id: RuntimeNodeId) -> LoadResult<Vec<Attribute>> {
        let attributes = {
            let tree = self.tree.lock();
            let node = tree
                .lookup_any_tree_node(id)
                .ok_or(LoadError::Tree(TreeError::UnknownNode(id)))?;
            let mut cache = self.attributes.lock();
            cache
                .entry(id)
                .or_insert_with(|| match node.attributes() {
                    Some(authored) => Arc::new(LazyFuture::resolved(Ok(authored))),
                    None => {
                        let engine = self.engine.clone();
                        let instance = node.instances().first().copied();
                        Arc::new(LazyFuture::new(move || async move {
                            match instance {
                                Some(instance) => engine.request_attributes(instance).await.map_err(LoadError::from),
                                None => Ok(Vec::new()),
                            }
                        }))
                    }
                })
                .clone()
        };
        attributes.force().await
    }

    // ========================================================================
    // Session
    // ========================================================================

    async fn clear(&self) -> LoadResult<()> {
        let cancelled = self.loader.cancel_pending_loads();
        self.attacher.reset().await;
        let report = self.tree.lock().reset();
        self.attributes.lock().clear();
        self.loader.on_session_reset();
        log::info!(
            "ModelStructure: cleared {} node(s), cancelled {} load(s)",
            report.nodes.len(),
            cancelled
        );
        self.release(&report).await
    }

    /// Remove everything below the root
    pub async fn reset(&self) -> LoadResult<()> {
        let result = self.clear().await;
        self.callbacks.trigger(TreeEvent::ModelSwitched { clear_only: true });
        result
    }

    /// Replace the scene with a streamed model
    pub async fn switch_to_model(&self, model_name: &str) -> LoadResult<LoadOutcome> {
        if let Err(e) = self.clear().await {
            log::error!("ModelStructure: releasing the previous model failed: {}", e);
        }
        let outcome = self.loader.load_by_stream(model_name, None).await?;
        self.callbacks.trigger(TreeEvent::ModelSwitched { clear_only: false });
        Ok(outcome)
    }
}

impl core::fmt::Debug for ModelStructure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModelStructure")
            .field("nodes", &self.tree.lock().node_count())
            .field("loader", &self.loader)
            .field("attacher", &self.attacher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadstream_core::engine::MemoryEngine;
    use cadstream_core::events::EventRecorder;

    fn session() -> (ModelStructure, Arc<MemoryEngine>) {
        let engine = MemoryEngine::new().shared();
        let config = StreamingConfig {
            reprioritize_debounce_ms: 0,
            ..Default::default()
        };
        (ModelStructure::new(engine.clone(), config).unwrap(), engine)
    }

    #[tokio::test]
    async fn test_mesh_instance_lifecycle() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (model, engine) = session();
        let events = EventRecorder::attach(model.callbacks());
        engine.register_mesh(MeshKey(3));

        let root = model.root_id();
        let group = model.create_node(root, "group", Mat4::IDENTITY, true).unwrap();
        let body = model
            .create_mesh_instance(group, "body", MeshKey(3), Mat4::IDENTITY, true)
            .await
            .unwrap();
        let instance = model.with_tree(|t| t.lookup_body_node(body).unwrap().instances()[0]);
        assert_eq!(engine.instance_visibility(instance), Some(true));

        model.set_node_visibility(&[group], false).await.unwrap();
        assert_eq!(engine.instance_visibility(instance), Some(false));
        assert_eq!(events.count("visibilityChanged"), 1);

        let outcome = model.delete_node(group).await.unwrap();
        assert!(outcome.is_deleted());
        assert_eq!(engine.deleted_instances(), vec![instance]);
        assert_eq!(engine.deleted_meshes(), vec![MeshKey(3)]);
        assert_eq!(events.count("subtreeDeleted"), 1);
    }

    #[tokio::test]
    async fn test_mesh_blocker_defers_engine_delete() {
        let (model, engine) = session();
        engine.register_mesh(MeshKey(5));
        let root = model.root_id();
        let body = model
            .create_mesh_instance(root, "body", MeshKey(5), Mat4::IDENTITY, true)
            .await
            .unwrap();

        model.prevent_mesh_deletion(MeshKey(5));
        model.delete_node(body).await.unwrap();
        assert!(engine.deleted_meshes().is_empty());

        assert!(model.allow_mesh_deletion(MeshKey(5)).await.unwrap());
        assert_eq!(engine.deleted_meshes(), vec![MeshKey(5)]);
    }

    #[tokio::test]
    async fn test_instance_creation_needs_container() {
        let (model, _) = session();
        let root = model.root_id();
        let result = model
            .create_mesh_instance(root, "body", MeshKey(1), Mat4::IDENTITY, true)
            .await;
        assert!(matches!(result, Err(LoadError::Engine(_))));

        let (model, engine) = session();
        engine.register_mesh(MeshKey(1));
        let body = model
            .create_mesh_instance(model.root_id(), "body", MeshKey(1), Mat4::IDENTITY, true)
            .await
            .unwrap();
        let nested = model
            .create_mesh_instance(body, "nested", MeshKey(1), Mat4::IDENTITY, true)
            .await;
        assert_eq!(nested.unwrap_err(), LoadError::InvalidTarget(body));
    }

    #[tokio::test]
    async fn test_engine_attributes_cached() {
        let (model, engine) = session();
        engine.register_mesh(MeshKey(2));
        let body = model
            .create_mesh_instance(model.root_id(), "body", MeshKey(2), Mat4::IDENTITY, true)
            .await
            .unwrap();
        let instance = model.with_tree(|t| t.lookup_body_node(body).unwrap().instances()[0]);
        engine.set_attributes(instance, vec![Attribute::new("Material", "Steel")]);

        let first = model.node_attributes(body).await.unwrap();
        assert_eq!(first[0].value, "Steel");

        engine.set_attributes(instance, Vec::new());
        assert_eq!(model.node_attributes(body).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_reset_clears_session() {
        let (model, _) = session();
        let events = EventRecorder::attach(model.callbacks());
        let root = model.root_id();
        model.create_node(root, "a", Mat4::IDENTITY, true).unwrap();
        model.create_node(root, "b", Mat4::IDENTITY, true).unwrap();

        model.reset().await.unwrap();
        assert_eq!(model.with_tree(|t| t.node_count()), 1);
        assert_eq!(
            events.events().last(),
            Some(&TreeEvent::ModelSwitched { clear_only: true })
        );
    }
}
