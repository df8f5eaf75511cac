//! Tree nodes
//!
//! Container nodes form the visible hierarchy; body nodes own engine
//! instances. Both share [`TreeNode`], discriminated by [`NodeKind`].

use crate::arena::EntryKey;
use crate::info::AttributeInfo;
use crate::visibility::BranchVisibility;
use cadstream_core::engine::{Attribute, AttributeKind};
use cadstream_core::id::{InstanceHandle, MeshKey, RuntimeNodeId};
use cadstream_core::math::BoundingBox;
use cadstream_tasks::Lazy;
use glam::Mat4;
use serde::{Deserialize, Serialize};
use std::cell::Cell;

/// Kind of tree node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Occurrence of a part or assembly
    ProductOccurrence,
    /// Saved CAD view
    CadView,
    /// Group of annotations
    PmiGroup,
    /// Root of one CAD configuration
    Configuration,
    /// Mesh-bearing body
    Mesh,
    /// Annotation-geometry-bearing body
    Pmi,
    /// View-frame-bearing body
    ViewFrame,
}

impl NodeKind {
    /// Check if the node may hold child nodes
    pub const fn is_container(&self) -> bool {
        matches!(
            self,
            Self::ProductOccurrence | Self::CadView | Self::PmiGroup | Self::Configuration
        )
    }

    /// Check if the node owns engine instances
    pub const fn is_body(&self) -> bool {
        !self.is_container()
    }

    /// Human-readable kind name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ProductOccurrence => "product occurrence",
            Self::CadView => "CAD view",
            Self::PmiGroup => "PMI group",
            Self::Configuration => "CAD configuration",
            Self::Mesh => "mesh body",
            Self::Pmi => "PMI body",
            Self::ViewFrame => "view frame",
        }
    }
}

/// Load state of an external-model placeholder
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadStatus {
    #[default]
    Loaded,
    Unloaded,
    Loading,
    Missing,
    Failed,
}

/// Authoring flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFlags {
    /// CAD view shown when the model opens
    pub default_view: bool,
    /// CAD view carrying annotations only
    pub annotation_view: bool,
    /// Configuration active when the model opens
    pub default_configuration: bool,
    /// Node is a placeholder for an external model
    pub external_model: bool,
    /// Node was created at runtime
    pub dynamic: bool,
    /// Node is excluded from the product hierarchy view
    pub out_of_hierarchy: bool,
}

/// One node of the visible hierarchy
pub struct TreeNode {
    id: RuntimeNodeId,
    kind: NodeKind,
    name: String,
    initial_matrix: Mat4,
    matrix_override: Option<Mat4>,
    initially_shown: bool,
    shown: bool,
    flags: NodeFlags,
    status: LoadStatus,
    bounds: Option<BoundingBox>,
    attributes: Option<Lazy<Vec<Attribute>>>,
    part_definition: Option<RuntimeNodeId>,
    representation_item: Option<RuntimeNodeId>,
    instances: Vec<InstanceHandle>,
    mesh: Option<MeshKey>,
    external_model: Option<String>,
    branch_visibility: Cell<Option<BranchVisibility>>,
    pub(crate) parent: Option<EntryKey>,
    pub(crate) children: Vec<EntryKey>,
}

impl TreeNode {
    /// Create a new node
    pub fn new(id: RuntimeNodeId, kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            initial_matrix: Mat4::IDENTITY,
            matrix_override: None,
            initially_shown: true,
            shown: true,
            flags: NodeFlags::default(),
            status: LoadStatus::Loaded,
            bounds: None,
            attributes: None,
            part_definition: None,
            representation_item: None,
            instances: Vec::new(),
            mesh: None,
            external_model: None,
            branch_visibility: Cell::new(None),
            parent: None,
            children: Vec::new(),
        }
    }

    /// Builder: set the initial local matrix
    pub fn with_matrix(mut self, matrix: Mat4) -> Self {
        self.initial_matrix = matrix;
        self
    }

    /// Builder: set the initial visibility
    pub fn with_visibility(mut self, shown: bool) -> Self {
        self.initially_shown = shown;
        self.shown = shown;
        self
    }

    /// Builder: set the authoring flags
    pub fn with_flags(mut self, flags: NodeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Builder: set the load status
    pub fn with_status(mut self, status: LoadStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder: set known bounds
    pub fn with_bounds(mut self, bounds: Option<BoundingBox>) -> Self {
        self.bounds = bounds;
        self
    }

    /// Builder: set engine instances
    pub fn with_instances(mut self, instances: Vec<InstanceHandle>) -> Self {
        self.instances = instances;
        self
    }

    /// Builder: set the owned mesh
    pub fn with_mesh(mut self, mesh: MeshKey) -> Self {
        self.mesh = Some(mesh);
        self
    }

    /// Builder: name the external model this placeholder stands for
    pub fn with_external_model(mut self, name: impl Into<String>) -> Self {
        self.flags.external_model = true;
        self.external_model = Some(name.into());
        self
    }

    /// Builder: set the referenced part definition
    pub fn with_part_definition(mut self, part: Option<RuntimeNodeId>) -> Self {
        self.part_definition = part;
        self
    }

    /// Builder: set the referenced representation item
    pub fn with_representation_item(mut self, item: Option<RuntimeNodeId>) -> Self {
        self.representation_item = item;
        self
    }

    /// Builder: attach authored attributes, typed on first access
    pub fn with_attributes(mut self, raw: Vec<AttributeInfo>) -> Self {
        if !raw.is_empty() {
            self.attributes = Some(Lazy::new(move || raw.into_iter().map(type_attribute).collect()));
        }
        self
    }

    #[inline]
    pub fn id(&self) -> RuntimeNodeId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[inline]
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    #[inline]
    pub fn status(&self) -> LoadStatus {
        self.status
    }

    pub fn set_status(&mut self, status: LoadStatus) {
        self.status = status;
    }

    #[inline]
    pub fn bounds(&self) -> Option<BoundingBox> {
        self.bounds
    }

    pub fn set_bounds(&mut self, bounds: Option<BoundingBox>) {
        self.bounds = bounds;
    }

    /// Local matrix currently in effect
    pub fn matrix(&self) -> Mat4 {
        self.matrix_override.unwrap_or(self.initial_matrix)
    }

    /// Local matrix the node was loaded with
    pub fn initial_matrix(&self) -> Mat4 {
        self.initial_matrix
    }

    /// Check if the local matrix is overridden
    pub fn has_matrix_override(&self) -> bool {
        self.matrix_override.is_some()
    }

    pub(crate) fn set_matrix_override(&mut self, matrix: Option<Mat4>) {
        self.matrix_override = matrix;
    }

    #[inline]
    pub fn is_shown(&self) -> bool {
        self.shown
    }

    #[inline]
    pub fn is_initially_shown(&self) -> bool {
        self.initially_shown
    }

    /// Set current visibility; returns true if it changed
    ///
    /// Callers invalidate the branch visibility of every ancestor.
    pub(crate) fn set_shown(&mut self, shown: bool) -> bool {
        if self.shown == shown {
            return false;
        }
        self.shown = shown;
        self.branch_visibility.set(None);
        true
    }

    pub(crate) fn cached_branch_visibility(&self) -> Option<BranchVisibility> {
        self.branch_visibility.get()
    }

    pub(crate) fn cache_branch_visibility(&self, visibility: BranchVisibility) {
        self.branch_visibility.set(Some(visibility));
    }

    /// Mark the cached branch visibility stale; returns false if already stale
    pub(crate) fn invalidate_branch_visibility(&self) -> bool {
        self.branch_visibility.take().is_some()
    }

    /// Authored attributes, typed on first call
    pub fn attributes(&self) -> Option<Vec<Attribute>> {
        self.attributes.as_ref().map(Lazy::force)
    }

    #[inline]
    pub fn part_definition(&self) -> Option<RuntimeNodeId> {
        self.part_definition
    }

    #[inline]
    pub fn representation_item(&self) -> Option<RuntimeNodeId> {
        self.representation_item
    }

    /// Engine instances owned by this body
    #[inline]
    pub fn instances(&self) -> &[InstanceHandle] {
        &self.instances
    }

    pub(crate) fn set_instances(&mut self, instances: Vec<InstanceHandle>) {
        self.instances = instances;
    }

    /// External model name of a placeholder
    pub fn external_model(&self) -> Option<&str> {
        self.external_model.as_deref()
    }

    /// Mesh created for this node at runtime
    #[inline]
    pub fn mesh(&self) -> Option<MeshKey> {
        self.mesh
    }
}

impl core::fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TreeNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("shown", &self.shown)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

fn type_attribute(raw: AttributeInfo) -> Attribute {
    let kind = match raw.kind.as_deref() {
        Some("int") => AttributeKind::Int,
        Some("float") | Some("double") => AttributeKind::Float,
        Some("time") => AttributeKind::Time,
        Some(_) => AttributeKind::String,
        None if raw.value.parse::<i64>().is_ok() => AttributeKind::Int,
        None if raw.value.parse::<f64>().is_ok() => AttributeKind::Float,
        None => AttributeKind::String,
    };
    Attribute {
        name: raw.name,
        value: raw.value,
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classes() {
        assert!(NodeKind::ProductOccurrence.is_container());
        assert!(NodeKind::CadView.is_container());
        assert!(NodeKind::Mesh.is_body());
        assert!(NodeKind::ViewFrame.is_body());
    }

    #[test]
    fn test_matrix_override() {
        let initial = Mat4::from_translation(glam::Vec3::X);
        let mut node = TreeNode::new(RuntimeNodeId::from_raw(3), NodeKind::ProductOccurrence, "a")
            .with_matrix(initial);

        node.set_matrix_override(Some(Mat4::IDENTITY));
        assert_eq!(node.matrix(), Mat4::IDENTITY);
        assert_eq!(node.initial_matrix(), initial);

        node.set_matrix_override(None);
        assert_eq!(node.matrix(), initial);
    }

    #[test]
    fn test_visibility_change_drops_cache() {
        let mut node = TreeNode::new(RuntimeNodeId::from_raw(1), NodeKind::Mesh, "m");
        node.cache_branch_visibility(BranchVisibility::Shown);

        assert!(!node.set_shown(true));
        assert_eq!(node.cached_branch_visibility(), Some(BranchVisibility::Shown));
        assert!(node.set_shown(false));
        assert_eq!(node.cached_branch_visibility(), None);
        assert!(node.is_initially_shown());
    }

    #[test]
    fn test_attributes_typed_lazily() {
        let node = TreeNode::new(RuntimeNodeId::from_raw(1), NodeKind::ProductOccurrence, "p")
            .with_attributes(vec![
                AttributeInfo::new("Mass", "12.5"),
                AttributeInfo::new("Count", "3"),
                AttributeInfo::new("Material", "Steel"),
            ]);

        let attributes = node.attributes().unwrap();
        assert_eq!(attributes[0].kind, AttributeKind::Float);
        assert_eq!(attributes[1].kind, AttributeKind::Int);
        assert_eq!(attributes[2].kind, AttributeKind::String);
    }
}
