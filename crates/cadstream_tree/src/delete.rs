//! Node deletion
//!
//! Deleting a node removes its whole structural subtree from the tree and
//! reports which engine resources the caller must release. Inclusions are
//! detached as a unit; instances inside a detached inclusion are not listed
//! separately. Nodes and meshes can be protected from deletion with counted
//! blockers.

use crate::arena::EntryKey;
use crate::context::{ContextId, ContextKind, LoadContext};
use crate::reference::ReferenceKind;
use crate::tree::{AssemblyTree, Entry};
use cadstream_core::error::{TreeError, TreeResult};
use cadstream_core::id::{InclusionKey, InstanceHandle, MeshKey, RuntimeNodeId};

/// Engine resources released by a deletion
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeletionReport {
    /// Tree nodes unregistered
    pub nodes: Vec<RuntimeNodeId>,
    /// Reference nodes released with their last referrer
    pub references: Vec<RuntimeNodeId>,
    /// Inclusions to detach from the engine
    pub inclusions: Vec<InclusionKey>,
    /// Instances to delete outside any detached inclusion
    pub instances: Vec<InstanceHandle>,
    /// Meshes to delete
    pub meshes: Vec<MeshKey>,
    /// Meshes kept alive by a deletion blocker
    pub deferred_meshes: Vec<MeshKey>,
}

impl DeletionReport {
    /// Check if nothing was removed
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.references.is_empty()
            && self.inclusions.is_empty()
            && self.instances.is_empty()
            && self.meshes.is_empty()
            && self.deferred_meshes.is_empty()
    }

    /// Append another report
    pub fn merge(&mut self, other: DeletionReport) {
        self.nodes.extend(other.nodes);
        self.references.extend(other.references);
        self.inclusions.extend(other.inclusions);
        self.instances.extend(other.instances);
        self.meshes.extend(other.meshes);
        self.deferred_meshes.extend(other.deferred_meshes);
    }
}

/// Result of a deletion request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(DeletionReport),
    /// A node in the subtree is protected; nothing was removed
    Blocked { blocker: RuntimeNodeId },
}

impl DeleteOutcome {
    /// Check if the deletion went through
    pub fn is_deleted(&self) -> bool {
        matches!(self, DeleteOutcome::Deleted(_))
    }
}

impl AssemblyTree {
    // ========================================================================
    // Deletion blockers
    // ========================================================================

    /// Protect a node from deletion; blockers are counted
    pub fn prevent_node_deletion(&mut self, id: RuntimeNodeId) -> TreeResult<()> {
        self.require_node(id)?;
        *self.deletion_blockers.entry(id).or_insert(0) += 1;
        Ok(())
    }

    /// Lift one blocker from a node; returns false if it had none
    pub fn allow_node_deletion(&mut self, id: RuntimeNodeId) -> bool {
        match self.deletion_blockers.get_mut(&id) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.deletion_blockers.remove(&id);
                }
                true
            }
            None => false,
        }
    }

    /// Check if a node is protected
    pub fn is_node_deletion_prevented(&self, id: RuntimeNodeId) -> bool {
        self.deletion_blockers.contains_key(&id)
    }

    /// Keep a mesh alive past the deletion of its nodes; blockers are counted
    pub fn prevent_mesh_deletion(&mut self, mesh: MeshKey) {
        *self.mesh_blockers.entry(mesh).or_insert(0) += 1;
    }

    /// Lift one blocker from a mesh
    ///
    /// Returns the mesh when it was deferred and is now free to delete.
    pub fn allow_mesh_deletion(&mut self, mesh: MeshKey) -> Option<MeshKey> {
        let count = self.mesh_blockers.get_mut(&mesh)?;
        *count -= 1;
        if *count > 0 {
            return None;
        }
        self.mesh_blockers.remove(&mesh);
        self.deferred_meshes.remove(&mesh).then_some(mesh)
    }

    /// Meshes waiting on a blocker
    pub fn deferred_meshes(&self) -> Vec<MeshKey> {
        self.deferred_meshes.iter().copied().collect()
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Delete a node and its subtree
    ///
    /// Nothing is removed when any node of the subtree is protected.
    pub fn delete_node(&mut self, id: RuntimeNodeId) -> TreeResult<DeleteOutcome> {
        if id == self.root_id() {
            return Err(TreeError::InvalidNodeId);
        }
        let key = self.key_of(id)?;

        let mut subtree = Vec::new();
        self.collect_structural_nodes(key, &mut subtree);
        if let Some(blocker) = subtree
            .iter()
            .copied()
            .find(|n| self.deletion_blockers.contains_key(n))
        {
            log::debug!("AssemblyTree: delete of {} blocked by {}", id, blocker);
            return Ok(DeleteOutcome::Blocked { blocker });
        }

        let parent = self.entries.get(key).and_then(Entry::parent);
        let mut report = DeletionReport::default();
        self.unlink(key);
        self.purge(key, false, &mut report);
        if let Some(parent) = parent {
            self.invalidate_branch(parent);
        }

        log::debug!(
            "AssemblyTree: deleted {} ({} nodes, {} inclusions)",
            id,
            report.nodes.len(),
            report.inclusions.len()
        );
        Ok(DeleteOutcome::Deleted(report))
    }

    /// Remove a context and everything below it, ignoring blockers
    pub fn discard_context(&mut self, id: ContextId) -> TreeResult<DeletionReport> {
        if id == self.root_load_context() {
            return Err(TreeError::WrongContextType("non-root"));
        }
        if !self.contains_context(id) {
            return Err(TreeError::UnknownContext);
        }

        let parent = self.entries.get(id.0).and_then(Entry::parent);
        let mut report = DeletionReport::default();
        self.unlink(id.0);
        self.purge(id.0, false, &mut report);
        if let Some(parent) = parent {
            self.invalidate_branch(parent);
        }
        Ok(report)
    }

    /// Remove everything below the root
    ///
    /// Blockers on nodes are dropped with them; mesh blockers survive.
    pub fn reset(&mut self) -> DeletionReport {
        let mut report = DeletionReport::default();
        let Ok(root_key) = self.key_of(self.root_id()) else {
            return report;
        };
        let children: Vec<EntryKey> = self
            .entries
            .get(root_key)
            .map(|e| e.children().to_vec())
            .unwrap_or_default();
        for child in children {
            self.unlink(child);
            self.purge(child, false, &mut report);
        }
        if let Some(root) = self.node_at(root_key) {
            root.invalidate_branch_visibility();
        }

        self.prototype_refs.clear();
        self.deletion_blockers.clear();
        self.loads.clear();
        self.offsets.reset();
        if let Ok(root_load) = self.load_context_mut(self.root_load_context()) {
            *root_load = LoadContext::default();
        }

        log::info!("AssemblyTree: reset ({} nodes removed)", report.nodes.len());
        report
    }

    fn collect_structural_nodes(&self, key: EntryKey, out: &mut Vec<RuntimeNodeId>) {
        let Some(entry) = self.entries.get(key) else {
            return;
        };
        if let Entry::Node(node) = entry {
            out.push(node.id());
        }
        for child in entry.children() {
            self.collect_structural_nodes(*child, out);
        }
    }

    /// Remove an unlinked entry and its structural subtree
    fn purge(&mut self, key: EntryKey, detached: bool, report: &mut DeletionReport) {
        let (children, detaches) = match self.entries.get(key) {
            Some(Entry::Context(context)) => match &context.kind {
                ContextKind::Inclusion(inclusion) => {
                    if let Some(inclusion_key) = inclusion.inclusion_key {
                        report.inclusions.push(inclusion_key);
                    }
                    (context.children.clone(), inclusion.inclusion_key.is_some())
                }
                _ => (context.children.clone(), false),
            },
            Some(Entry::Node(node)) => (node.children.clone(), false),
            None => return,
        };
        let detached = detached || detaches;

        for child in children {
            self.purge(child, detached, report);
        }

        match self.entries.remove(key) {
            Some(Entry::Node(node)) => self.forget_node(node, detached, report),
            Some(Entry::Context(context)) => match context.kind {
                ContextKind::Inclusion(inclusion) => {
                    // Prototypes outlive their referrers only if never referenced
                    for prototype in inclusion.prototypes.into_values() {
                        self.purge(prototype, detached, report);
                    }
                    self.offsets.release(inclusion.offset);
                }
                ContextKind::Attach(attach) => {
                    if let Some((offset, _)) = attach.reserved_offset {
                        self.offsets.release(offset);
                    }
                }
                ContextKind::Load(_) => {
                    self.loads.retain(|_, load| *load != key);
                }
                ContextKind::Prototype(prototype) => {
                    if let Some(Entry::Context(owner)) = self.entries.get_mut(prototype.inclusion) {
                        if let ContextKind::Inclusion(inclusion) = &mut owner.kind {
                            inclusion.prototypes.remove(&prototype.prototype);
                        }
                    }
                    for referrer in prototype.referrers {
                        self.prototype_refs.remove(&referrer);
                        if let Some(referrer_key) = self.nodes.get(&referrer).copied() {
                            self.invalidate_branch(referrer_key);
                        }
                    }
                }
            },
            None => {}
        }
    }

    fn forget_node(&mut self, node: crate::node::TreeNode, detached: bool, report: &mut DeletionReport) {
        let id = node.id();
        self.nodes.remove(&id);
        self.indices.forget_node(id);
        self.deletion_blockers.remove(&id);

        if node.kind().is_body() {
            if !detached {
                report.instances.extend_from_slice(node.instances());
            }
            if let Some(mesh) = node.mesh() {
                if self.mesh_blockers.contains_key(&mesh) {
                    self.deferred_meshes.insert(mesh);
                    report.deferred_meshes.push(mesh);
                } else {
                    report.meshes.push(mesh);
                }
            }
        }

        for reference in [node.part_definition(), node.representation_item()]
            .into_iter()
            .flatten()
        {
            self.release_reference(reference, id, report);
        }

        if let Some(prototype) = self.prototype_refs.remove(&id) {
            let orphaned = match self.entries.get_mut(prototype) {
                Some(Entry::Context(context)) => match &mut context.kind {
                    ContextKind::Prototype(p) => {
                        p.referrers.retain(|r| *r != id);
                        p.referrers.is_empty()
                    }
                    _ => false,
                },
                _ => false,
            };
            if orphaned {
                self.purge(prototype, detached, report);
            }
        }

        report.nodes.push(id);
    }

    fn release_reference(&mut self, reference: RuntimeNodeId, referrer: RuntimeNodeId, report: &mut DeletionReport) {
        let released = match self.references.get_mut(&reference) {
            Some(node) => node.remove_referrer(referrer),
            None => return,
        };
        if !released {
            return;
        }
        let Some(node) = self.references.remove(&reference) else {
            return;
        };
        report.references.push(reference);
        if node.kind() == ReferenceKind::PartDefinition {
            for item in node.items() {
                self.release_reference(*item, reference, report);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, TreeNode};
    use crate::reference::ReferenceNode;
    use crate::tree::Parent;
    use cadstream_core::id::{AuthoredNodeId, InstanceKey, ModelKey};
    use glam::Mat4;

    fn body(tree: &mut AssemblyTree, parent: RuntimeNodeId, mesh: u32, instance: u32) -> RuntimeNodeId {
        tree.create_mesh_instance_node(
            parent,
            "body",
            MeshKey(mesh),
            InstanceHandle::new(ModelKey(0), InstanceKey(instance)),
            Mat4::IDENTITY,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_delete_subtree() {
        let mut tree = AssemblyTree::new();
        let root = tree.root_id();
        let a = tree
            .create_node(root, NodeKind::ProductOccurrence, "a", Mat4::IDENTITY, true)
            .unwrap();
        let b = body(&mut tree, a, 1, 10);
        let layer = tree.register_layer("L");
        tree.register_node_in_layer(b, layer);

        let DeleteOutcome::Deleted(report) = tree.delete_node(a).unwrap() else {
            panic!("deletion blocked");
        };
        assert_eq!(report.nodes, vec![b, a]);
        assert_eq!(report.instances, vec![InstanceHandle::new(ModelKey(0), InstanceKey(10))]);
        assert_eq!(report.meshes, vec![MeshKey(1)]);
        assert!(!tree.contains_node(a));
        assert!(!tree.contains_node(b));
        assert!(tree.get_nodes_from_layer(layer).is_empty());
        assert!(tree.children(root).is_empty());
    }

    #[test]
    fn test_blocked_delete_is_atomic() {
        let mut tree = AssemblyTree::new();
        let root = tree.root_id();
        let a = tree
            .create_node(root, NodeKind::ProductOccurrence, "a", Mat4::IDENTITY, true)
            .unwrap();
        let b = body(&mut tree, a, 1, 10);

        tree.prevent_node_deletion(b).unwrap();
        tree.prevent_node_deletion(b).unwrap();
        assert_eq!(tree.delete_node(a).unwrap(), DeleteOutcome::Blocked { blocker: b });
        assert!(tree.contains_node(a) && tree.contains_node(b));

        assert!(tree.allow_node_deletion(b));
        assert!(!tree.delete_node(a).unwrap().is_deleted());
        assert!(tree.allow_node_deletion(b));
        assert!(!tree.allow_node_deletion(b));
        assert!(tree.delete_node(a).unwrap().is_deleted());
    }

    #[test]
    fn test_root_cannot_be_deleted() {
        let mut tree = AssemblyTree::new();
        assert_eq!(tree.delete_node(tree.root_id()), Err(TreeError::InvalidNodeId));
    }

    #[test]
    fn test_mesh_deletion_deferred() {
        let mut tree = AssemblyTree::new();
        let root = tree.root_id();
        let a = body(&mut tree, root, 7, 1);
        tree.prevent_mesh_deletion(MeshKey(7));

        let DeleteOutcome::Deleted(report) = tree.delete_node(a).unwrap() else {
            panic!("deletion blocked");
        };
        assert!(report.meshes.is_empty());
        assert_eq!(report.deferred_meshes, vec![MeshKey(7)]);
        assert_eq!(tree.deferred_meshes(), vec![MeshKey(7)]);

        assert_eq!(tree.allow_mesh_deletion(MeshKey(7)), Some(MeshKey(7)));
        assert!(tree.deferred_meshes().is_empty());
        assert_eq!(tree.allow_mesh_deletion(MeshKey(7)), None);
    }

    #[test]
    fn test_inclusion_detached_as_unit() {
        let mut tree = AssemblyTree::new();
        let root = tree.root_id();
        let holder = tree
            .create_node(root, NodeKind::ProductOccurrence, "holder", Mat4::IDENTITY, true)
            .unwrap();
        let attach = tree.create_attach_context(Parent::Node(holder), "model").unwrap();
        let inclusion = tree.create_inclusion_context(attach, 4).unwrap();
        tree.inclusion_context_mut(inclusion).unwrap().inclusion_key = Some(InclusionKey(3));
        let offset = tree.inclusion_context(inclusion).unwrap().offset;

        let id = RuntimeNodeId::from_authored(AuthoredNodeId::new(0), offset).unwrap();
        let node = TreeNode::new(id, NodeKind::Mesh, "part")
            .with_instances(vec![InstanceHandle::new(ModelKey(2), InstanceKey(1))]);
        tree.register_node(Parent::Context(inclusion), node).unwrap();

        let DeleteOutcome::Deleted(report) = tree.delete_node(holder).unwrap() else {
            panic!("deletion blocked");
        };
        assert_eq!(report.inclusions, vec![InclusionKey(3)]);
        assert!(report.instances.is_empty());
        assert!(!tree.contains_context(inclusion));
        assert_eq!(tree.offsets.live_count(), 0);
    }

    #[test]
    fn test_reference_released_with_last_referrer() {
        let mut tree = AssemblyTree::new();
        let root = tree.root_id();
        let load = tree.create_load_context(Parent::Node(root)).unwrap();
        let inclusion = tree.create_inclusion_context(load, 10).unwrap();
        let offset = tree.inclusion_context(inclusion).unwrap().offset;
        let rid = |n| RuntimeNodeId::from_authored(AuthoredNodeId::new(n), offset).unwrap();

        tree.register_reference(ReferenceNode::representation_item(rid(9), "item", Vec::new()))
            .unwrap();
        tree.register_reference(ReferenceNode::part_definition(rid(8), "part", vec![rid(9)]))
            .unwrap();
        tree.add_reference_referrer(rid(9), rid(8));

        let a = tree
            .register_node(
                Parent::Context(inclusion),
                TreeNode::new(rid(0), NodeKind::ProductOccurrence, "a").with_part_definition(Some(rid(8))),
            )
            .unwrap();
        let b = tree
            .register_node(
                Parent::Context(inclusion),
                TreeNode::new(rid(1), NodeKind::ProductOccurrence, "b").with_part_definition(Some(rid(8))),
            )
            .unwrap();
        tree.add_reference_referrer(rid(8), a);
        tree.add_reference_referrer(rid(8), b);

        let DeleteOutcome::Deleted(first) = tree.delete_node(a).unwrap() else {
            panic!("deletion blocked");
        };
        assert!(first.references.is_empty());
        assert!(tree.lookup_part_definition(rid(8)).is_some());

        let DeleteOutcome::Deleted(second) = tree.delete_node(b).unwrap() else {
            panic!("deletion blocked");
        };
        assert_eq!(second.references, vec![rid(8), rid(9)]);
        assert_eq!(tree.reference_count(), 0);
    }

    #[test]
    fn test_prototype_dropped_with_last_referrer() {
        let mut tree = AssemblyTree::new();
        let root = tree.root_id();
        let load = tree.create_load_context(Parent::Node(root)).unwrap();
        let inclusion = tree.create_inclusion_context(load, 10).unwrap();
        let offset = tree.inclusion_context(inclusion).unwrap().offset;
        let rid = |n| RuntimeNodeId::from_authored(AuthoredNodeId::new(n), offset).unwrap();

        let a = tree
            .register_node(Parent::Context(inclusion), TreeNode::new(rid(0), NodeKind::ProductOccurrence, "a"))
            .unwrap();
        let b = tree
            .register_node(Parent::Context(inclusion), TreeNode::new(rid(1), NodeKind::ProductOccurrence, "b"))
            .unwrap();
        let proto = tree.create_prototype_context(inclusion, 4).unwrap();
        let shared = tree
            .register_node(Parent::Context(proto), TreeNode::new(rid(5), NodeKind::ProductOccurrence, "s"))
            .unwrap();
        tree.add_prototype_referrer(proto, a).unwrap();
        tree.add_prototype_referrer(proto, b).unwrap();

        tree.delete_node(a).unwrap();
        assert!(tree.contains_node(shared));
        assert_eq!(tree.parent(shared), Some(b));

        tree.delete_node(b).unwrap();
        assert!(!tree.contains_node(shared));
        assert!(!tree.contains_context(proto));
        assert_eq!(tree.inclusion_prototype(inclusion, 4), None);
    }

    #[test]
    fn test_reset_keeps_root() {
        let mut tree = AssemblyTree::new();
        let root = tree.root_id();
        let load = tree.create_load_context(Parent::Node(root)).unwrap();
        tree.on_load_begin(load);
        let a = tree
            .create_node(root, NodeKind::ProductOccurrence, "a", Mat4::IDENTITY, true)
            .unwrap();
        body(&mut tree, a, 1, 1);

        let report = tree.reset();
        assert_eq!(report.nodes.len(), 2);
        assert_eq!(tree.node_count(), 1);
        assert!(tree.contains_node(root));
        assert!(tree.active_loads().is_empty());
        assert!(tree.indices().is_empty());
    }

    #[test]
    fn test_discard_context_ignores_blockers() {
        let mut tree = AssemblyTree::new();
        let root = tree.root_id();
        let load = tree.create_load_context(Parent::Node(root)).unwrap();
        let inclusion = tree.create_inclusion_context(load, 2).unwrap();
        let offset = tree.inclusion_context(inclusion).unwrap().offset;
        let id = RuntimeNodeId::from_authored(AuthoredNodeId::new(0), offset).unwrap();
        tree.register_node(Parent::Context(inclusion), TreeNode::new(id, NodeKind::ProductOccurrence, "a"))
            .unwrap();
        tree.prevent_node_deletion(id).unwrap();

        let report = tree.discard_context(load).unwrap();
        assert_eq!(report.nodes, vec![id]);
        assert!(!tree.is_node_deletion_prevented(id));
        assert_eq!(tree.discard_context(load), Err(TreeError::UnknownContext));
    }
}
