//! Node visibility and placement
//!
//! Branch visibility is cached per node. Any change below a node clears the
//! caches of its ancestors, including every occurrence referencing a
//! prototype on the way up.

use crate::arena::EntryKey;
use crate::context::ContextKind;
use crate::node::TreeNode;
use crate::tree::{AssemblyTree, Entry};
use crate::visibility::BranchVisibility;
use cadstream_core::error::{TreeError, TreeResult};
use cadstream_core::id::{InstanceHandle, RuntimeNodeId};
use cadstream_core::math::BoundingBox;
use glam::Mat4;

impl AssemblyTree {
    // ========================================================================
    // Branch visibility cache
    // ========================================================================

    /// Clear cached branch visibility above an entry
    pub(crate) fn invalidate_ancestors(&self, key: EntryKey) {
        self.invalidate_upward(self.entries.get(key).and_then(Entry::parent));
    }

    /// Clear cached branch visibility of an entry and its ancestors
    ///
    /// A context entry forwards to whatever sits above it; a prototype
    /// context forwards to every referrer.
    pub(crate) fn invalidate_branch(&self, key: EntryKey) {
        match self.entries.get(key) {
            Some(Entry::Node(node)) => {
                node.invalidate_branch_visibility();
                self.invalidate_ancestors(key);
            }
            Some(Entry::Context(_)) => self.invalidate_upward(Some(key)),
            None => {}
        }
    }

    fn invalidate_upward(&self, from: Option<EntryKey>) {
        let mut pending: Vec<EntryKey> = from.into_iter().collect();
        while let Some(start) = pending.pop() {
            let mut current = Some(start);
            while let Some(key) = current {
                match self.entries.get(key) {
                    Some(Entry::Node(node)) => {
                        // Stale already means every ancestor is stale too
                        if !node.invalidate_branch_visibility() {
                            break;
                        }
                        current = node.parent;
                    }
                    Some(Entry::Context(context)) => {
                        if let ContextKind::Prototype(p) = &context.kind {
                            pending.extend(p.referrers.iter().filter_map(|r| self.nodes.get(r)).copied());
                            break;
                        }
                        current = context.parent;
                    }
                    None => break,
                }
            }
        }
    }

    fn branch_visibility_at(&self, key: EntryKey) -> BranchVisibility {
        let Some(node) = self.node_at(key) else {
            return BranchVisibility::Shown;
        };
        if let Some(cached) = node.cached_branch_visibility() {
            return cached;
        }

        let result = if !node.is_shown() {
            BranchVisibility::Hidden
        } else {
            let children = self.public_child_ids(key);
            BranchVisibility::reduce(
                children
                    .iter()
                    .filter_map(|child| self.nodes.get(child))
                    .map(|child| self.branch_visibility_at(*child)),
            )
            .unwrap_or(BranchVisibility::Shown)
        };
        node.cache_branch_visibility(result);
        result
    }

    /// Aggregate visibility of a node's subtree
    ///
    /// A hidden node is `Hidden`; a shown leaf is `Shown`; otherwise the
    /// children's branches are reduced, `Mixed` when they disagree.
    pub fn branch_visibility(&self, id: RuntimeNodeId) -> Option<BranchVisibility> {
        let key = *self.nodes.get(&id)?;
        Some(self.branch_visibility_at(key))
    }

    // ========================================================================
    // Visibility
    // ========================================================================

    /// Show or hide a node; returns true if its state changed
    pub fn set_node_visibility(&mut self, id: RuntimeNodeId, shown: bool) -> TreeResult<bool> {
        let changed = self.node_mut(id)?.set_shown(shown);
        if changed {
            let key = self.key_of(id)?;
            self.invalidate_ancestors(key);
        }
        Ok(changed)
    }

    /// Restore the authored visibility of a node and its descendants
    ///
    /// Returns the nodes whose visibility changed.
    pub fn reset_node_visibility(&mut self, id: RuntimeNodeId) -> TreeResult<Vec<RuntimeNodeId>> {
        self.key_of(id)?;
        let mut subtree = vec![id];
        subtree.extend(self.descendants(id));

        let mut changed = Vec::new();
        for node_id in subtree {
            let Ok(node) = self.node_mut(node_id) else {
                continue;
            };
            let initial = node.is_initially_shown();
            if node.set_shown(initial) {
                changed.push(node_id);
            }
        }
        for node_id in &changed {
            if let Ok(key) = self.key_of(*node_id) {
                self.invalidate_ancestors(key);
            }
        }
        Ok(changed)
    }

    /// Current visibility flag of a node
    pub fn is_node_shown(&self, id: RuntimeNodeId) -> Option<bool> {
        self.lookup_any_tree_node(id).map(TreeNode::is_shown)
    }

    /// Check if a node and all of its ancestors are shown
    pub fn is_effectively_shown(&self, id: RuntimeNodeId) -> bool {
        self.is_node_shown(id) == Some(true)
            && self
                .ancestors(id)
                .into_iter()
                .all(|a| self.is_node_shown(a) != Some(false))
    }

    // ========================================================================
    // Placement
    // ========================================================================

    /// Override the local matrix of a node
    pub fn set_node_matrix(&mut self, id: RuntimeNodeId, matrix: Mat4) -> TreeResult<()> {
        self.node_mut(id)?.set_matrix_override(Some(matrix));
        Ok(())
    }

    /// Drop a matrix override, restoring the authored matrix
    pub fn reset_node_matrix(&mut self, id: RuntimeNodeId) -> TreeResult<()> {
        self.node_mut(id)?.set_matrix_override(None);
        Ok(())
    }

    /// Current local matrix of a node
    pub fn node_matrix(&self, id: RuntimeNodeId) -> Option<Mat4> {
        self.lookup_any_tree_node(id).map(TreeNode::matrix)
    }

    /// Local matrix composed with every ancestor's
    pub fn net_matrix(&self, id: RuntimeNodeId) -> Option<Mat4> {
        let mut matrix = self.node_matrix(id)?;
        for ancestor in self.ancestors(id) {
            if let Some(parent) = self.node_matrix(ancestor) {
                matrix = parent * matrix;
            }
        }
        Some(matrix)
    }

    /// Bounds of a node in world space
    pub fn world_bounds(&self, id: RuntimeNodeId) -> Option<BoundingBox> {
        let node = self.lookup_any_tree_node(id)?;
        let bounds = node.bounds()?;
        let parent = self
            .parent(id)
            .and_then(|p| self.net_matrix(p))
            .unwrap_or(Mat4::IDENTITY);
        Some(bounds.transform(&(parent * node.matrix())))
    }

    // ========================================================================
    // Engine instances
    // ========================================================================

    fn visit_bodies(
        &self,
        id: RuntimeNodeId,
        shown: bool,
        parent_matrix: Mat4,
        visit: &mut dyn FnMut(&TreeNode, bool, Mat4),
    ) {
        let Some(node) = self.lookup_any_tree_node(id) else {
            return;
        };
        let shown = shown && node.is_shown();
        let matrix = parent_matrix * node.matrix();
        if node.kind().is_body() {
            visit(node, shown, matrix);
        }
        for child in self.children(id) {
            self.visit_bodies(child, shown, matrix, visit);
        }
    }

    fn visit_subtree_bodies(&self, id: RuntimeNodeId, visit: &mut dyn FnMut(&TreeNode, bool, Mat4)) {
        let parent = self.parent(id);
        let shown = parent.map_or(true, |p| self.is_effectively_shown(p));
        let matrix = parent
            .and_then(|p| self.net_matrix(p))
            .unwrap_or(Mat4::IDENTITY);
        self.visit_bodies(id, shown, matrix, visit);
    }

    /// Engine instances under a node with their effective visibility
    pub fn effective_instance_visibility(&self, id: RuntimeNodeId) -> Vec<(InstanceHandle, bool)> {
        let mut out = Vec::new();
        self.visit_subtree_bodies(id, &mut |node, shown, _| {
            out.extend(node.instances().iter().map(|i| (*i, shown)));
        });
        out
    }

    /// Engine instances under a node with their world matrix
    pub fn instance_matrices(&self, id: RuntimeNodeId) -> Vec<(InstanceHandle, Mat4)> {
        let mut out = Vec::new();
        self.visit_subtree_bodies(id, &mut |node, _, matrix| {
            out.extend(node.instances().iter().map(|i| (*i, matrix)));
        });
        out
    }

    /// Every engine instance under a node
    pub fn instances_under(&self, id: RuntimeNodeId) -> Vec<InstanceHandle> {
        self.effective_instance_visibility(id)
            .into_iter()
            .map(|(instance, _)| instance)
            .collect()
    }

    /// Check that a node id is live
    pub(crate) fn require_node(&self, id: RuntimeNodeId) -> TreeResult<()> {
        if self.contains_node(id) {
            Ok(())
        } else {
            Err(TreeError::UnknownNode(id))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::node::NodeKind;
    use crate::tree::{AssemblyTree, Parent};
    use crate::visibility::BranchVisibility;
    use cadstream_core::id::{InstanceHandle, InstanceKey, MeshKey, ModelKey};
    use glam::{Mat4, Vec3};

    fn build() -> (AssemblyTree, Vec<cadstream_core::id::RuntimeNodeId>) {
        let mut tree = AssemblyTree::new();
        let root = tree.root_id();
        let a = tree
            .create_node(root, NodeKind::ProductOccurrence, "a", Mat4::from_translation(Vec3::X), true)
            .unwrap();
        let b = tree
            .create_mesh_instance_node(
                a,
                "b",
                MeshKey(1),
                InstanceHandle::new(ModelKey(0), InstanceKey(1)),
                Mat4::from_translation(Vec3::Y),
                true,
            )
            .unwrap();
        let c = tree
            .create_mesh_instance_node(
                a,
                "c",
                MeshKey(2),
                InstanceHandle::new(ModelKey(0), InstanceKey(2)),
                Mat4::IDENTITY,
                true,
            )
            .unwrap();
        (tree, vec![root, a, b, c])
    }

    #[test]
    fn test_branch_visibility_tracks_changes() {
        let (mut tree, ids) = build();
        let (root, a, b) = (ids[0], ids[1], ids[2]);

        assert_eq!(tree.branch_visibility(root), Some(BranchVisibility::Shown));

        tree.set_node_visibility(b, false).unwrap();
        assert_eq!(tree.branch_visibility(a), Some(BranchVisibility::Mixed));
        assert_eq!(tree.branch_visibility(root), Some(BranchVisibility::Mixed));

        tree.set_node_visibility(a, false).unwrap();
        assert_eq!(tree.branch_visibility(root), Some(BranchVisibility::Hidden));

        tree.reset_node_visibility(root).unwrap();
        assert_eq!(tree.branch_visibility(root), Some(BranchVisibility::Shown));
    }

    #[test]
    fn test_set_visibility_reports_change() {
        let (mut tree, ids) = build();
        assert!(tree.set_node_visibility(ids[1], false).unwrap());
        assert!(!tree.set_node_visibility(ids[1], false).unwrap());
        assert!(!tree.is_effectively_shown(ids[2]));
    }

    #[test]
    fn test_new_child_invalidates_parent() {
        let (mut tree, ids) = build();
        let a = ids[1];
        tree.set_node_visibility(ids[2], false).unwrap();
        tree.set_node_visibility(ids[3], false).unwrap();
        assert_eq!(tree.branch_visibility(a), Some(BranchVisibility::Hidden));

        tree.create_node(a, NodeKind::ProductOccurrence, "d", Mat4::IDENTITY, true)
            .unwrap();
        assert_eq!(tree.branch_visibility(a), Some(BranchVisibility::Mixed));
    }

    #[test]
    fn test_net_matrix_composes() {
        let (mut tree, ids) = build();
        let b = ids[2];
        let net = tree.net_matrix(b).unwrap();
        assert_eq!(net.transform_point3(Vec3::ZERO), Vec3::new(1.0, 1.0, 0.0));

        tree.set_node_matrix(ids[1], Mat4::from_translation(Vec3::Z)).unwrap();
        let moved = tree.net_matrix(b).unwrap();
        assert_eq!(moved.transform_point3(Vec3::ZERO), Vec3::new(0.0, 1.0, 1.0));

        tree.reset_node_matrix(ids[1]).unwrap();
        assert_eq!(tree.net_matrix(b), Some(net));
    }

    #[test]
    fn test_effective_instance_visibility() {
        let (mut tree, ids) = build();
        tree.set_node_visibility(ids[3], false).unwrap();
        let vis = tree.effective_instance_visibility(ids[0]);
        assert_eq!(
            vis,
            vec![
                (InstanceHandle::new(ModelKey(0), InstanceKey(1)), true),
                (InstanceHandle::new(ModelKey(0), InstanceKey(2)), false),
            ]
        );

        let matrices = tree.instance_matrices(ids[2]);
        assert_eq!(matrices.len(), 1);
        assert_eq!(
            matrices[0].1.transform_point3(Vec3::ZERO),
            Vec3::new(1.0, 1.0, 0.0)
        );
    }

    #[test]
    fn test_prototype_change_reaches_every_referrer() {
        let mut tree = AssemblyTree::new();
        let load = tree.create_load_context(Parent::Node(tree.root_id())).unwrap();
        let inclusion = tree.create_inclusion_context(load, 10).unwrap();
        let a = tree
            .create_node(tree.root_id(), NodeKind::ProductOccurrence, "a", Mat4::IDENTITY, true)
            .unwrap();
        let b = tree
            .create_node(tree.root_id(), NodeKind::ProductOccurrence, "b", Mat4::IDENTITY, true)
            .unwrap();
        let proto = tree.create_prototype_context(inclusion, 1).unwrap();
        let id = tree.generate_dynamic_node_id().unwrap();
        let shared = tree
            .register_node(
                Parent::Context(proto),
                crate::node::TreeNode::new(
                    cadstream_core::id::RuntimeNodeId::from_dynamic(id).unwrap(),
                    NodeKind::ProductOccurrence,
                    "shared",
                ),
            )
            .unwrap();
        tree.add_prototype_referrer(proto, a).unwrap();
        tree.add_prototype_referrer(proto, b).unwrap();

        assert_eq!(tree.branch_visibility(a), Some(BranchVisibility::Shown));
        assert_eq!(tree.branch_visibility(b), Some(BranchVisibility::Shown));

        tree.set_node_visibility(shared, false).unwrap();
        assert_eq!(tree.branch_visibility(a), Some(BranchVisibility::Hidden));
        assert_eq!(tree.branch_visibility(b), Some(BranchVisibility::Hidden));
    }
}
