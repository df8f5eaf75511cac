//! Reification of parsed records
//!
//! A [`Reifier`] walks a [`ParsedAssembly`] in document order and registers
//! its records under an inclusion context, a bounded number per
//! [`Reifier::step`] so loaders can yield between batches. Between steps the
//! tree may change under it: records whose parent disappeared are skipped
//! together with their descendants, and a vanished inclusion ends the run
//! with [`TreeError::UnknownContext`].
//!
//! Part definitions, representation items and prototypes are reified on
//! first reference. Filters and relationships are registered once every
//! record is live.

use crate::context::ContextId;
use crate::info::{NodeInfo, ParsedAssembly};
use crate::node::{LoadStatus, TreeNode};
use crate::reference::ReferenceNode;
use crate::tree::{AssemblyTree, Parent};
use cadstream_core::error::{TreeError, TreeResult};
use cadstream_core::id::{AuthoredNodeId, InstanceHandle, InstanceKey, ModelKey, NodeIdOffset, RuntimeNodeId};
use cadstream_core::math::{matrix_from_array, BoundingBox};
use glam::Mat4;
use std::collections::HashSet;
use std::sync::Arc;

/// External model found while reifying
#[derive(Clone, Debug, PartialEq)]
pub struct PendingExternalModel {
    /// Placeholder node standing in for the model
    pub node: RuntimeNodeId,
    pub name: String,
    pub bounds: Option<BoundingBox>,
}

/// Summary of a reification run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReifyReport {
    /// Nodes registered directly under the inclusion
    pub roots: Vec<RuntimeNodeId>,
    /// Tree nodes registered, prototype content included
    pub nodes: usize,
    /// Reference nodes registered
    pub references: usize,
    /// Records dropped because their parent was gone
    pub skipped: usize,
    /// Placeholders waiting on an external model, in document order
    pub external_models: Vec<PendingExternalModel>,
}

/// Incremental reifier of one parsed assembly
pub struct Reifier {
    assembly: Arc<ParsedAssembly>,
    inclusion: ContextId,
    offset: NodeIdOffset,
    model_key: Option<ModelKey>,
    cursor: usize,
    skipped: HashSet<AuthoredNodeId>,
    expanding: Vec<u32>,
    finished: bool,
    report: ReifyReport,
}

impl Reifier {
    /// Create a reifier targeting an inclusion context
    ///
    /// Instance handles are built against the inclusion's model key.
    pub fn new(tree: &AssemblyTree, inclusion: ContextId, assembly: Arc<ParsedAssembly>) -> TreeResult<Self> {
        let context = tree
            .inclusion_context(inclusion)
            .ok_or(TreeError::UnknownContext)?;
        if context.span < assembly.required_span() {
            return Err(TreeError::IdRangeExhausted);
        }

        Ok(Self {
            offset: context.offset,
            model_key: context.model_key,
            assembly,
            inclusion,
            cursor: 0,
            skipped: HashSet::new(),
            expanding: Vec::new(),
            finished: false,
            report: ReifyReport::default(),
        })
    }

    /// Check if every record has been processed
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Records processed and total records
    pub fn progress(&self) -> (usize, usize) {
        (self.cursor, self.assembly.nodes.len())
    }

    /// Report so far
    pub fn report(&self) -> &ReifyReport {
        &self.report
    }

    /// Consume the reifier
    pub fn into_report(self) -> ReifyReport {
        self.report
    }

    /// Reify up to `budget` records; returns true once done
    pub fn step(&mut self, tree: &mut AssemblyTree, budget: usize) -> TreeResult<bool> {
        if self.finished {
            return Ok(true);
        }
        if !tree.contains_context(self.inclusion) {
            return Err(TreeError::UnknownContext);
        }

        let assembly = Arc::clone(&self.assembly);
        let end = self
            .cursor
            .saturating_add(budget.max(1))
            .min(assembly.nodes.len());

        for record in &assembly.nodes[self.cursor..end] {
            let parent = match record.parent {
                None => Some(Parent::Context(self.inclusion)),
                Some(parent) => self.live_parent(tree, parent),
            };
            match parent {
                Some(parent) => {
                    let id = self.reify_record(tree, record, parent, false)?;
                    if record.parent.is_none() {
                        self.report.roots.push(id);
                    }
                }
                None => {
                    self.skipped.insert(record.authored_id);
                    self.report.skipped += 1;
                }
            }
        }
        self.cursor = end;

        if self.cursor >= assembly.nodes.len() {
            self.finish(tree);
            self.finished = true;
        }
        Ok(self.finished)
    }

    fn runtime_id(&self, authored: AuthoredNodeId) -> TreeResult<RuntimeNodeId> {
        RuntimeNodeId::from_authored(authored, self.offset).ok_or(TreeError::IdRangeExhausted)
    }

    fn live_parent(&self, tree: &AssemblyTree, parent: AuthoredNodeId) -> Option<Parent> {
        if self.skipped.contains(&parent) {
            return None;
        }
        let id = self.runtime_id(parent).ok()?;
        match tree.lookup_container_node(id) {
            Some(_) => Some(Parent::Node(id)),
            None => {
                if tree.contains_node(id) {
                    log::warn!("Reifier: parent {} of a record is not a container", id);
                }
                None
            }
        }
    }

    fn reify_record(
        &mut self,
        tree: &mut AssemblyTree,
        record: &NodeInfo,
        parent: Parent,
        in_prototype: bool,
    ) -> TreeResult<RuntimeNodeId> {
        let id = self.runtime_id(record.authored_id)?;
        let part = match record.part_definition {
            Some(part) => self.ensure_part_definition(tree, part)?,
            None => None,
        };
        let item = match record.representation_item {
            Some(item) => self.ensure_representation_item(tree, item)?,
            None => None,
        };

        let instances = match self.model_key {
            Some(model) => record
                .instances
                .iter()
                .map(|k| InstanceHandle::new(model, InstanceKey(*k)))
                .collect(),
            None => Vec::new(),
        };

        let mut flags = record.flags;
        let mut status = LoadStatus::Loaded;
        let mut bounds = record.bounds;
        if let Some(external) = &record.external_model {
            flags.external_model = true;
            status = LoadStatus::Unloaded;
            bounds = bounds.or(external.bounds);
        }

        let node = TreeNode::new(id, record.kind, record.name.clone())
            .with_matrix(record.matrix.as_ref().map_or(Mat4::IDENTITY, matrix_from_array))
            .with_visibility(record.visible)
            .with_flags(flags)
            .with_status(status)
            .with_bounds(bounds)
            .with_instances(instances)
            .with_part_definition(part)
            .with_representation_item(item)
            .with_attributes(record.attributes.clone());
        let node = match &record.external_model {
            Some(external) => node.with_external_model(external.name.clone()),
            None => node,
        };
        tree.register_node(parent, node)?;
        self.report.nodes += 1;

        for reference in [part, item].into_iter().flatten() {
            tree.add_reference_referrer(reference, id);
        }
        if let Some(layer) = &record.layer {
            let layer = tree.register_layer(layer);
            tree.register_node_in_layer(id, layer);
        }
        if let Some(generic_type) = &record.generic_type {
            tree.register_generic_type(id, generic_type);
        }
        if let Some(generic_id) = &record.generic_id {
            if !tree.register_generic_id(id, generic_id) {
                log::warn!("Reifier: generic id '{}' already taken", generic_id);
            }
        }
        if let Some(prototype) = record.prototype {
            self.attach_prototype(tree, id, prototype)?;
        }
        if let Some(external) = &record.external_model {
            if !in_prototype {
                self.report.external_models.push(PendingExternalModel {
                    node: id,
                    name: external.name.clone(),
                    bounds,
                });
            }
        }
        Ok(id)
    }

    fn ensure_representation_item(
        &mut self,
        tree: &mut AssemblyTree,
        authored: AuthoredNodeId,
    ) -> TreeResult<Option<RuntimeNodeId>> {
        let id = self.runtime_id(authored)?;
        if tree.lookup_representation_item(id).is_some() {
            return Ok(Some(id));
        }
        let Some(info) = self.assembly.representation_item(authored) else {
            log::warn!("Reifier: unknown representation item {}", authored);
            return Ok(None);
        };
        let instances = match self.model_key {
            Some(model) => info
                .instances
                .iter()
                .map(|k| InstanceHandle::new(model, InstanceKey(*k)))
                .collect(),
            None => Vec::new(),
        };
        tree.register_reference(
            ReferenceNode::representation_item(id, info.name.clone(), instances).with_bounds(info.bounds),
        )?;
        self.report.references += 1;
        Ok(Some(id))
    }

    fn ensure_part_definition(
        &mut self,
        tree: &mut AssemblyTree,
        authored: AuthoredNodeId,
    ) -> TreeResult<Option<RuntimeNodeId>> {
        let id = self.runtime_id(authored)?;
        if tree.lookup_part_definition(id).is_some() {
            return Ok(Some(id));
        }
        let assembly = Arc::clone(&self.assembly);
        let Some(info) = assembly.part_definition(authored) else {
            log::warn!("Reifier: unknown part definition {}", authored);
            return Ok(None);
        };

        let mut items = Vec::with_capacity(info.items.len());
        for item in &info.items {
            if let Some(item) = self.ensure_representation_item(tree, *item)? {
                items.push(item);
            }
        }
        tree.register_reference(
            ReferenceNode::part_definition(id, info.name.clone(), items.clone()).with_bounds(info.bounds),
        )?;
        for item in items {
            tree.add_reference_referrer(item, id);
        }
        self.report.references += 1;
        Ok(Some(id))
    }

    fn attach_prototype(&mut self, tree: &mut AssemblyTree, referrer: RuntimeNodeId, prototype: u32) -> TreeResult<()> {
        if self.expanding.contains(&prototype) {
            log::warn!("Reifier: prototype {} references itself", prototype);
            return Ok(());
        }
        if let Some(context) = tree.inclusion_prototype(self.inclusion, prototype) {
            return tree.add_prototype_referrer(context, referrer);
        }

        let assembly = Arc::clone(&self.assembly);
        let Some(info) = assembly.prototype(prototype) else {
            log::warn!("Reifier: unknown prototype {}", prototype);
            return Ok(());
        };

        let context = tree.create_prototype_context(self.inclusion, prototype)?;
        self.expanding.push(prototype);
        let mut skipped = HashSet::new();
        for record in &info.nodes {
            let parent = match record.parent {
                None => Some(Parent::Context(context)),
                Some(p) if skipped.contains(&p) => None,
                Some(p) => self.live_parent(tree, p),
            };
            match parent {
                Some(parent) => {
                    self.reify_record(tree, record, parent, true)?;
                }
                None => {
                    skipped.insert(record.authored_id);
                }
            }
        }
        self.expanding.pop();

        tree.add_prototype_referrer(context, referrer)
    }

    fn finish(&mut self, tree: &mut AssemblyTree) {
        for filter in &self.assembly.filters {
            let nodes: Vec<RuntimeNodeId> = filter
                .nodes
                .iter()
                .filter_map(|n| self.runtime_id(*n).ok())
                .collect();
            tree.add_filter(&filter.name, filter.inclusive, &nodes);
        }
        for relationship in &self.assembly.relationships {
            let (Ok(from), Ok(to)) = (
                self.runtime_id(relationship.from),
                self.runtime_id(relationship.to),
            ) else {
                continue;
            };
            if !tree.add_relationship(&relationship.kind, from, to) {
                log::debug!(
                    "Reifier: dropped relationship {} -> {}",
                    relationship.from,
                    relationship.to
                );
            }
        }
    }
}

impl AssemblyTree {
    /// Reify a whole assembly in one go
    pub fn reify(&mut self, inclusion: ContextId, assembly: Arc<ParsedAssembly>) -> TreeResult<ReifyReport> {
        let mut reifier = Reifier::new(self, inclusion, assembly)?;
        reifier.step(self, usize::MAX)?;
        Ok(reifier.into_report())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{ExternalModelInfo, FilterInfo, PartDefinitionInfo, PrototypeInfo, RelationshipInfo, RepresentationItemInfo};
    use crate::node::NodeKind;
    use crate::visibility::BranchVisibility;

    fn sample() -> ParsedAssembly {
        let mut body = NodeInfo::new(2, Some(1), NodeKind::Mesh, "body");
        body.instances = vec![5];
        body.layer = Some("Solids".into());
        body.representation_item = Some(AuthoredNodeId::new(11));

        let mut sub = NodeInfo::new(1, Some(0), NodeKind::ProductOccurrence, "sub");
        sub.part_definition = Some(AuthoredNodeId::new(10));
        sub.generic_type = Some("IfcWall".into());
        sub.generic_id = Some("wall-1".into());

        let mut external = NodeInfo::new(3, Some(0), NodeKind::ProductOccurrence, "ext");
        external.external_model = Some(ExternalModelInfo {
            name: "bolt".into(),
            bounds: Some(BoundingBox::new(glam::Vec3::ZERO, glam::Vec3::ONE)),
        });

        let mut parsed = ParsedAssembly {
            nodes: vec![NodeInfo::new(0, None, NodeKind::ProductOccurrence, "top"), sub, body, external],
            part_definitions: vec![PartDefinitionInfo {
                authored_id: AuthoredNodeId::new(10),
                name: "part".into(),
                items: vec![AuthoredNodeId::new(11)],
                bounds: None,
            }],
            representation_items: vec![RepresentationItemInfo {
                authored_id: AuthoredNodeId::new(11),
                name: "item".into(),
                instances: vec![5],
                bounds: None,
            }],
            filters: vec![FilterInfo {
                name: "only-body".into(),
                inclusive: true,
                nodes: vec![AuthoredNodeId::new(2)],
            }],
            relationships: vec![RelationshipInfo {
                kind: "Contains".into(),
                from: AuthoredNodeId::new(1),
                to: AuthoredNodeId::new(2),
            }],
            ..Default::default()
        };
        parsed.id_span = parsed.required_span();
        parsed
    }

    fn inclusion(tree: &mut AssemblyTree, span: u32) -> ContextId {
        let load = tree.create_load_context(Parent::Node(tree.root_id())).unwrap();
        let inclusion = tree.create_inclusion_context(load, span).unwrap();
        tree.inclusion_context_mut(inclusion).unwrap().model_key = Some(ModelKey(4));
        inclusion
    }

    #[test]
    fn test_reify_full_document() {
        let mut tree = AssemblyTree::new();
        let parsed = Arc::new(sample());
        let ctx = inclusion(&mut tree, parsed.id_span);
        let offset = tree.inclusion_context(ctx).unwrap().offset;
        let rid = |n| RuntimeNodeId::from_authored(AuthoredNodeId::new(n), offset).unwrap();

        let report = tree.reify(ctx, parsed).unwrap();
        assert_eq!(report.roots, vec![rid(0)]);
        assert_eq!(report.nodes, 4);
        assert_eq!(report.references, 2);
        assert_eq!(report.external_models.len(), 1);
        assert_eq!(report.external_models[0].node, rid(3));
        assert_eq!(report.external_models[0].name, "bolt");

        assert_eq!(tree.children(tree.root_id()), vec![rid(0)]);
        assert_eq!(tree.children(rid(0)), vec![rid(1), rid(3)]);
        let body = tree.lookup_body_node(rid(2)).unwrap();
        assert_eq!(body.instances(), &[InstanceHandle::new(ModelKey(4), InstanceKey(5))]);
        assert_eq!(tree.load_status(rid(3)), Some(LoadStatus::Unloaded));
        assert!(tree.lookup_any_tree_node(rid(3)).unwrap().flags().external_model);
        assert_eq!(tree.lookup_any_tree_node(rid(3)).unwrap().external_model(), Some("bolt"));

        let solids = tree.indices().layer_by_name("Solids").unwrap();
        assert_eq!(tree.get_nodes_from_layer(solids), vec![rid(2)]);
        assert_eq!(tree.get_nodes_by_generic_type("IfcWall"), vec![rid(1)]);
        assert_eq!(tree.lookup_by_generic_id("wall-1"), Some(rid(1)));
        assert_eq!(tree.lookup_part_definition(rid(10)).unwrap().referrers(), &[rid(1)]);
        assert_eq!(tree.lookup_representation_item(rid(11)).unwrap().referrers(), &[rid(10), rid(2)]);
        assert_eq!(tree.get_nodes_from_filter(crate::index::FilterId(0)), vec![rid(2)]);
        assert_eq!(tree.relationships_of(rid(2)).len(), 1);
    }

    #[test]
    fn test_step_budget() {
        let mut tree = AssemblyTree::new();
        let parsed = Arc::new(sample());
        let ctx = inclusion(&mut tree, parsed.id_span);
        let mut reifier = Reifier::new(&tree, ctx, parsed).unwrap();

        assert!(!reifier.step(&mut tree, 3).unwrap());
        assert_eq!(reifier.progress(), (3, 4));
        assert_eq!(reifier.report().nodes, 3);
        assert!(reifier.step(&mut tree, 3).unwrap());
        assert!(reifier.is_finished());
        assert_eq!(reifier.report().nodes, 4);
    }

    #[test]
    fn test_deleted_parent_skips_subtree() {
        let mut tree = AssemblyTree::new();
        let parsed = Arc::new(sample());
        let ctx = inclusion(&mut tree, parsed.id_span);
        let offset = tree.inclusion_context(ctx).unwrap().offset;
        let rid = |n| RuntimeNodeId::from_authored(AuthoredNodeId::new(n), offset).unwrap();
        let mut reifier = Reifier::new(&tree, ctx, parsed).unwrap();

        reifier.step(&mut tree, 2).unwrap();
        tree.delete_node(rid(1)).unwrap();
        assert!(reifier.step(&mut tree, 10).unwrap());

        assert!(!tree.contains_node(rid(2)));
        assert!(tree.contains_node(rid(3)));
        assert_eq!(reifier.report().skipped, 1);
    }

    #[test]
    fn test_vanished_inclusion_stops() {
        let mut tree = AssemblyTree::new();
        let parsed = Arc::new(sample());
        let ctx = inclusion(&mut tree, parsed.id_span);
        let mut reifier = Reifier::new(&tree, ctx, parsed).unwrap();

        reifier.step(&mut tree, 1).unwrap();
        tree.reset();
        assert_eq!(reifier.step(&mut tree, 10), Err(TreeError::UnknownContext));
    }

    #[test]
    fn test_short_span_rejected() {
        let mut tree = AssemblyTree::new();
        let ctx = inclusion(&mut tree, 2);
        assert!(matches!(
            Reifier::new(&tree, ctx, Arc::new(sample())),
            Err(TreeError::IdRangeExhausted)
        ));
    }

    #[test]
    fn test_prototypes_shared() {
        let mut a = NodeInfo::new(0, None, NodeKind::ProductOccurrence, "a");
        a.prototype = Some(1);
        let mut b = NodeInfo::new(1, None, NodeKind::ProductOccurrence, "b");
        b.prototype = Some(1);
        let mut hidden = NodeInfo::new(3, Some(2), NodeKind::Mesh, "hidden");
        hidden.visible = false;
        let mut parsed = ParsedAssembly {
            nodes: vec![a, b],
            prototypes: vec![PrototypeInfo {
                id: 1,
                nodes: vec![NodeInfo::new(2, None, NodeKind::ProductOccurrence, "shared"), hidden],
            }],
            ..Default::default()
        };
        parsed.id_span = parsed.required_span();

        let mut tree = AssemblyTree::new();
        let ctx = inclusion(&mut tree, parsed.id_span);
        let offset = tree.inclusion_context(ctx).unwrap().offset;
        let rid = |n| RuntimeNodeId::from_authored(AuthoredNodeId::new(n), offset).unwrap();

        let report = tree.reify(ctx, Arc::new(parsed)).unwrap();
        assert_eq!(report.nodes, 4);
        assert_eq!(tree.children(rid(0)), vec![rid(2)]);
        assert_eq!(tree.children(rid(1)), vec![rid(2)]);
        assert_eq!(tree.branch_visibility(rid(1)), Some(BranchVisibility::Hidden));
    }
}
