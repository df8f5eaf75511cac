//! Structural contexts
//!
//! Contexts are invisible layers between tree nodes. They carry per-load,
//! per-attach and per-inclusion bookkeeping and never appear in the public
//! child lists; traversal reports their children as children of the nearest
//! tree-node ancestor.

use crate::arena::EntryKey;
use crate::remap::ScKeyRemapper;
use cadstream_core::engine::ModelSource;
use cadstream_core::error::LoadError;
use cadstream_core::id::{InclusionKey, ModelKey, NodeIdOffset, RuntimeNodeId};
use cadstream_tasks::LazyFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// Handle of one context in the tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) EntryKey);

/// Cached resolution of one external model name
pub type ResolvedModel = Arc<LazyFuture<Option<ModelSource>, LoadError>>;

// ============================================================================
// Context kinds
// ============================================================================

/// Root of one load call, or the absolute tree root
#[derive(Default)]
pub struct LoadContext {
    resolved_models: HashMap<String, ResolvedModel>,
}

impl LoadContext {
    /// Cached resolution of a model name, created with `resolve` on first use
    pub fn resolved_model(&mut self, name: &str, resolve: impl FnOnce() -> ResolvedModel) -> ResolvedModel {
        self.resolved_models
            .entry(name.to_string())
            .or_insert_with(resolve)
            .clone()
    }

    /// Number of distinct model names resolved through this load
    pub fn resolved_model_count(&self) -> usize {
        self.resolved_models.len()
    }
}

/// Root of one engine attach
#[derive(Default)]
pub struct AttachContext {
    pub label: String,
    pub remapper: ScKeyRemapper,
    pub master_model_key: Option<ModelKey>,
    pub reserved_offset: Option<(NodeIdOffset, u32)>,
}

/// One BIM relationship between two nodes of an inclusion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relationship {
    pub kind: String,
    pub from: RuntimeNodeId,
    pub to: RuntimeNodeId,
}

/// Relationships local to one inclusion
#[derive(Clone, Debug, Default)]
pub struct RelationshipIndex {
    entries: Vec<Relationship>,
}

impl RelationshipIndex {
    /// Record a relationship
    pub fn add(&mut self, relationship: Relationship) {
        if !self.entries.contains(&relationship) {
            self.entries.push(relationship);
        }
    }

    /// Relationships touching a node
    pub fn of(&self, node: RuntimeNodeId) -> Vec<Relationship> {
        self.entries
            .iter()
            .filter(|r| r.from == node || r.to == node)
            .cloned()
            .collect()
    }

    /// Drop every relationship touching a node
    pub fn remove_node(&mut self, node: RuntimeNodeId) {
        self.entries.retain(|r| r.from != node && r.to != node);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One instantiation of a model
pub struct InclusionContext {
    pub offset: NodeIdOffset,
    pub span: u32,
    pub inclusion_key: Option<InclusionKey>,
    pub model_key: Option<ModelKey>,
    pub relationships: RelationshipIndex,
    pub(crate) prototypes: HashMap<u32, EntryKey>,
}

impl InclusionContext {
    pub(crate) fn new(offset: NodeIdOffset, span: u32) -> Self {
        Self {
            offset,
            span,
            inclusion_key: None,
            model_key: None,
            relationships: RelationshipIndex::default(),
            prototypes: HashMap::new(),
        }
    }

    /// Check if an authored-derived runtime id falls inside this inclusion's range
    pub fn owns(&self, id: RuntimeNodeId) -> bool {
        let start = self.offset.raw() as i64;
        let raw = id.raw() as i64;
        raw >= start && raw < start + self.span as i64
    }
}

/// Shared subtree referenced by many occurrences
pub struct PrototypeContext {
    pub prototype: u32,
    pub(crate) inclusion: EntryKey,
    pub(crate) referrers: Vec<RuntimeNodeId>,
}

impl PrototypeContext {
    /// Occurrences referencing this prototype
    pub fn referrers(&self) -> &[RuntimeNodeId] {
        &self.referrers
    }
}

/// Context payload
pub enum ContextKind {
    Load(LoadContext),
    Attach(AttachContext),
    Inclusion(InclusionContext),
    Prototype(PrototypeContext),
}

impl ContextKind {
    /// Human-readable kind name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Attach(_) => "attach",
            Self::Inclusion(_) => "inclusion",
            Self::Prototype(_) => "prototype",
        }
    }
}

/// Context entry in the tree arena
pub struct Context {
    pub(crate) kind: ContextKind,
    pub(crate) parent: Option<EntryKey>,
    pub(crate) children: Vec<EntryKey>,
}

impl Context {
    pub(crate) fn new(kind: ContextKind) -> Self {
        Self {
            kind,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn kind(&self) -> &ContextKind {
        &self.kind
    }

    pub fn as_load(&self) -> Option<&LoadContext> {
        match &self.kind {
            ContextKind::Load(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_attach(&self) -> Option<&AttachContext> {
        match &self.kind {
            ContextKind::Attach(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_inclusion(&self) -> Option<&InclusionContext> {
        match &self.kind {
            ContextKind::Inclusion(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_prototype(&self) -> Option<&PrototypeContext> {
        match &self.kind {
            ContextKind::Prototype(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inclusion_range() {
        let inclusion = InclusionContext::new(NodeIdOffset::new(100), 10);
        assert!(inclusion.owns(RuntimeNodeId::from_raw(100)));
        assert!(inclusion.owns(RuntimeNodeId::from_raw(109)));
        assert!(!inclusion.owns(RuntimeNodeId::from_raw(110)));
        assert!(!inclusion.owns(RuntimeNodeId::from_raw(99)));
    }

    #[test]
    fn test_relationship_index() {
        let a = RuntimeNodeId::from_raw(1);
        let b = RuntimeNodeId::from_raw(2);
        let c = RuntimeNodeId::from_raw(3);
        let mut index = RelationshipIndex::default();

        index.add(Relationship { kind: "Contains".into(), from: a, to: b });
        index.add(Relationship { kind: "Contains".into(), from: a, to: b });
        index.add(Relationship { kind: "Connects".into(), from: b, to: c });

        assert_eq!(index.len(), 2);
        assert_eq!(index.of(b).len(), 2);
        index.remove_node(b);
        assert!(index.is_empty());
    }
}
