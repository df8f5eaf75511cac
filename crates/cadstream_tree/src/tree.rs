//! Assembly tree registry
//!
//! [`AssemblyTree`] owns every node, context and reference node of a session
//! together with the cross-cutting indices. Nodes and contexts share one
//! arena of [`Entry`] values linked by structural parent/child keys; the
//! public traversal ([`AssemblyTree::children`], [`AssemblyTree::parent`])
//! looks through contexts and follows prototype references, so contexts
//! never show up to consumers.
//!
//! Queries never fail. Mutations that would break an invariant report
//! `false` (or [`DeleteOutcome::Blocked`](crate::DeleteOutcome)), and misuse
//! such as registering a live id returns a [`TreeError`].

use crate::arena::{Arena, EntryKey};
use crate::context::{
    AttachContext, Context, ContextId, ContextKind, InclusionContext, LoadContext, PrototypeContext,
    Relationship,
};
use crate::index::{Filter, FilterId, LayerId, TreeIndices};
use crate::node::{LoadStatus, NodeFlags, NodeKind, TreeNode};
use crate::offset::OffsetAllocator;
use crate::reference::{ReferenceKind, ReferenceNode};
use cadstream_core::error::{TreeError, TreeResult};
use cadstream_core::id::{
    DynamicIdGenerator, DynamicNodeId, InstanceHandle, MeshKey, NodeIdOffset, RuntimeNodeId,
};
use glam::Mat4;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Runtime id of the absolute root node (first dynamic id)
const ROOT_ID: RuntimeNodeId = RuntimeNodeId::from_raw(-2);

/// Arena entry: a tree node or a context
pub enum Entry {
    Node(TreeNode),
    Context(Context),
}

impl Entry {
    pub(crate) fn parent(&self) -> Option<EntryKey> {
        match self {
            Entry::Node(n) => n.parent,
            Entry::Context(c) => c.parent,
        }
    }

    pub(crate) fn set_parent(&mut self, parent: Option<EntryKey>) {
        match self {
            Entry::Node(n) => n.parent = parent,
            Entry::Context(c) => c.parent = parent,
        }
    }

    pub(crate) fn children(&self) -> &[EntryKey] {
        match self {
            Entry::Node(n) => &n.children,
            Entry::Context(c) => &c.children,
        }
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<EntryKey> {
        match self {
            Entry::Node(n) => &mut n.children,
            Entry::Context(c) => &mut c.children,
        }
    }

    pub fn as_node(&self) -> Option<&TreeNode> {
        match self {
            Entry::Node(n) => Some(n),
            Entry::Context(_) => None,
        }
    }

    pub fn as_context(&self) -> Option<&Context> {
        match self {
            Entry::Context(c) => Some(c),
            Entry::Node(_) => None,
        }
    }
}

/// Token of one in-flight load
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoadToken(u64);

impl LoadToken {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Where a new node or context is placed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parent {
    Node(RuntimeNodeId),
    Context(ContextId),
}

/// Structural parent of an entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructuralParent {
    Node(RuntimeNodeId),
    Context(ContextId),
}

/// Registry of every node, context and index of one session
pub struct AssemblyTree {
    pub(crate) entries: Arena<Entry>,
    pub(crate) nodes: HashMap<RuntimeNodeId, EntryKey>,
    pub(crate) references: HashMap<RuntimeNodeId, ReferenceNode>,
    pub(crate) prototype_refs: HashMap<RuntimeNodeId, EntryKey>,
    pub(crate) root_load: EntryKey,
    pub(crate) offsets: OffsetAllocator,
    pub(crate) indices: TreeIndices,
    pub(crate) deletion_blockers: HashMap<RuntimeNodeId, u32>,
    pub(crate) mesh_blockers: HashMap<MeshKey, u32>,
    pub(crate) deferred_meshes: BTreeSet<MeshKey>,
    pub(crate) loads: BTreeMap<LoadToken, EntryKey>,
    dynamic_ids: DynamicIdGenerator,
    next_load_token: u64,
}

impl AssemblyTree {
    /// Create a tree holding only the root load context and the root node
    pub fn new() -> Self {
        let mut entries = Arena::new();
        let root_load = entries.insert(Entry::Context(Context::new(ContextKind::Load(
            LoadContext::default(),
        ))));

        let mut dynamic_ids = DynamicIdGenerator::new();
        // The first dynamic id is reserved for the root node
        let _ = dynamic_ids.next();

        let mut root = TreeNode::new(ROOT_ID, NodeKind::ProductOccurrence, "root").with_flags(NodeFlags {
            dynamic: true,
            ..Default::default()
        });
        root.parent = Some(root_load);
        let root_key = entries.insert(Entry::Node(root));
        if let Some(load) = entries.get_mut(root_load) {
            load.children_mut().push(root_key);
        }

        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID, root_key);

        Self {
            entries,
            nodes,
            references: HashMap::new(),
            prototype_refs: HashMap::new(),
            root_load,
            offsets: OffsetAllocator::new(),
            indices: TreeIndices::new(),
            deletion_blockers: HashMap::new(),
            mesh_blockers: HashMap::new(),
            deferred_meshes: BTreeSet::new(),
            loads: BTreeMap::new(),
            dynamic_ids,
            next_load_token: 1,
        }
    }

    /// Id of the absolute root node
    pub fn root_id(&self) -> RuntimeNodeId {
        ROOT_ID
    }

    /// The absolute root load context
    pub fn root_load_context(&self) -> ContextId {
        ContextId(self.root_load)
    }

    // ========================================================================
    // Id allocation
    // ========================================================================

    /// Generate a fresh dynamic id
    pub fn generate_dynamic_node_id(&mut self) -> TreeResult<DynamicNodeId> {
        self.dynamic_ids.next().ok_or(TreeError::IdRangeExhausted)
    }

    /// Reserve a runtime id range for an inclusion
    pub fn new_node_id_offset(&mut self, span: u32) -> TreeResult<NodeIdOffset> {
        self.offsets.allocate(span).ok_or(TreeError::IdRangeExhausted)
    }

    /// Release a range reserved with [`AssemblyTree::new_node_id_offset`]
    pub fn release_node_id_offset(&mut self, offset: NodeIdOffset) -> bool {
        self.offsets.release(offset)
    }

    // ========================================================================
    // Internal access
    // ========================================================================

    pub(crate) fn key_of(&self, id: RuntimeNodeId) -> TreeResult<EntryKey> {
        self.nodes.get(&id).copied().ok_or(TreeError::UnknownNode(id))
    }

    pub(crate) fn node_at(&self, key: EntryKey) -> Option<&TreeNode> {
        self.entries.get(key).and_then(Entry::as_node)
    }

    pub(crate) fn node_mut(&mut self, id: RuntimeNodeId) -> TreeResult<&mut TreeNode> {
        let key = self.key_of(id)?;
        match self.entries.get_mut(key) {
            Some(Entry::Node(node)) => Ok(node),
            _ => Err(TreeError::UnknownNode(id)),
        }
    }

    pub(crate) fn context_kind_mut(&mut self, id: ContextId) -> TreeResult<&mut ContextKind> {
        match self.entries.get_mut(id.0) {
            Some(Entry::Context(c)) => Ok(&mut c.kind),
            _ => Err(TreeError::UnknownContext),
        }
    }

    fn parent_key(&self, parent: Parent) -> TreeResult<EntryKey> {
        match parent {
            Parent::Node(id) => {
                let key = self.key_of(id)?;
                match self.node_at(key) {
                    Some(node) if node.kind().is_container() => Ok(key),
                    _ => Err(TreeError::WrongNodeType {
                        id,
                        expected: "container node",
                    }),
                }
            }
            Parent::Context(ctx) => match self.entries.get(ctx.0) {
                Some(Entry::Context(_)) => Ok(ctx.0),
                _ => Err(TreeError::UnknownContext),
            },
        }
    }

    pub(crate) fn link(&mut self, parent: EntryKey, child: EntryKey) {
        if let Some(entry) = self.entries.get_mut(child) {
            entry.set_parent(Some(parent));
        }
        if let Some(entry) = self.entries.get_mut(parent) {
            entry.children_mut().push(child);
        }
    }

    pub(crate) fn unlink(&mut self, child: EntryKey) {
        let parent = self.entries.get(child).and_then(Entry::parent);
        if let Some(parent) = parent.and_then(|p| self.entries.get_mut(p)) {
            parent.children_mut().retain(|c| *c != child);
        }
        if let Some(entry) = self.entries.get_mut(child) {
            entry.set_parent(None);
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a tree node
    pub fn register_node(&mut self, parent: Parent, node: TreeNode) -> TreeResult<RuntimeNodeId> {
        let id = node.id();
        if id.is_invalid() {
            return Err(TreeError::InvalidNodeId);
        }
        if self.nodes.contains_key(&id) || self.references.contains_key(&id) {
            return Err(TreeError::DuplicateNodeId(id));
        }
        let parent_key = self.parent_key(parent)?;

        let kind = node.kind();
        let flags = node.flags();
        let key = self.entries.insert(Entry::Node(node));
        self.link(parent_key, key);
        self.nodes.insert(id, key);

        match kind {
            NodeKind::CadView => self.indices.register_cad_view(id, flags.default_view),
            NodeKind::Configuration => self
                .indices
                .register_cad_configuration(id, flags.default_configuration),
            _ => {}
        }

        self.invalidate_ancestors(key);
        Ok(id)
    }

    /// Register a part definition or representation item
    pub fn register_reference(&mut self, reference: ReferenceNode) -> TreeResult<RuntimeNodeId> {
        let id = reference.id();
        if id.is_invalid() {
            return Err(TreeError::InvalidNodeId);
        }
        if self.nodes.contains_key(&id) || self.references.contains_key(&id) {
            return Err(TreeError::DuplicateNodeId(id));
        }
        self.references.insert(id, reference);
        Ok(id)
    }

    /// Record `referrer` as a user of a reference node
    pub fn add_reference_referrer(&mut self, reference: RuntimeNodeId, referrer: RuntimeNodeId) -> bool {
        match self.references.get_mut(&reference) {
            Some(r) => {
                r.add_referrer(referrer);
                true
            }
            None => false,
        }
    }

    /// Create a node with a fresh dynamic id
    pub fn create_node(
        &mut self,
        parent: RuntimeNodeId,
        kind: NodeKind,
        name: &str,
        matrix: Mat4,
        visible: bool,
    ) -> TreeResult<RuntimeNodeId> {
        self.parent_key(Parent::Node(parent))?;
        let dynamic = self.generate_dynamic_node_id()?;
        let id = RuntimeNodeId::from_dynamic(dynamic).ok_or(TreeError::IdRangeExhausted)?;
        let node = TreeNode::new(id, kind, name)
            .with_matrix(matrix)
            .with_visibility(visible)
            .with_flags(NodeFlags {
                dynamic: true,
                ..Default::default()
            });
        self.register_node(Parent::Node(parent), node)
    }

    /// Create a mesh body for an engine instance created at runtime
    pub fn create_mesh_instance_node(
        &mut self,
        parent: RuntimeNodeId,
        name: &str,
        mesh: MeshKey,
        instance: InstanceHandle,
        matrix: Mat4,
        visible: bool,
    ) -> TreeResult<RuntimeNodeId> {
        self.parent_key(Parent::Node(parent))?;
        let dynamic = self.generate_dynamic_node_id()?;
        let id = RuntimeNodeId::from_dynamic(dynamic).ok_or(TreeError::IdRangeExhausted)?;
        let node = TreeNode::new(id, NodeKind::Mesh, name)
            .with_matrix(matrix)
            .with_visibility(visible)
            .with_mesh(mesh)
            .with_instances(vec![instance])
            .with_flags(NodeFlags {
                dynamic: true,
                ..Default::default()
            });
        self.register_node(Parent::Node(parent), node)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Any live tree node
    pub fn lookup_any_tree_node(&self, id: RuntimeNodeId) -> Option<&TreeNode> {
        self.nodes.get(&id).and_then(|k| self.node_at(*k))
    }

    /// A live container node
    pub fn lookup_container_node(&self, id: RuntimeNodeId) -> Option<&TreeNode> {
        self.lookup_any_tree_node(id).filter(|n| n.kind().is_container())
    }

    /// A live product occurrence
    pub fn lookup_product_occurrence(&self, id: RuntimeNodeId) -> Option<&TreeNode> {
        self.lookup_any_tree_node(id)
            .filter(|n| n.kind() == NodeKind::ProductOccurrence)
    }

    /// A live body node
    pub fn lookup_body_node(&self, id: RuntimeNodeId) -> Option<&TreeNode> {
        self.lookup_any_tree_node(id).filter(|n| n.kind().is_body())
    }

    /// A live CAD view
    pub fn lookup_cad_view(&self, id: RuntimeNodeId) -> Option<&TreeNode> {
        self.lookup_any_tree_node(id).filter(|n| n.kind() == NodeKind::CadView)
    }

    /// A live part definition
    pub fn lookup_part_definition(&self, id: RuntimeNodeId) -> Option<&ReferenceNode> {
        self.references
            .get(&id)
            .filter(|r| r.kind() == ReferenceKind::PartDefinition)
    }

    /// A live representation item
    pub fn lookup_representation_item(&self, id: RuntimeNodeId) -> Option<&ReferenceNode> {
        self.references
            .get(&id)
            .filter(|r| r.kind() == ReferenceKind::RepresentationItem)
    }

    /// Check if a tree node is live
    pub fn contains_node(&self, id: RuntimeNodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of live tree nodes, including the root
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of live reference nodes
    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    // ========================================================================
    // Contexts
    // ========================================================================

    /// Create a load context
    pub fn create_load_context(&mut self, parent: Parent) -> TreeResult<ContextId> {
        self.insert_context(parent, ContextKind::Load(LoadContext::default()))
    }

    /// Create an attach context
    pub fn create_attach_context(&mut self, parent: Parent, label: &str) -> TreeResult<ContextId> {
        self.insert_context(
            parent,
            ContextKind::Attach(AttachContext {
                label: label.to_string(),
                ..Default::default()
            }),
        )
    }

    /// Create an inclusion context under a load or attach context, reserving `span` ids
    pub fn create_inclusion_context(&mut self, parent: ContextId, span: u32) -> TreeResult<ContextId> {
        match self.context(parent).map(Context::kind) {
            Some(ContextKind::Load(_)) | Some(ContextKind::Attach(_)) => {}
            Some(_) => return Err(TreeError::WrongContextType("load or attach")),
            None => return Err(TreeError::UnknownContext),
        }
        let offset = self.new_node_id_offset(span)?;
        log::trace!("AssemblyTree: inclusion offset {} span {}", offset.raw(), span);
        self.insert_context(
            Parent::Context(parent),
            ContextKind::Inclusion(InclusionContext::new(offset, span.max(1))),
        )
    }

    fn insert_context(&mut self, parent: Parent, kind: ContextKind) -> TreeResult<ContextId> {
        let parent_key = self.parent_key(parent)?;
        let key = self.entries.insert(Entry::Context(Context::new(kind)));
        self.link(parent_key, key);
        Ok(ContextId(key))
    }

    /// Look up a context
    pub fn context(&self, id: ContextId) -> Option<&Context> {
        self.entries.get(id.0).and_then(Entry::as_context)
    }

    /// Check if a context is live
    pub fn contains_context(&self, id: ContextId) -> bool {
        self.context(id).is_some()
    }

    /// Check if a live context has no entries below it
    pub fn is_context_empty(&self, id: ContextId) -> bool {
        self.context(id).is_some_and(|c| c.children.is_empty())
    }

    /// Number of live contexts, including the root load context
    pub fn context_count(&self) -> usize {
        self.entries.iter().filter(|(_, e)| e.as_context().is_some()).count()
    }

    /// Mutable access to a load context
    pub fn load_context_mut(&mut self, id: ContextId) -> TreeResult<&mut LoadContext> {
        match self.context_kind_mut(id)? {
            ContextKind::Load(c) => Ok(c),
            _ => Err(TreeError::WrongContextType("load")),
        }
    }

    /// Mutable access to an attach context
    pub fn attach_context_mut(&mut self, id: ContextId) -> TreeResult<&mut AttachContext> {
        match self.context_kind_mut(id)? {
            ContextKind::Attach(c) => Ok(c),
            _ => Err(TreeError::WrongContextType("attach")),
        }
    }

    /// Mutable access to an inclusion context
    pub fn inclusion_context_mut(&mut self, id: ContextId) -> TreeResult<&mut InclusionContext> {
        match self.context_kind_mut(id)? {
            ContextKind::Inclusion(c) => Ok(c),
            _ => Err(TreeError::WrongContextType("inclusion")),
        }
    }

    /// An inclusion context
    pub fn inclusion_context(&self, id: ContextId) -> Option<&InclusionContext> {
        self.context(id).and_then(Context::as_inclusion)
    }

    /// Nearest context of the requested kind above an entry (through prototypes)
    fn enclosing_context(&self, start: EntryKey, want: fn(&ContextKind) -> bool) -> Option<EntryKey> {
        let mut current = self.entries.get(start)?.parent();
        while let Some(key) = current {
            let entry = self.entries.get(key)?;
            current = match entry {
                Entry::Context(context) if want(&context.kind) => return Some(key),
                Entry::Context(Context {
                    kind: ContextKind::Prototype(p),
                    ..
                }) => Some(p.inclusion),
                _ => entry.parent(),
            };
        }
        None
    }

    /// Inclusion owning a node
    pub fn owning_inclusion(&self, id: RuntimeNodeId) -> Option<ContextId> {
        let key = *self.nodes.get(&id)?;
        self.enclosing_context(key, |k| matches!(k, ContextKind::Inclusion(_)))
            .map(ContextId)
    }

    /// Attach context owning a node or context
    pub fn owning_attach_context(&self, parent: Parent) -> Option<ContextId> {
        let key = match parent {
            Parent::Node(id) => *self.nodes.get(&id)?,
            Parent::Context(ctx) => ctx.0,
        };
        self.enclosing_context(key, |k| matches!(k, ContextKind::Attach(_)))
            .map(ContextId)
    }

    /// Load context owning a node
    pub fn owning_load_context(&self, id: RuntimeNodeId) -> Option<ContextId> {
        let key = *self.nodes.get(&id)?;
        self.enclosing_context(key, |k| matches!(k, ContextKind::Load(_)))
            .map(ContextId)
    }

    /// Nearest tree node above a context
    pub fn context_anchor(&self, id: ContextId) -> Option<RuntimeNodeId> {
        self.public_parent_of_entry(id.0)
    }

    /// Topmost tree nodes inside a context
    pub fn context_nodes(&self, id: ContextId) -> Vec<RuntimeNodeId> {
        let mut out = Vec::new();
        if let Some(entry) = self.entries.get(id.0) {
            for child in entry.children() {
                self.collect_public(*child, &mut out);
            }
        }
        out
    }

    // ========================================================================
    // Prototypes
    // ========================================================================

    /// Prototype context already reified for an inclusion
    pub fn inclusion_prototype(&self, inclusion: ContextId, prototype: u32) -> Option<ContextId> {
        self.inclusion_context(inclusion)?
            .prototypes
            .get(&prototype)
            .copied()
            .map(ContextId)
    }

    /// Create a parentless prototype context owned by an inclusion
    pub fn create_prototype_context(&mut self, inclusion: ContextId, prototype: u32) -> TreeResult<ContextId> {
        self.inclusion_context_mut(inclusion)?;
        let key = self
            .entries
            .insert(Entry::Context(Context::new(ContextKind::Prototype(PrototypeContext {
                prototype,
                inclusion: inclusion.0,
                referrers: Vec::new(),
            }))));
        self.inclusion_context_mut(inclusion)?
            .prototypes
            .insert(prototype, key);
        Ok(ContextId(key))
    }

    /// Point an occurrence at a prototype
    pub fn add_prototype_referrer(&mut self, prototype: ContextId, referrer: RuntimeNodeId) -> TreeResult<()> {
        let referrer_key = self.key_of(referrer)?;
        match self.context_kind_mut(prototype)? {
            ContextKind::Prototype(p) => {
                if !p.referrers.contains(&referrer) {
                    p.referrers.push(referrer);
                }
            }
            _ => return Err(TreeError::WrongContextType("prototype")),
        }
        self.prototype_refs.insert(referrer, prototype.0);
        if let Some(node) = self.node_at(referrer_key) {
            node.invalidate_branch_visibility();
        }
        self.invalidate_ancestors(referrer_key);
        Ok(())
    }

    /// Prototype referenced by an occurrence
    pub fn prototype_of(&self, referrer: RuntimeNodeId) -> Option<ContextId> {
        self.prototype_refs.get(&referrer).copied().map(ContextId)
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    fn collect_public(&self, key: EntryKey, out: &mut Vec<RuntimeNodeId>) {
        match self.entries.get(key) {
            Some(Entry::Node(node)) => out.push(node.id()),
            Some(Entry::Context(context)) => {
                for child in &context.children {
                    self.collect_public(*child, out);
                }
            }
            None => {}
        }
    }

    pub(crate) fn public_child_ids(&self, key: EntryKey) -> Vec<RuntimeNodeId> {
        let mut out = Vec::new();
        let Some(entry) = self.entries.get(key) else {
            return out;
        };
        for child in entry.children() {
            self.collect_public(*child, &mut out);
        }
        if let Some(node) = entry.as_node() {
            if let Some(prototype) = self.prototype_refs.get(&node.id()) {
                self.collect_public(*prototype, &mut out);
            }
        }
        out
    }

    /// Public children of a node, looking through contexts and prototypes
    pub fn children(&self, id: RuntimeNodeId) -> Vec<RuntimeNodeId> {
        match self.nodes.get(&id) {
            Some(key) => self.public_child_ids(*key),
            None => Vec::new(),
        }
    }

    fn public_parent_of_entry(&self, key: EntryKey) -> Option<RuntimeNodeId> {
        let mut current = self.entries.get(key)?.parent();
        while let Some(parent_key) = current {
            match self.entries.get(parent_key)? {
                Entry::Node(node) => return Some(node.id()),
                Entry::Context(context) => {
                    if let ContextKind::Prototype(p) = &context.kind {
                        return p.referrers.first().copied();
                    }
                    current = context.parent;
                }
            }
        }
        None
    }

    /// Public parent of a node; prototype content reports its first referrer
    pub fn parent(&self, id: RuntimeNodeId) -> Option<RuntimeNodeId> {
        let key = self.nodes.get(&id)?;
        self.public_parent_of_entry(*key)
    }

    /// Structural parent (node or context) of a node
    pub fn structural_parent(&self, id: RuntimeNodeId) -> Option<StructuralParent> {
        let key = self.nodes.get(&id)?;
        let parent = self.entries.get(*key)?.parent()?;
        match self.entries.get(parent)? {
            Entry::Node(node) => Some(StructuralParent::Node(node.id())),
            Entry::Context(_) => Some(StructuralParent::Context(ContextId(parent))),
        }
    }

    /// Public ancestors, nearest first
    pub fn ancestors(&self, id: RuntimeNodeId) -> Vec<RuntimeNodeId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(parent) = current {
            if out.contains(&parent) {
                break;
            }
            out.push(parent);
            current = self.parent(parent);
        }
        out
    }

    /// Visit a node and its public descendants depth-first, parents first
    pub fn walk(&self, id: RuntimeNodeId, visit: &mut dyn FnMut(&TreeNode)) {
        let Some(node) = self.lookup_any_tree_node(id) else {
            return;
        };
        visit(node);
        for child in self.children(id) {
            self.walk(child, visit);
        }
    }

    /// Public descendants of a node, depth-first
    pub fn descendants(&self, id: RuntimeNodeId) -> Vec<RuntimeNodeId> {
        let mut out = Vec::new();
        self.walk(id, &mut |node| out.push(node.id()));
        if !out.is_empty() {
            out.remove(0);
        }
        out
    }

    // ========================================================================
    // Load tracking
    // ========================================================================

    /// Start tracking a load rooted at a load context
    pub fn on_load_begin(&mut self, context: ContextId) -> LoadToken {
        let token = LoadToken(self.next_load_token);
        self.next_load_token += 1;
        self.loads.insert(token, context.0);
        token
    }

    /// Stop tracking a load; returns false if the token was not active
    pub fn on_load_end(&mut self, token: LoadToken) -> bool {
        self.loads.remove(&token).is_some()
    }

    /// Loads currently in flight
    pub fn active_loads(&self) -> Vec<LoadToken> {
        self.loads.keys().copied().collect()
    }

    /// Load context of an in-flight load
    pub fn load_context_of(&self, token: LoadToken) -> Option<ContextId> {
        self.loads.get(&token).copied().map(ContextId)
    }

    // ========================================================================
    // Node state
    // ========================================================================

    /// Set the load status of a placeholder
    pub fn set_load_status(&mut self, id: RuntimeNodeId, status: LoadStatus) -> bool {
        match self.node_mut(id) {
            Ok(node) => {
                node.set_status(status);
                true
            }
            Err(_) => false,
        }
    }

    /// Load status of a node
    pub fn load_status(&self, id: RuntimeNodeId) -> Option<LoadStatus> {
        self.lookup_any_tree_node(id).map(TreeNode::status)
    }

    /// Rename a node
    pub fn set_node_name(&mut self, id: RuntimeNodeId, name: &str) -> bool {
        match self.node_mut(id) {
            Ok(node) => {
                node.set_name(name);
                true
            }
            Err(_) => false,
        }
    }

    /// Replace the instances of a body node
    pub fn set_node_instances(&mut self, id: RuntimeNodeId, instances: Vec<InstanceHandle>) -> TreeResult<()> {
        let node = self.node_mut(id)?;
        if !node.kind().is_body() {
            return Err(TreeError::WrongNodeType {
                id,
                expected: "body node",
            });
        }
        node.set_instances(instances);
        Ok(())
    }

    // ========================================================================
    // Indices
    // ========================================================================

    /// Read access to the indices
    pub fn indices(&self) -> &TreeIndices {
        &self.indices
    }

    /// Get or create a layer
    pub fn register_layer(&mut self, name: &str) -> LayerId {
        self.indices.register_layer(name)
    }

    /// Put a live node on a layer
    pub fn register_node_in_layer(&mut self, id: RuntimeNodeId, layer: LayerId) -> bool {
        self.contains_node(id) && self.indices.register_node_in_layer(id, layer)
    }

    /// Take a node off its layer
    pub fn unregister_node_from_layer(&mut self, id: RuntimeNodeId) -> Option<LayerId> {
        self.indices.unregister_node_from_layer(id)
    }

    /// Nodes on a layer
    pub fn get_nodes_from_layer(&self, layer: LayerId) -> Vec<RuntimeNodeId> {
        self.indices.get_nodes_from_layer(layer)
    }

    /// Layer of a node
    pub fn get_layer_of_node(&self, id: RuntimeNodeId) -> Option<LayerId> {
        self.indices.get_layer_of_node(id)
    }

    /// Create a filter over the live nodes among `nodes`
    pub fn add_filter(&mut self, name: &str, inclusive: bool, nodes: &[RuntimeNodeId]) -> FilterId {
        let live: Vec<_> = nodes.iter().copied().filter(|n| self.contains_node(*n)).collect();
        self.indices.add_filter(name, inclusive, live)
    }

    /// Remove a filter
    pub fn remove_filter(&mut self, id: FilterId) -> Option<Filter> {
        self.indices.remove_filter(id)
    }

    /// Filters containing a node
    pub fn get_filters_with_node(&self, id: RuntimeNodeId) -> Vec<FilterId> {
        self.indices.get_filters_with_node(id)
    }

    /// Nodes of a filter
    pub fn get_nodes_from_filter(&self, id: FilterId) -> Vec<RuntimeNodeId> {
        self.indices.get_nodes_from_filter(id)
    }

    /// Tag a live node with a generic type
    pub fn register_generic_type(&mut self, id: RuntimeNodeId, generic_type: &str) -> bool {
        if !self.contains_node(id) {
            return false;
        }
        self.indices.register_generic_type(id, generic_type);
        true
    }

    /// Remove a node's generic type
    pub fn unregister_generic_type(&mut self, id: RuntimeNodeId) -> Option<String> {
        self.indices.unregister_generic_type(id)
    }

    /// Nodes of a generic type
    pub fn get_nodes_by_generic_type(&self, generic_type: &str) -> Vec<RuntimeNodeId> {
        self.indices.get_nodes_by_generic_type(generic_type)
    }

    /// Tag a live node with a unique generic id
    pub fn register_generic_id(&mut self, id: RuntimeNodeId, generic_id: &str) -> bool {
        self.contains_node(id) && self.indices.register_generic_id(id, generic_id)
    }

    /// Node with a generic id
    pub fn lookup_by_generic_id(&self, generic_id: &str) -> Option<RuntimeNodeId> {
        self.indices.lookup_by_generic_id(generic_id)
    }

    /// Registered CAD views
    pub fn cad_views(&self) -> Vec<RuntimeNodeId> {
        self.indices.cad_views()
    }

    /// CAD view shown when the model opens
    pub fn default_cad_view(&self) -> Option<RuntimeNodeId> {
        self.indices.default_cad_view()
    }

    /// Registered CAD configurations
    pub fn cad_configurations(&self) -> Vec<RuntimeNodeId> {
        self.indices.cad_configurations()
    }

    /// Active CAD configuration
    pub fn active_cad_configuration(&self) -> Option<RuntimeNodeId> {
        self.indices.active_cad_configuration()
    }

    /// Activate a CAD configuration
    pub fn activate_cad_configuration(&mut self, id: RuntimeNodeId) -> bool {
        self.indices.activate_cad_configuration(id)
    }

    /// Record a BIM relationship between two nodes of the same inclusion
    pub fn add_relationship(&mut self, kind: &str, from: RuntimeNodeId, to: RuntimeNodeId) -> bool {
        let (Some(a), Some(b)) = (self.owning_inclusion(from), self.owning_inclusion(to)) else {
            return false;
        };
        if a != b {
            return false;
        }
        match self.inclusion_context_mut(a) {
            Ok(inclusion) => {
                inclusion.relationships.add(Relationship {
                    kind: kind.to_string(),
                    from,
                    to,
                });
                true
            }
            Err(_) => false,
        }
    }

    /// BIM relationships touching a node
    pub fn relationships_of(&self, id: RuntimeNodeId) -> Vec<Relationship> {
        self.owning_inclusion(id)
            .and_then(|ctx| self.inclusion_context(ctx))
            .map(|inclusion| inclusion.relationships.of(id))
            .unwrap_or_default()
    }
}

impl Default for AssemblyTree {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for AssemblyTree {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AssemblyTree")
            .field("nodes", &self.nodes.len())
            .field("references", &self.references.len())
            .field("entries", &self.entries.len())
            .field("active_loads", &self.loads.len())
            .finish()
    }
}
