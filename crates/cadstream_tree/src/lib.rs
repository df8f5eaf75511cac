//! # cadstream_tree - Assembly Tree Registry
//!
//! Live model of a CAD assembly:
//! - AssemblyTree: nodes, contexts and reference nodes in one arena
//! - Contexts: load, attach, inclusion and prototype bookkeeping
//! - Indices: layers, filters, generic types and ids, views, configurations
//! - Reifier: incremental registration of parsed structure records
//! - Deletion with counted node and mesh blockers
//!
//! ## Example
//!
//! ```ignore
//! use cadstream_tree::prelude::*;
//!
//! let mut tree = AssemblyTree::new();
//! let root = tree.root_id();
//! let part = tree.create_node(root, NodeKind::ProductOccurrence, "part", Mat4::IDENTITY, true)?;
//! tree.set_node_visibility(part, false)?;
//! assert_eq!(tree.branch_visibility(root), Some(BranchVisibility::Hidden));
//! ```

pub mod arena;
pub mod context;
pub mod delete;
pub mod index;
pub mod info;
pub mod node;
pub mod offset;
pub mod reference;
pub mod reify;
pub mod remap;
pub mod tree;
pub mod view;
pub mod visibility;

pub use arena::{Arena, EntryKey};
pub use context::{
    AttachContext, Context, ContextId, ContextKind, InclusionContext, LoadContext, PrototypeContext,
    Relationship, RelationshipIndex, ResolvedModel,
};
pub use delete::{DeleteOutcome, DeletionReport};
pub use index::{Filter, FilterId, LayerId, TreeIndices};
pub use info::{
    AttributeInfo, ExternalModelInfo, FilterInfo, NodeInfo, ParsedAssembly, PartDefinitionInfo,
    PrototypeInfo, RelationshipInfo, RepresentationItemInfo,
};
pub use node::{LoadStatus, NodeFlags, NodeKind, TreeNode};
pub use offset::OffsetAllocator;
pub use reference::{ReferenceKind, ReferenceNode};
pub use reify::{PendingExternalModel, ReifyReport, Reifier};
pub use remap::ScKeyRemapper;
pub use tree::{AssemblyTree, Entry, LoadToken, Parent, StructuralParent};
pub use visibility::BranchVisibility;

/// Prelude - commonly used types
pub mod prelude {
    pub use crate::context::ContextId;
    pub use crate::delete::{DeleteOutcome, DeletionReport};
    pub use crate::index::{FilterId, LayerId};
    pub use crate::info::{NodeInfo, ParsedAssembly};
    pub use crate::node::{LoadStatus, NodeKind, TreeNode};
    pub use crate::tree::{AssemblyTree, Parent};
    pub use crate::visibility::BranchVisibility;
    pub use glam::Mat4;
}
