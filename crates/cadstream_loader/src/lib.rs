//! # cadstream_loader - Assembly Streaming and Attachment
//!
//! Everything between structure bytes and a populated tree:
//! - XML and binary assembly structure parsers
//! - Attachment priorities from projected screen size, with a stream cutoff
//! - ScAttacher: bounded, prioritized engine attaches
//! - TreeLoader: cancellable loads of XML, SCS buffers and streamed models
//! - ModelStructure: the session facade over tree, engine and loader
//!
//! ## Example
//!
//! ```ignore
//! use cadstream_loader::prelude::*;
//!
//! let engine = MemoryEngine::new().shared();
//! let model = ModelStructure::new(engine, StreamingConfig::default())?;
//! let outcome = model.loader().load_by_xml_doc(xml, None).await?;
//! model.set_node_visibility(&outcome.roots, false).await?;
//! ```

pub mod assembly;
pub mod attacher;
pub mod loader;
pub mod model;
pub mod priority;
pub mod xml;

pub use assembly::{decode_assembly_data, encode_assembly_data, encode_segment, AssemblyDataHeader};
pub use attacher::{AttachInfo, AttachRequest, AttachTicket, ScAttacher, SegmentStream, StreamCutoffAttachQueue};
pub use loader::{
    DirectoryModelResolver, LoadOutcome, LoadPhase, ModelResolver, NamedModelResolver, PendingAttachment,
    TreeLoader,
};
pub use model::ModelStructure;
pub use priority::{AttachPriority, AttachPriorityManager};
pub use xml::parse_xml;

/// Prelude - commonly used types
pub mod prelude {
    pub use crate::attacher::{AttachRequest, ScAttacher};
    pub use crate::loader::{LoadOutcome, ModelResolver, TreeLoader};
    pub use crate::model::ModelStructure;
    pub use cadstream_core::prelude::*;
    pub use cadstream_tree::prelude::*;
}
