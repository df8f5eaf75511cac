//! Reference nodes
//!
//! Part definitions and representation items live outside the visible tree.
//! Occurrences and bodies reference them; each keeps an explicit referrer
//! list and is released by the tree once that list empties.

use cadstream_core::id::{InstanceHandle, RuntimeNodeId};
use cadstream_core::math::BoundingBox;
use serde::{Deserialize, Serialize};

/// Kind of reference node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    /// Definition shared by every occurrence of one authored part
    PartDefinition,
    /// One geometric body of a part definition
    RepresentationItem,
}

/// Shared, referrer-counted node outside the tree
#[derive(Clone, Debug)]
pub struct ReferenceNode {
    id: RuntimeNodeId,
    kind: ReferenceKind,
    name: String,
    bounds: Option<BoundingBox>,
    instances: Vec<InstanceHandle>,
    items: Vec<RuntimeNodeId>,
    referrers: Vec<RuntimeNodeId>,
}

impl ReferenceNode {
    /// Create a part definition
    pub fn part_definition(id: RuntimeNodeId, name: impl Into<String>, items: Vec<RuntimeNodeId>) -> Self {
        Self {
            id,
            kind: ReferenceKind::PartDefinition,
            name: name.into(),
            bounds: None,
            instances: Vec::new(),
            items,
            referrers: Vec::new(),
        }
    }

    /// Create a representation item
    pub fn representation_item(
        id: RuntimeNodeId,
        name: impl Into<String>,
        instances: Vec<InstanceHandle>,
    ) -> Self {
        Self {
            id,
            kind: ReferenceKind::RepresentationItem,
            name: name.into(),
            bounds: None,
            instances,
            items: Vec::new(),
            referrers: Vec::new(),
        }
    }

    /// Builder: set bounds
    pub fn with_bounds(mut self, bounds: Option<BoundingBox>) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn id(&self) -> RuntimeNodeId {
        self.id
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bounds(&self) -> Option<BoundingBox> {
        self.bounds
    }

    /// Engine instances of a representation item
    pub fn instances(&self) -> &[InstanceHandle] {
        &self.instances
    }

    /// Representation items of a part definition
    pub fn items(&self) -> &[RuntimeNodeId] {
        &self.items
    }

    /// Nodes currently referencing this one
    pub fn referrers(&self) -> &[RuntimeNodeId] {
        &self.referrers
    }

    /// Add a referrer; duplicates are ignored
    pub(crate) fn add_referrer(&mut self, referrer: RuntimeNodeId) {
        if !self.referrers.contains(&referrer) {
            self.referrers.push(referrer);
        }
    }

    /// Remove a referrer; returns true if none remain
    pub(crate) fn remove_referrer(&mut self, referrer: RuntimeNodeId) -> bool {
        self.referrers.retain(|r| *r != referrer);
        self.referrers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referrer_list() {
        let mut part = ReferenceNode::part_definition(RuntimeNodeId::from_raw(10), "bolt", vec![]);
        let a = RuntimeNodeId::from_raw(1);
        let b = RuntimeNodeId::from_raw(2);

        part.add_referrer(a);
        part.add_referrer(a);
        part.add_referrer(b);
        assert_eq!(part.referrers(), &[a, b]);

        assert!(!part.remove_referrer(a));
        assert!(part.remove_referrer(b));
    }
}
