//! Parsed structure records
//!
//! Parsers turn XML documents and binary assembly data into a
//! [`ParsedAssembly`]: inert records in document order, addressed by
//! authored id. Reification turns them into live tree entries.

use crate::node::{NodeFlags, NodeKind};
use cadstream_core::error::ParseError;
use cadstream_core::id::{AuthoredNodeId, ModelKey};
use cadstream_core::math::{BoundingBox, MatrixArray};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Raw authored attribute
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeInfo {
    pub name: String,
    pub value: String,
    /// Declared value type, inferred from the value when absent
    pub kind: Option<String>,
}

impl AttributeInfo {
    /// Create an untyped attribute
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            kind: None,
        }
    }
}

/// Reference to a model stored outside the parsed document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalModelInfo {
    /// Name handed to the model resolver
    pub name: String,
    /// Bounds in the placeholder's local space, when known up front
    pub bounds: Option<BoundingBox>,
}

/// One tree-node record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub authored_id: AuthoredNodeId,
    /// Parent record; `None` for roots of the document
    pub parent: Option<AuthoredNodeId>,
    pub kind: NodeKind,
    pub name: String,
    pub matrix: Option<MatrixArray>,
    pub visible: bool,
    pub flags: NodeFlags,
    pub layer: Option<String>,
    pub generic_type: Option<String>,
    pub generic_id: Option<String>,
    pub attributes: Vec<AttributeInfo>,
    pub part_definition: Option<AuthoredNodeId>,
    pub representation_item: Option<AuthoredNodeId>,
    /// Engine instance keys owned by a body
    pub instances: Vec<u32>,
    pub prototype: Option<u32>,
    pub external_model: Option<ExternalModelInfo>,
    pub bounds: Option<BoundingBox>,
}

impl NodeInfo {
    /// Create a visible record with no optional data
    pub fn new(authored_id: u32, parent: Option<u32>, kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            authored_id: AuthoredNodeId::new(authored_id),
            parent: parent.map(AuthoredNodeId::new),
            kind,
            name: name.into(),
            matrix: None,
            visible: true,
            flags: NodeFlags::default(),
            layer: None,
            generic_type: None,
            generic_id: None,
            attributes: Vec::new(),
            part_definition: None,
            representation_item: None,
            instances: Vec::new(),
            prototype: None,
            external_model: None,
            bounds: None,
        }
    }
}

/// Part definition record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartDefinitionInfo {
    pub authored_id: AuthoredNodeId,
    pub name: String,
    pub items: Vec<AuthoredNodeId>,
    pub bounds: Option<BoundingBox>,
}

/// Representation item record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepresentationItemInfo {
    pub authored_id: AuthoredNodeId,
    pub name: String,
    pub instances: Vec<u32>,
    pub bounds: Option<BoundingBox>,
}

/// Shared subtree; records with no parent are the prototype's roots
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrototypeInfo {
    pub id: u32,
    pub nodes: Vec<NodeInfo>,
}

/// Filter record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterInfo {
    pub name: String,
    pub inclusive: bool,
    pub nodes: Vec<AuthoredNodeId>,
}

/// BIM relationship record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipInfo {
    pub kind: String,
    pub from: AuthoredNodeId,
    pub to: AuthoredNodeId,
}

/// Everything parsed from one structure document
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedAssembly {
    /// Model key the instance keys were recorded against
    pub source_model_key: Option<ModelKey>,
    /// Number of runtime ids the document needs (max authored id + 1)
    pub id_span: u32,
    pub nodes: Vec<NodeInfo>,
    pub part_definitions: Vec<PartDefinitionInfo>,
    pub representation_items: Vec<RepresentationItemInfo>,
    pub prototypes: Vec<PrototypeInfo>,
    pub filters: Vec<FilterInfo>,
    pub relationships: Vec<RelationshipInfo>,
}

impl ParsedAssembly {
    /// Smallest span covering every authored id
    pub fn required_span(&self) -> u32 {
        let node_ids = self
            .nodes
            .iter()
            .chain(self.prototypes.iter().flat_map(|p| p.nodes.iter()))
            .map(|n| n.authored_id.raw());
        let part_ids = self.part_definitions.iter().map(|p| p.authored_id.raw());
        let item_ids = self.representation_items.iter().map(|i| i.authored_id.raw());

        node_ids
            .chain(part_ids)
            .chain(item_ids)
            .max()
            .map_or(0, |max| max.saturating_add(1))
    }

    /// Check structural consistency
    ///
    /// Authored ids must be unique, every parent must appear earlier in
    /// document order, and the id span must cover every id.
    pub fn validate(&self) -> Result<(), ParseError> {
        let mut seen = HashSet::new();
        for id in self
            .part_definitions
            .iter()
            .map(|p| p.authored_id)
            .chain(self.representation_items.iter().map(|i| i.authored_id))
        {
            if !seen.insert(id) {
                return Err(ParseError::DuplicateAuthoredId(id.raw()));
            }
        }

        validate_records(&self.nodes, &mut seen)?;
        for prototype in &self.prototypes {
            validate_records(&prototype.nodes, &mut seen)?;
        }

        let required = self.required_span();
        if self.id_span < required {
            return Err(ParseError::Decode(format!(
                "id span {} does not cover authored id {}",
                self.id_span,
                required - 1
            )));
        }
        Ok(())
    }

    /// Records referencing external models, in document order
    pub fn external_models(&self) -> impl Iterator<Item = (&NodeInfo, &ExternalModelInfo)> {
        self.nodes
            .iter()
            .filter_map(|n| n.external_model.as_ref().map(|e| (n, e)))
    }

    /// Look up a prototype
    pub fn prototype(&self, id: u32) -> Option<&PrototypeInfo> {
        self.prototypes.iter().find(|p| p.id == id)
    }

    /// Look up a part definition
    pub fn part_definition(&self, id: AuthoredNodeId) -> Option<&PartDefinitionInfo> {
        self.part_definitions.iter().find(|p| p.authored_id == id)
    }

    /// Look up a representation item
    pub fn representation_item(&self, id: AuthoredNodeId) -> Option<&RepresentationItemInfo> {
        self.representation_items.iter().find(|i| i.authored_id == id)
    }
}

fn validate_records(records: &[NodeInfo], seen: &mut HashSet<AuthoredNodeId>) -> Result<(), ParseError> {
    let mut local = HashSet::new();
    for record in records {
        if let Some(parent) = record.parent {
            if !local.contains(&parent) {
                return Err(ParseError::OrphanRecord {
                    child: record.authored_id.raw(),
                    parent: parent.raw(),
                });
            }
        }
        if !seen.insert(record.authored_id) {
            return Err(ParseError::DuplicateAuthoredId(record.authored_id.raw()));
        }
        local.insert(record.authored_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembly(nodes: Vec<NodeInfo>) -> ParsedAssembly {
        let mut parsed = ParsedAssembly {
            nodes,
            ..Default::default()
        };
        parsed.id_span = parsed.required_span();
        parsed
    }

    #[test]
    fn test_valid_document_order() {
        let parsed = assembly(vec![
            NodeInfo::new(0, None, NodeKind::ProductOccurrence, "root"),
            NodeInfo::new(4, Some(0), NodeKind::Mesh, "body"),
        ]);
        assert_eq!(parsed.id_span, 5);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_orphan_rejected() {
        let parsed = assembly(vec![
            NodeInfo::new(1, Some(0), NodeKind::Mesh, "body"),
            NodeInfo::new(0, None, NodeKind::ProductOccurrence, "root"),
        ]);
        assert_eq!(parsed.validate(), Err(ParseError::OrphanRecord { child: 1, parent: 0 }));
    }

    #[test]
    fn test_duplicate_rejected() {
        let parsed = assembly(vec![
            NodeInfo::new(0, None, NodeKind::ProductOccurrence, "a"),
            NodeInfo::new(0, None, NodeKind::ProductOccurrence, "b"),
        ]);
        assert_eq!(parsed.validate(), Err(ParseError::DuplicateAuthoredId(0)));
    }

    #[test]
    fn test_short_span_rejected() {
        let mut parsed = assembly(vec![NodeInfo::new(9, None, NodeKind::ProductOccurrence, "a")]);
        parsed.id_span = 3;
        assert!(matches!(parsed.validate(), Err(ParseError::Decode(_))));
    }
}
