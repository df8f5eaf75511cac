//! XML assembly documents
//!
//! A document is one `<ModelFile>` holding the product hierarchy and its
//! side tables:
//!
//! ```xml
//! <ModelFile ModelKey="1">
//!   <Layer Id="3" Name="Solids"/>
//!   <ProductOccurrence Id="0" Name="Engine">
//!     <Transformation>1 0 0 0 0 1 0 0 0 0 1 0 5 0 0 1</Transformation>
//!     <Attribute Name="Mass" Value="12.5" Type="float"/>
//!     <Body Id="1" Type="Mesh" Instances="4 5" Layer="3"/>
//!     <ProductOccurrence Id="2" Name="Bolt" ExternalModel="bolt">
//!       <Bounding Min="0 0 0" Max="1 1 1"/>
//!     </ProductOccurrence>
//!   </ProductOccurrence>
//!   <PartDefinition Id="10" Items="11"/>
//!   <RepresentationItem Id="11" Instances="6"/>
//!   <Prototype Id="1"> ... </Prototype>
//!   <Filter Name="Walls" Nodes="0 2"/>
//!   <Relationship Type="Aggregates" From="0" To="2"/>
//! </ModelFile>
//! ```
//!
//! Node elements nest to express parentage. Unknown elements are skipped
//! with their whole subtree.

use cadstream_core::error::ParseError;
use cadstream_core::id::{AuthoredNodeId, ModelKey};
use cadstream_core::math::{BoundingBox, MatrixArray};
use cadstream_tree::{
    AttributeInfo, ExternalModelInfo, FilterInfo, NodeInfo, NodeKind, ParsedAssembly,
    PartDefinitionInfo, PrototypeInfo, RelationshipInfo, RepresentationItemInfo,
};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

/// Parse an XML assembly document
pub fn parse_xml(text: &str) -> Result<ParsedAssembly, ParseError> {
    XmlParser::default().run(text)
}

// ============================================================================
// Attributes
// ============================================================================

struct Attrs {
    element: String,
    values: Vec<(String, String)>,
}

impl Attrs {
    fn read(e: &BytesStart<'_>) -> Result<Self, ParseError> {
        let element = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut values = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|err| ParseError::Xml(err.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|err| ParseError::Xml(err.to_string()))?
                .into_owned();
            values.push((key, value));
        }
        Ok(Self { element, values })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn string(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_string)
    }

    fn invalid(&self, name: &str, value: &str) -> ParseError {
        ParseError::InvalidAttribute {
            element: self.element.clone(),
            attribute: name.to_string(),
            value: value.to_string(),
        }
    }

    fn u32(&self, name: &str) -> Result<Option<u32>, ParseError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(name, value)),
        }
    }

    fn required_u32(&self, name: &str) -> Result<u32, ParseError> {
        self.u32(name)?.ok_or_else(|| ParseError::MissingAttribute {
            element: self.element.clone(),
            attribute: name.to_string(),
        })
    }

    fn bool(&self, name: &str, default: bool) -> Result<bool, ParseError> {
        match self.get(name) {
            None => Ok(default),
            Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(value) => Err(self.invalid(name, value)),
        }
    }

    fn u32_list(&self, name: &str) -> Result<Vec<u32>, ParseError> {
        let Some(value) = self.get(name) else {
            return Ok(Vec::new());
        };
        value
            .split_whitespace()
            .map(|part| part.parse().map_err(|_| self.invalid(name, value)))
            .collect()
    }

    fn vec3(&self, name: &str) -> Result<glam::Vec3, ParseError> {
        let value = self.get(name).ok_or_else(|| ParseError::MissingAttribute {
            element: self.element.clone(),
            attribute: name.to_string(),
        })?;
        let floats = parse_floats(value).ok_or_else(|| self.invalid(name, value))?;
        match floats.as_slice() {
            [x, y, z] => Ok(glam::Vec3::new(*x, *y, *z)),
            _ => Err(self.invalid(name, value)),
        }
    }
}

fn parse_floats(text: &str) -> Option<Vec<f32>> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse().ok())
        .collect()
}

// ============================================================================
// Parser
// ============================================================================

/// Location of a node record being filled in
#[derive(Clone, Copy)]
struct NodeSlot {
    prototype: Option<usize>,
    index: usize,
}

enum Frame {
    Document,
    Node(NodeSlot),
    Part(usize),
    Item(usize),
    Prototype(usize),
    Transformation(NodeSlot),
    Leaf,
    Skip,
}

#[derive(Default)]
struct XmlParser {
    out: ParsedAssembly,
    stack: Vec<Frame>,
    layers: HashMap<String, String>,
    seen_document: bool,
}

impl XmlParser {
    fn run(mut self, text: &str) -> Result<ParsedAssembly, ParseError> {
        let mut reader = Reader::from_str(text);
        reader.trim_text(true);

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let frame = self.open(&e)?;
                    self.stack.push(frame);
                }
                Ok(Event::Empty(e)) => {
                    self.open(&e)?;
                }
                Ok(Event::End(_)) => {
                    self.stack.pop();
                }
                Ok(Event::Text(t)) => {
                    let text = t.unescape().map_err(|e| ParseError::Xml(e.to_string()))?;
                    self.text(&text)?;
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(ParseError::Xml(format!(
                        "at byte {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
            }
        }
        self.finish()
    }

    fn open(&mut self, e: &BytesStart<'_>) -> Result<Frame, ParseError> {
        if matches!(self.stack.last(), Some(Frame::Skip)) {
            return Ok(Frame::Skip);
        }
        let attrs = Attrs::read(e)?;

        if attrs.element == "ModelFile" {
            if self.seen_document {
                return Err(ParseError::UnexpectedElement(attrs.element));
            }
            self.seen_document = true;
            self.out.source_model_key = attrs.u32("ModelKey")?.map(ModelKey);
            return Ok(Frame::Document);
        }
        if self.stack.is_empty() {
            return Err(ParseError::UnexpectedElement(attrs.element));
        }

        match attrs.element.as_str() {
            "ProductOccurrence" | "CadView" | "PmiGroup" | "Configuration" | "Body" => {
                self.open_node(&attrs)
            }
            "Transformation" => match self.stack.last() {
                Some(Frame::Node(slot)) => Ok(Frame::Transformation(*slot)),
                _ => Err(ParseError::UnexpectedElement(attrs.element)),
            },
            "Attribute" => {
                let Some(Frame::Node(slot)) = self.stack.last() else {
                    return Err(ParseError::UnexpectedElement(attrs.element));
                };
                let slot = *slot;
                let name = attrs.string("Name").ok_or_else(|| ParseError::MissingAttribute {
                    element: attrs.element.clone(),
                    attribute: "Name".to_string(),
                })?;
                let attribute = AttributeInfo {
                    name,
                    value: attrs.string("Value").unwrap_or_default(),
                    kind: attrs.string("Type").map(|t| t.to_ascii_lowercase()),
                };
                self.node_mut(slot).attributes.push(attribute);
                Ok(Frame::Leaf)
            }
            "Bounding" => {
                let bounds = BoundingBox::new(attrs.vec3("Min")?, attrs.vec3("Max")?);
                match self.stack.last() {
                    Some(Frame::Node(slot)) => {
                        let slot = *slot;
                        self.node_mut(slot).bounds = Some(bounds);
                    }
                    Some(Frame::Part(index)) => self.out.part_definitions[*index].bounds = Some(bounds),
                    Some(Frame::Item(index)) => {
                        self.out.representation_items[*index].bounds = Some(bounds)
                    }
                    _ => return Err(ParseError::UnexpectedElement(attrs.element)),
                }
                Ok(Frame::Leaf)
            }
            "PartDefinition" => {
                self.require_document_level(&attrs)?;
                self.out.part_definitions.push(PartDefinitionInfo {
                    authored_id: AuthoredNodeId::new(attrs.required_u32("Id")?),
                    name: attrs.string("Name").unwrap_or_default(),
                    items: attrs
                        .u32_list("Items")?
                        .into_iter()
                        .map(AuthoredNodeId::new)
                        .collect(),
                    bounds: None,
                });
                Ok(Frame::Part(self.out.part_definitions.len() - 1))
            }
            "RepresentationItem" => {
                self.require_document_level(&attrs)?;
                self.out.representation_items.push(RepresentationItemInfo {
                    authored_id: AuthoredNodeId::new(attrs.required_u32("Id")?),
                    name: attrs.string("Name").unwrap_or_default(),
                    instances: attrs.u32_list("Instances")?,
                    bounds: None,
                });
                Ok(Frame::Item(self.out.representation_items.len() - 1))
            }
            "Prototype" => {
                self.require_document_level(&attrs)?;
                self.out.prototypes.push(PrototypeInfo {
                    id: attrs.required_u32("Id")?,
                    nodes: Vec::new(),
                });
                Ok(Frame::Prototype(self.out.prototypes.len() - 1))
            }
            "Layer" => {
                self.require_document_level(&attrs)?;
                let id = attrs.required_u32("Id")?;
                let name = attrs.string("Name").unwrap_or_else(|| id.to_string());
                self.layers.insert(id.to_string(), name);
                Ok(Frame::Leaf)
            }
            "Filter" => {
                self.require_document_level(&attrs)?;
                self.out.filters.push(FilterInfo {
                    name: attrs.string("Name").unwrap_or_default(),
                    inclusive: attrs.bool("Inclusive", true)?,
                    nodes: attrs
                        .u32_list("Nodes")?
                        .into_iter()
                        .map(AuthoredNodeId::new)
                        .collect(),
                });
                Ok(Frame::Leaf)
            }
            "Relationship" => {
                self.require_document_level(&attrs)?;
                self.out.relationships.push(RelationshipInfo {
                    kind: attrs.string("Type").unwrap_or_default(),
                    from: AuthoredNodeId::new(attrs.required_u32("From")?),
                    to: AuthoredNodeId::new(attrs.required_u32("To")?),
                });
                Ok(Frame::Leaf)
            }
            other => {
                log::debug!("XmlParser: skipping <{}>", other);
                Ok(Frame::Skip)
            }
        }
    }

    fn open_node(&mut self, attrs: &Attrs) -> Result<Frame, ParseError> {
        let (parent, prototype) = match self.stack.last() {
            Some(Frame::Document) => (None, None),
            Some(Frame::Prototype(index)) => (None, Some(*index)),
            Some(Frame::Node(slot)) => {
                let parent = self.node(*slot);
                if !parent.kind.is_container() {
                    return Err(ParseError::UnexpectedElement(attrs.element.clone()));
                }
                (Some(parent.authored_id.raw()), slot.prototype)
            }
            _ => return Err(ParseError::UnexpectedElement(attrs.element.clone())),
        };

        let kind = match attrs.element.as_str() {
            "ProductOccurrence" => NodeKind::ProductOccurrence,
            "CadView" => NodeKind::CadView,
            "PmiGroup" => NodeKind::PmiGroup,
            "Configuration" => NodeKind::Configuration,
            _ => match attrs.get("Type").unwrap_or("Mesh") {
                "Mesh" => NodeKind::Mesh,
                "Pmi" => NodeKind::Pmi,
                "ViewFrame" => NodeKind::ViewFrame,
                other => return Err(attrs.invalid("Type", other)),
            },
        };

        let id = attrs.required_u32("Id")?;
        let mut record = NodeInfo::new(id, parent, kind, attrs.string("Name").unwrap_or_default());
        record.visible = attrs.bool("Visible", true)?;
        record.layer = attrs.string("Layer");
        record.generic_type = attrs.string("GenericType");
        record.generic_id = attrs.string("GenericId");
        record.part_definition = attrs.u32("PartDefinition")?.map(AuthoredNodeId::new);
        record.representation_item = attrs.u32("RepresentationItem")?.map(AuthoredNodeId::new);
        record.instances = attrs.u32_list("Instances")?;
        record.prototype = attrs.u32("Prototype")?;
        record.external_model = attrs.string("ExternalModel").map(|name| ExternalModelInfo {
            name,
            bounds: None,
        });
        record.flags.out_of_hierarchy = attrs.bool("OutOfHierarchy", false)?;
        match kind {
            NodeKind::CadView => {
                record.flags.default_view = attrs.bool("Default", false)?;
                record.flags.annotation_view = attrs.bool("Annotation", false)?;
            }
            NodeKind::Configuration => {
                record.flags.default_configuration = attrs.bool("Default", false)?;
            }
            _ => {}
        }

        let nodes = match prototype {
            Some(index) => &mut self.out.prototypes[index].nodes,
            None => &mut self.out.nodes,
        };
        nodes.push(record);
        Ok(Frame::Node(NodeSlot {
            prototype,
            index: nodes.len() - 1,
        }))
    }

    fn text(&mut self, text: &str) -> Result<(), ParseError> {
        let Some(Frame::Transformation(slot)) = self.stack.last() else {
            return Ok(());
        };
        let slot = *slot;
        let matrix: MatrixArray = parse_floats(text)
            .and_then(|floats| floats.try_into().ok())
            .ok_or_else(|| ParseError::InvalidAttribute {
                element: "Transformation".to_string(),
                attribute: "#text".to_string(),
                value: text.to_string(),
            })?;
        self.node_mut(slot).matrix = Some(matrix);
        Ok(())
    }

    fn require_document_level(&self, attrs: &Attrs) -> Result<(), ParseError> {
        match self.stack.last() {
            Some(Frame::Document) => Ok(()),
            _ => Err(ParseError::UnexpectedElement(attrs.element.clone())),
        }
    }

    fn node(&self, slot: NodeSlot) -> &NodeInfo {
        match slot.prototype {
            Some(p) => &self.out.prototypes[p].nodes[slot.index],
            None => &self.out.nodes[slot.index],
        }
    }

    fn node_mut(&mut self, slot: NodeSlot) -> &mut NodeInfo {
        match slot.prototype {
            Some(p) => &mut self.out.prototypes[p].nodes[slot.index],
            None => &mut self.out.nodes[slot.index],
        }
    }

    fn finish(mut self) -> Result<ParsedAssembly, ParseError> {
        if !self.seen_document {
            return Err(ParseError::Xml("missing <ModelFile>".to_string()));
        }
        if !self.stack.is_empty() {
            return Err(ParseError::Xml("unterminated document".to_string()));
        }

        let layers = std::mem::take(&mut self.layers);
        let records = self
            .out
            .nodes
            .iter_mut()
            .chain(self.out.prototypes.iter_mut().flat_map(|p| p.nodes.iter_mut()));
        for record in records {
            if let Some(name) = record.layer.as_ref().and_then(|l| layers.get(l)) {
                record.layer = Some(name.clone());
            }
        }

        self.out.id_span = self.out.required_span();
        self.out.validate()?;
        log::debug!(
            "XmlParser: parsed {} node record(s), {} prototype(s)",
            self.out.nodes.len(),
            self.out.prototypes.len()
        );
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
        <ModelFile ModelKey="7">
          <Layer Id="3" Name="Solids"/>
          <ProductOccurrence Id="0" Name="Engine">
            <Transformation>1 0 0 0 0 1 0 0 0 0 1 0 5 0 0 1</Transformation>
            <Attribute Name="Mass" Value="12.5" Type="Float"/>
            <Body Id="1" Type="Mesh" Instances="4 5" Layer="3"/>
            <ProductOccurrence Id="2" Name="Bolt" ExternalModel="bolt">
              <Bounding Min="0 0 0" Max="1 1 1"/>
            </ProductOccurrence>
            <ProductOccurrence Id="6" Prototype="1" PartDefinition="10"/>
          </ProductOccurrence>
          <CadView Id="8" Name="Front" Default="true"/>
          <PartDefinition Id="10" Items="11"/>
          <RepresentationItem Id="11" Instances="9"/>
          <Prototype Id="1">
            <ProductOccurrence Id="20" Name="Shared">
              <Body Id="21" Instances="12"/>
            </ProductOccurrence>
          </Prototype>
          <Filter Name="Bolts" Nodes="2"/>
          <Relationship Type="Aggregates" From="0" To="2"/>
          <Unknown><ProductOccurrence Id="99"/></Unknown>
        </ModelFile>
    "#;

    #[test]
    fn test_parse_document() {
        let parsed = parse_xml(DOCUMENT).unwrap();
        assert_eq!(parsed.source_model_key, Some(ModelKey(7)));
        assert_eq!(parsed.nodes.len(), 5);
        assert_eq!(parsed.id_span, 22);

        let engine = &parsed.nodes[0];
        assert_eq!(engine.name, "Engine");
        assert_eq!(engine.matrix.unwrap()[12], 5.0);
        assert_eq!(engine.attributes[0].kind.as_deref(), Some("float"));

        let body = &parsed.nodes[1];
        assert_eq!(body.kind, NodeKind::Mesh);
        assert_eq!(body.parent, Some(AuthoredNodeId::new(0)));
        assert_eq!(body.instances, vec![4, 5]);
        assert_eq!(body.layer.as_deref(), Some("Solids"));

        let bolt = &parsed.nodes[2];
        assert_eq!(bolt.external_model.as_ref().unwrap().name, "bolt");
        assert!(bolt.bounds.is_some());

        assert!(parsed.nodes[4].flags.default_view);
        assert_eq!(parsed.prototypes[0].nodes.len(), 2);
        assert_eq!(parsed.prototypes[0].nodes[1].parent, Some(AuthoredNodeId::new(20)));
        assert_eq!(parsed.part_definitions[0].items, vec![AuthoredNodeId::new(11)]);
        assert_eq!(parsed.filters[0].nodes, vec![AuthoredNodeId::new(2)]);
        assert_eq!(parsed.relationships.len(), 1);
    }

    #[test]
    fn test_body_cannot_hold_children() {
        let xml = r#"<ModelFile><Body Id="0"><Body Id="1"/></Body></ModelFile>"#;
        assert!(matches!(parse_xml(xml), Err(ParseError::UnexpectedElement(_))));
    }

    #[test]
    fn test_missing_id() {
        let xml = r#"<ModelFile><ProductOccurrence Name="x"/></ModelFile>"#;
        assert!(matches!(
            parse_xml(xml),
            Err(ParseError::MissingAttribute { .. })
        ));
    }

    #[test]
    fn test_malformed_xml() {
        assert!(matches!(
            parse_xml("<ModelFile><ProductOccurrence Id=\"0\"></ModelFile>"),
            Err(ParseError::Xml(_))
        ));
        assert!(matches!(parse_xml(""), Err(ParseError::Xml(_))));
    }

    #[test]
    fn test_bad_transformation() {
        let xml = r#"<ModelFile><ProductOccurrence Id="0"><Transformation>1 2 3</Transformation></ProductOccurrence></ModelFile>"#;
        assert!(matches!(
            parse_xml(xml),
            Err(ParseError::InvalidAttribute { .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let xml = r#"<ModelFile><ProductOccurrence Id="0"/><ProductOccurrence Id="0"/></ModelFile>"#;
        assert_eq!(parse_xml(xml), Err(ParseError::DuplicateAuthoredId(0)));
    }
}
