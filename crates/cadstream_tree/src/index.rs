//! Cross-cutting node indices
//!
//! Every index keeps its forward and reverse maps consistent within the same
//! call; empty buckets are pruned so a full add → remove cycle leaves the
//! index exactly as it started.

use cadstream_core::id::RuntimeNodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Layer identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerId(pub u32);

/// Filter identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FilterId(pub u32);

/// A named node filter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    /// Inclusive filters show their nodes, exclusive filters hide them
    pub inclusive: bool,
    pub nodes: BTreeSet<RuntimeNodeId>,
}

/// Layers, filters, generic types, generic ids, CAD views and configurations
#[derive(Debug, Default)]
pub struct TreeIndices {
    layer_names: BTreeMap<LayerId, String>,
    layer_members: HashMap<LayerId, BTreeSet<RuntimeNodeId>>,
    node_layer: HashMap<RuntimeNodeId, LayerId>,
    next_layer: u32,

    filters: BTreeMap<FilterId, Filter>,
    node_filters: HashMap<RuntimeNodeId, BTreeSet<FilterId>>,
    next_filter: u32,

    type_members: HashMap<String, BTreeSet<RuntimeNodeId>>,
    node_type: HashMap<RuntimeNodeId, String>,

    generic_ids: HashMap<String, RuntimeNodeId>,
    node_generic_id: HashMap<RuntimeNodeId, String>,

    cad_views: BTreeSet<RuntimeNodeId>,
    default_cad_view: Option<RuntimeNodeId>,
    configurations: BTreeSet<RuntimeNodeId>,
    active_configuration: Option<RuntimeNodeId>,
    active_is_default: bool,
}

impl TreeIndices {
    /// Create empty indices
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Layers
    // ========================================================================

    /// Get or create a layer by name
    pub fn register_layer(&mut self, name: &str) -> LayerId {
        if let Some(id) = self.layer_by_name(name) {
            return id;
        }
        let id = LayerId(self.next_layer);
        self.next_layer += 1;
        self.layer_names.insert(id, name.to_string());
        id
    }

    /// Find a layer by name
    pub fn layer_by_name(&self, name: &str) -> Option<LayerId> {
        self.layer_names
            .iter()
            .find_map(|(id, n)| (n == name).then_some(*id))
    }

    /// Layer name
    pub fn layer_name(&self, layer: LayerId) -> Option<&str> {
        self.layer_names.get(&layer).map(String::as_str)
    }

    /// All layers
    pub fn layers(&self) -> Vec<LayerId> {
        self.layer_names.keys().copied().collect()
    }

    /// Put a node on a layer, moving it off any previous layer
    pub fn register_node_in_layer(&mut self, node: RuntimeNodeId, layer: LayerId) -> bool {
        if !self.layer_names.contains_key(&layer) {
            return false;
        }
        self.unregister_node_from_layer(node);
        self.node_layer.insert(node, layer);
        self.layer_members.entry(layer).or_default().insert(node);
        true
    }

    /// Take a node off its layer
    pub fn unregister_node_from_layer(&mut self, node: RuntimeNodeId) -> Option<LayerId> {
        let layer = self.node_layer.remove(&node)?;
        remove_from_bucket(&mut self.layer_members, &layer, &node);
        Some(layer)
    }

    /// Nodes on a layer
    pub fn get_nodes_from_layer(&self, layer: LayerId) -> Vec<RuntimeNodeId> {
        self.layer_members
            .get(&layer)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Layer of a node
    pub fn get_layer_of_node(&self, node: RuntimeNodeId) -> Option<LayerId> {
        self.node_layer.get(&node).copied()
    }

    // ========================================================================
    // Filters
    // ========================================================================

    /// Create a filter over a node set
    pub fn add_filter(
        &mut self,
        name: impl Into<String>,
        inclusive: bool,
        nodes: impl IntoIterator<Item = RuntimeNodeId>,
    ) -> FilterId {
        let id = FilterId(self.next_filter);
        self.next_filter += 1;

        let nodes: BTreeSet<_> = nodes.into_iter().collect();
        for node in &nodes {
            self.node_filters.entry(*node).or_default().insert(id);
        }
        self.filters.insert(
            id,
            Filter {
                name: name.into(),
                inclusive,
                nodes,
            },
        );
        id
    }

    /// Remove a filter
    pub fn remove_filter(&mut self, id: FilterId) -> Option<Filter> {
        let filter = self.filters.remove(&id)?;
        for node in &filter.nodes {
            remove_from_bucket(&mut self.node_filters, node, &id);
        }
        Some(filter)
    }

    /// Filter by id
    pub fn filter(&self, id: FilterId) -> Option<&Filter> {
        self.filters.get(&id)
    }

    /// All filters
    pub fn filters(&self) -> Vec<FilterId> {
        self.filters.keys().copied().collect()
    }

    /// Filters containing a node
    pub fn get_filters_with_node(&self, node: RuntimeNodeId) -> Vec<FilterId> {
        self.node_filters
            .get(&node)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Nodes of a filter
    pub fn get_nodes_from_filter(&self, id: FilterId) -> Vec<RuntimeNodeId> {
        self.filters
            .get(&id)
            .map(|f| f.nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Generic types and ids
    // ========================================================================

    /// Tag a node with a generic type, replacing any previous type
    pub fn register_generic_type(&mut self, node: RuntimeNodeId, generic_type: &str) {
        self.unregister_generic_type(node);
        self.node_type.insert(node, generic_type.to_string());
        self.type_members
            .entry(generic_type.to_string())
            .or_default()
            .insert(node);
    }

    /// Remove a node's generic type
    pub fn unregister_generic_type(&mut self, node: RuntimeNodeId) -> Option<String> {
        let generic_type = self.node_type.remove(&node)?;
        remove_from_bucket(&mut self.type_members, &generic_type, &node);
        Some(generic_type)
    }

    /// Nodes of a generic type
    pub fn get_nodes_by_generic_type(&self, generic_type: &str) -> Vec<RuntimeNodeId> {
        self.type_members
            .get(generic_type)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Generic type of a node
    pub fn generic_type_of(&self, node: RuntimeNodeId) -> Option<&str> {
        self.node_type.get(&node).map(String::as_str)
    }

    /// Tag a node with a generic id; fails if the id names another live node
    pub fn register_generic_id(&mut self, node: RuntimeNodeId, generic_id: &str) -> bool {
        match self.generic_ids.get(generic_id) {
            Some(existing) if *existing != node => return false,
            _ => {}
        }
        self.unregister_generic_id(node);
        self.generic_ids.insert(generic_id.to_string(), node);
        self.node_generic_id.insert(node, generic_id.to_string());
        true
    }

    /// Remove a node's generic id
    pub fn unregister_generic_id(&mut self, node: RuntimeNodeId) -> Option<String> {
        let generic_id = self.node_generic_id.remove(&node)?;
        self.generic_ids.remove(&generic_id);
        Some(generic_id)
    }

    /// Node with a generic id
    pub fn lookup_by_generic_id(&self, generic_id: &str) -> Option<RuntimeNodeId> {
        self.generic_ids.get(generic_id).copied()
    }

    /// Generic id of a node
    pub fn generic_id_of(&self, node: RuntimeNodeId) -> Option<&str> {
        self.node_generic_id.get(&node).map(String::as_str)
    }

    // ========================================================================
    // CAD views and configurations
    // ========================================================================

    pub fn register_cad_view(&mut self, node: RuntimeNodeId, is_default: bool) {
        self.cad_views.insert(node);
        if is_default && self.default_cad_view.is_none() {
            self.default_cad_view = Some(node);
        }
    }

    pub fn cad_views(&self) -> Vec<RuntimeNodeId> {
        self.cad_views.iter().copied().collect()
    }

    pub fn default_cad_view(&self) -> Option<RuntimeNodeId> {
        self.default_cad_view
    }

    /// Register a configuration; the first default (or first ever) becomes active
    pub fn register_cad_configuration(&mut self, node: RuntimeNodeId, is_default: bool) {
        self.configurations.insert(node);
        if self.active_configuration.is_none() || is_default && !self.active_is_default {
            self.active_configuration = Some(node);
            self.active_is_default = is_default;
        }
    }

    pub fn cad_configurations(&self) -> Vec<RuntimeNodeId> {
        self.configurations.iter().copied().collect()
    }

    pub fn active_cad_configuration(&self) -> Option<RuntimeNodeId> {
        self.active_configuration
    }

    /// Activate a registered configuration
    pub fn activate_cad_configuration(&mut self, node: RuntimeNodeId) -> bool {
        if !self.configurations.contains(&node) {
            return false;
        }
        self.active_configuration = Some(node);
        true
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Drop a node from every index
    pub fn forget_node(&mut self, node: RuntimeNodeId) {
        self.unregister_node_from_layer(node);
        self.unregister_generic_type(node);
        self.unregister_generic_id(node);

        if let Some(filter_ids) = self.node_filters.remove(&node) {
            for id in filter_ids {
                if let Some(filter) = self.filters.get_mut(&id) {
                    filter.nodes.remove(&node);
                }
            }
        }

        self.cad_views.remove(&node);
        if self.default_cad_view == Some(node) {
            self.default_cad_view = None;
        }
        self.configurations.remove(&node);
        if self.active_configuration == Some(node) {
            self.active_configuration = self.configurations.iter().next().copied();
            self.active_is_default = false;
        }
    }

    /// Check if every node-keyed index is empty
    pub fn is_empty(&self) -> bool {
        self.layer_members.is_empty()
            && self.node_layer.is_empty()
            && self.node_filters.is_empty()
            && self.type_members.is_empty()
            && self.node_type.is_empty()
            && self.generic_ids.is_empty()
            && self.node_generic_id.is_empty()
            && self.cad_views.is_empty()
            && self.configurations.is_empty()
    }
}

fn remove_from_bucket<K, V>(buckets: &mut HashMap<K, BTreeSet<V>>, key: &K, value: &V)
where
    K: std::hash::Hash + Eq,
    V: Ord,
{
    if let Some(bucket) = buckets.get_mut(key) {
        bucket.remove(value);
        if bucket.is_empty() {
            buckets.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: i32) -> RuntimeNodeId {
        RuntimeNodeId::from_raw(raw)
    }

    #[test]
    fn test_layer_round_trip() {
        let mut index = TreeIndices::new();
        let walls = index.register_layer("walls");
        assert_eq!(index.register_layer("walls"), walls);

        assert!(index.register_node_in_layer(id(1), walls));
        assert!(index.register_node_in_layer(id(2), walls));
        assert_eq!(index.get_nodes_from_layer(walls), vec![id(1), id(2)]);
        assert_eq!(index.get_layer_of_node(id(1)), Some(walls));

        index.unregister_node_from_layer(id(1));
        index.unregister_node_from_layer(id(2));
        assert!(index.get_nodes_from_layer(walls).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_layer_move() {
        let mut index = TreeIndices::new();
        let a = index.register_layer("a");
        let b = index.register_layer("b");
        index.register_node_in_layer(id(1), a);
        index.register_node_in_layer(id(1), b);

        assert!(index.get_nodes_from_layer(a).is_empty());
        assert_eq!(index.get_nodes_from_layer(b), vec![id(1)]);
        assert!(!index.register_node_in_layer(id(1), LayerId(99)));
    }

    #[test]
    fn test_filter_round_trip() {
        let mut index = TreeIndices::new();
        let filter = index.add_filter("pipes", true, [id(3), id(4)]);

        assert_eq!(index.get_filters_with_node(id(3)), vec![filter]);
        assert_eq!(index.get_nodes_from_filter(filter), vec![id(3), id(4)]);

        let removed = index.remove_filter(filter).unwrap();
        assert_eq!(removed.name, "pipes");
        assert!(index.get_filters_with_node(id(3)).is_empty());
        assert!(index.get_nodes_from_filter(filter).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_generic_type_round_trip() {
        let mut index = TreeIndices::new();
        index.register_generic_type(id(1), "IfcWall");
        index.register_generic_type(id(2), "IfcWall");
        assert_eq!(index.get_nodes_by_generic_type("IfcWall"), vec![id(1), id(2)]);

        index.register_generic_type(id(2), "IfcDoor");
        assert_eq!(index.get_nodes_by_generic_type("IfcWall"), vec![id(1)]);

        index.unregister_generic_type(id(1));
        index.unregister_generic_type(id(2));
        assert!(index.is_empty());
    }

    #[test]
    fn test_generic_id_unique() {
        let mut index = TreeIndices::new();
        assert!(index.register_generic_id(id(1), "guid-a"));
        assert!(!index.register_generic_id(id(2), "guid-a"));
        assert_eq!(index.lookup_by_generic_id("guid-a"), Some(id(1)));

        index.forget_node(id(1));
        assert_eq!(index.lookup_by_generic_id("guid-a"), None);
        assert!(index.is_empty());
    }

    #[test]
    fn test_configuration_activation() {
        let mut index = TreeIndices::new();
        index.register_cad_configuration(id(5), false);
        index.register_cad_configuration(id(6), true);
        index.register_cad_configuration(id(7), false);
        assert_eq!(index.active_cad_configuration(), Some(id(6)));

        assert!(index.activate_cad_configuration(id(7)));
        assert!(!index.activate_cad_configuration(id(8)));

        index.forget_node(id(7));
        assert_eq!(index.active_cad_configuration(), Some(id(5)));
    }

    #[test]
    fn test_forget_node_clears_filters() {
        let mut index = TreeIndices::new();
        let filter = index.add_filter("f", false, [id(1), id(2)]);
        index.forget_node(id(1));
        assert_eq!(index.get_nodes_from_filter(filter), vec![id(2)]);
        assert!(index.get_filters_with_node(id(1)).is_empty());
    }
}
