//! Node identifier schemes and engine keys
//!
//! Three distinct id spaces address assembly nodes:
//! - [`AuthoredNodeId`]: assigned by the content author, unique within one model
//! - [`DynamicNodeId`]: generated at runtime for programmatically created nodes
//! - [`RuntimeNodeId`]: the session-wide address of a live node
//!
//! Authored ids are lifted into the runtime space through a per-inclusion
//! [`NodeIdOffset`]; dynamic ids are folded into the negative range. All
//! conversions are explicit named functions.

use core::fmt;
use serde::{Deserialize, Serialize};

// ============================================================================
// Node identifiers
// ============================================================================

/// Identifier assigned by the content author
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AuthoredNodeId(u32);

impl AuthoredNodeId {
    /// Create a new authored id
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for AuthoredNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthoredNodeId({})", self.0)
    }
}

impl fmt::Display for AuthoredNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier generated for nodes created at runtime
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DynamicNodeId(u32);

impl DynamicNodeId {
    /// First id handed out by a generator
    pub const FIRST: Self = Self(1);

    /// Create a new dynamic id
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for DynamicNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DynamicNodeId({})", self.0)
    }
}

/// Additive constant mapping authored ids of one inclusion into the runtime space
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIdOffset(i32);

impl NodeIdOffset {
    /// Offset of zero
    pub const ZERO: Self = Self(0);

    /// Create a new offset
    #[inline]
    pub const fn new(offset: i32) -> Self {
        Self(offset)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(&self) -> i32 {
        self.0
    }
}

impl fmt::Debug for NodeIdOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdOffset({})", self.0)
    }
}

/// Session-wide node address
///
/// Non-negative values are authored-derived, values below `-1` are dynamic and
/// `-1` is reserved as [`RuntimeNodeId::INVALID`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeNodeId(i32);

impl RuntimeNodeId {
    /// Reserved invalid id
    pub const INVALID: Self = Self(-1);

    /// Lift an authored id through an inclusion offset
    ///
    /// Returns `None` if the result would leave the authored range.
    #[inline]
    pub fn from_authored(authored: AuthoredNodeId, offset: NodeIdOffset) -> Option<Self> {
        let raw = i32::try_from(authored.0).ok()?.checked_add(offset.0)?;
        (raw >= 0).then_some(Self(raw))
    }

    /// Fold a dynamic id into the negative range
    #[inline]
    pub fn from_dynamic(dynamic: DynamicNodeId) -> Option<Self> {
        let raw = i32::try_from(dynamic.0).ok()?;
        raw.checked_add(1)?.checked_neg().map(Self)
    }

    /// Recover the authored id given the owning inclusion's offset
    #[inline]
    pub fn to_authored(&self, offset: NodeIdOffset) -> Option<AuthoredNodeId> {
        if !self.is_authored() {
            return None;
        }
        let raw = self.0.checked_sub(offset.0)?;
        u32::try_from(raw).ok().map(AuthoredNodeId)
    }

    /// Recover the dynamic id
    #[inline]
    pub fn to_dynamic(&self) -> Option<DynamicNodeId> {
        if !self.is_dynamic() {
            return None;
        }
        u32::try_from(-(self.0 + 1)).ok().map(DynamicNodeId)
    }

    /// Wrap a raw value received from an external caller
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(&self) -> i32 {
        self.0
    }

    /// Check if this is the reserved invalid id
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 == -1
    }

    /// Check if this id was derived from an authored id
    #[inline]
    pub const fn is_authored(&self) -> bool {
        self.0 >= 0
    }

    /// Check if this id was derived from a dynamic id
    #[inline]
    pub const fn is_dynamic(&self) -> bool {
        self.0 < -1
    }
}

impl Default for RuntimeNodeId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for RuntimeNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "RuntimeNodeId(invalid)")
        } else {
            write!(f, "RuntimeNodeId({})", self.0)
        }
    }
}

impl fmt::Display for RuntimeNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Engine keys
// ============================================================================

macro_rules! engine_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            /// Create a new key
            #[inline]
            pub const fn new(key: u32) -> Self {
                Self(key)
            }

            /// Get the raw key value
            #[inline]
            pub const fn raw(&self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

engine_key!(
    /// Engine key of an attached model
    ModelKey
);
engine_key!(
    /// Engine key of one inclusion of a model
    InclusionKey
);
engine_key!(
    /// Engine key of an instance, local to its model
    InstanceKey
);
engine_key!(
    /// Engine key of a mesh
    MeshKey
);

/// Fully qualified address of one engine instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceHandle {
    /// Owning model
    pub model: ModelKey,
    /// Instance within the model
    pub instance: InstanceKey,
}

impl InstanceHandle {
    /// Create a new instance handle
    pub const fn new(model: ModelKey, instance: InstanceKey) -> Self {
        Self { model, instance }
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model, self.instance)
    }
}

// ============================================================================
// Generators
// ============================================================================

/// Monotonic generator of dynamic node ids
#[derive(Debug, Clone)]
pub struct DynamicIdGenerator {
    next: u32,
}

impl DynamicIdGenerator {
    /// Create a new generator
    pub const fn new() -> Self {
        Self {
            next: DynamicNodeId::FIRST.0,
        }
    }

    /// Generate the next unique id
    ///
    /// Returns `None` once the runtime range is exhausted.
    pub fn next(&mut self) -> Option<DynamicNodeId> {
        let id = DynamicNodeId(self.next);
        RuntimeNodeId::from_dynamic(id)?;
        self.next = self.next.checked_add(1)?;
        Some(id)
    }

    /// Peek the next id without consuming it
    pub fn peek(&self) -> DynamicNodeId {
        DynamicNodeId(self.next)
    }
}

impl Default for DynamicIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authored_round_trip_through_offset() {
        let offset = NodeIdOffset::new(1000);
        let runtime = RuntimeNodeId::from_authored(AuthoredNodeId::new(42), offset).unwrap();

        assert_eq!(runtime.raw(), 1042);
        assert!(runtime.is_authored());
        assert_eq!(runtime.to_authored(offset), Some(AuthoredNodeId::new(42)));
        assert_eq!(runtime.to_dynamic(), None);
    }

    #[test]
    fn test_dynamic_ids_are_negative_and_skip_invalid() {
        let runtime = RuntimeNodeId::from_dynamic(DynamicNodeId::FIRST).unwrap();

        assert_eq!(runtime.raw(), -2);
        assert!(runtime.is_dynamic());
        assert!(!runtime.is_invalid());
        assert_eq!(runtime.to_dynamic(), Some(DynamicNodeId::FIRST));
        assert_eq!(runtime.to_authored(NodeIdOffset::ZERO), None);
    }

    #[test]
    fn test_invalid_id() {
        let id = RuntimeNodeId::default();
        assert!(id.is_invalid());
        assert!(!id.is_authored());
        assert!(!id.is_dynamic());
    }

    #[test]
    fn test_authored_overflow_is_rejected() {
        let offset = NodeIdOffset::new(i32::MAX);
        assert!(RuntimeNodeId::from_authored(AuthoredNodeId::new(1), offset).is_none());
        assert!(RuntimeNodeId::from_authored(AuthoredNodeId::new(u32::MAX), NodeIdOffset::ZERO).is_none());
    }

    #[test]
    fn test_dynamic_generator() {
        let mut gen = DynamicIdGenerator::new();
        let a = gen.next().unwrap();
        let b = gen.next().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.raw(), 1);
        assert_eq!(b.raw(), 2);
        assert_eq!(gen.peek().raw(), 3);
    }
}
