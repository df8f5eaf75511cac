//! Engine key remapping
//!
//! Structure data records the keys a model had when it was authored. When
//! the same model is attached again the engine hands out fresh keys, so each
//! attach remembers original → effective mappings. Mapping is opt-in per key;
//! unmapped keys resolve to themselves.

use cadstream_core::error::{TreeError, TreeResult};
use cadstream_core::id::{InclusionKey, InstanceHandle, ModelKey};
use std::collections::HashMap;

/// Write-once map from original to effective engine keys
#[derive(Clone, Debug, Default)]
pub struct ScKeyRemapper {
    models: HashMap<ModelKey, ModelKey>,
    inclusions: HashMap<InclusionKey, InclusionKey>,
}

impl ScKeyRemapper {
    /// Create an empty remapper
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a model key; remapping to the same target again is a no-op
    pub fn remap_model(&mut self, original: ModelKey, effective: ModelKey) -> TreeResult<()> {
        match self.models.get(&original) {
            Some(existing) if *existing != effective => Err(TreeError::RemapConflict {
                key: original.raw(),
                existing: existing.raw(),
                requested: effective.raw(),
            }),
            Some(_) => Ok(()),
            None => {
                self.models.insert(original, effective);
                Ok(())
            }
        }
    }

    /// Map an inclusion key; remapping to the same target again is a no-op
    pub fn remap_inclusion(&mut self, original: InclusionKey, effective: InclusionKey) -> TreeResult<()> {
        match self.inclusions.get(&original) {
            Some(existing) if *existing != effective => Err(TreeError::RemapConflict {
                key: original.raw(),
                existing: existing.raw(),
                requested: effective.raw(),
            }),
            Some(_) => Ok(()),
            None => {
                self.inclusions.insert(original, effective);
                Ok(())
            }
        }
    }

    /// Effective key of a model
    pub fn effective_model_key(&self, original: ModelKey) -> ModelKey {
        self.models.get(&original).copied().unwrap_or(original)
    }

    /// Effective key of an inclusion
    pub fn effective_inclusion_key(&self, original: InclusionKey) -> InclusionKey {
        self.inclusions.get(&original).copied().unwrap_or(original)
    }

    /// Effective address of an instance recorded against an original model key
    pub fn effective_instance(&self, original: InstanceHandle) -> InstanceHandle {
        InstanceHandle::new(self.effective_model_key(original.model), original.instance)
    }
}
