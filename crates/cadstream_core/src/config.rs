//! Streaming configuration
//!
//! Consumer-facing knobs for the assembly streaming engine. Configurations can
//! be built in code or loaded from a TOML document; missing keys fall back to
//! the defaults documented on each field.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How not-yet-attached external models are previewed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundingPreviewMode {
    /// No preview
    #[default]
    None,
    /// Unloaded placeholders with known bounds are previewed as boxes
    Unloaded,
    /// Every pending attachment is previewed, even below the cutoff
    All,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Configuration for tree loading and attachment streaming
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Multiplier on the projected-size cutoff (0 disables the cutoff)
    pub stream_cutoff_scale: f32,

    /// Engine memory budget in bytes; usage above it raises the cutoff
    pub memory_limit: Option<u64>,

    /// Preview policy for pending external models
    pub bounding_preview_mode: BoundingPreviewMode,

    /// Maximum concurrently active low-level attach operations
    pub max_concurrent_attachments: usize,

    /// Resolve missing external models to empty attaches instead of failing
    pub allow_missing_external_models: bool,

    /// Attach XML-referenced external models as part of the load
    pub implicitly_load_xml_external_models: bool,

    /// Yield to the scheduler after this many reified nodes (0 never yields)
    pub nodes_per_yield: usize,

    /// Delay before a camera change triggers reprioritization
    pub reprioritize_debounce_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            stream_cutoff_scale: 1.0,
            memory_limit: None,
            bounding_preview_mode: BoundingPreviewMode::None,
            max_concurrent_attachments: 8,
            allow_missing_external_models: false,
            implicitly_load_xml_external_models: true,
            nodes_per_yield: 1000,
            reprioritize_debounce_ms: 100,
        }
    }
}

impl StreamingConfig {
    /// Parse a TOML document over the defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: StreamingConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_attachments == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_attachments",
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.stream_cutoff_scale.is_finite() || self.stream_cutoff_scale < 0.0 {
            return Err(ConfigError::Invalid {
                field: "stream_cutoff_scale",
                reason: format!("{} is not a non-negative number", self.stream_cutoff_scale),
            });
        }
        if self.memory_limit == Some(0) {
            return Err(ConfigError::Invalid {
                field: "memory_limit",
                reason: "must be positive when set".to_string(),
            });
        }
        Ok(())
    }

    /// Builder: set the cutoff scale
    pub fn with_cutoff_scale(mut self, scale: f32) -> Self {
        self.stream_cutoff_scale = scale;
        self
    }

    /// Builder: set the attach concurrency limit
    pub fn with_max_concurrent_attachments(mut self, max: usize) -> Self {
        self.max_concurrent_attachments = max;
        self
    }

    /// Builder: allow missing external models
    pub fn with_allow_missing_external_models(mut self, allow: bool) -> Self {
        self.allow_missing_external_models = allow;
        self
    }

    /// Builder: attach XML external models during the load
    pub fn with_implicit_xml_external_models(mut self, implicit: bool) -> Self {
        self.implicitly_load_xml_external_models = implicit;
        self
    }
}
