//! Session configuration.
//!
//! Every field has a default, so an empty TOML file is a valid config:
//!
//! ```toml
//! model_context_window = 128000
//! compaction_threshold_ratio = 0.75
//! output_limit_bytes = 16384
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::context::compaction::{DEFAULT_KEEP_RECENT_ITEMS, DEFAULT_TARGET_RATIO};
use crate::context::manager::{DEFAULT_COMPACTION_THRESHOLD, DEFAULT_CONTEXT_WINDOW};
use crate::context::truncate::{DEFAULT_HEAD_FRACTION, DEFAULT_OUTPUT_LIMIT_BYTES};
use crate::error::ConfigError;
use crate::instructions::DEFAULT_INSTRUCTION_CEILING_BYTES;

/// Configuration for one session's context handling.
///
/// # Example
///
/// ```
/// use ctxkeep::config::ContextConfig;
///
/// let config = ContextConfig::default()
///     .with_model_context_window(128_000)
///     .with_compaction_threshold_ratio(0.8);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Token capacity of the active model, from the model registry.
    pub model_context_window: usize,
    /// Fraction of the window at which compaction is required.
    pub compaction_threshold_ratio: f64,
    /// Truncate tool results on append.
    pub truncate_tool_results: bool,
    /// Per-output limit for tool results.
    pub output_limit_bytes: usize,
    /// Share of truncated output kept from the head.
    pub truncation_head_fraction: f64,
    /// Cap on merged instructions.
    pub instruction_ceiling_bytes: usize,
    /// Desired `original / summary` token ratio.
    pub compaction_target_ratio: f64,
    /// Trailing items never compacted when no user turn marks the boundary.
    pub keep_recent_items: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            model_context_window: DEFAULT_CONTEXT_WINDOW,
            compaction_threshold_ratio: DEFAULT_COMPACTION_THRESHOLD,
            truncate_tool_results: true,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            truncation_head_fraction: DEFAULT_HEAD_FRACTION,
            instruction_ceiling_bytes: DEFAULT_INSTRUCTION_CEILING_BYTES,
            compaction_target_ratio: DEFAULT_TARGET_RATIO,
            keep_recent_items: DEFAULT_KEEP_RECENT_ITEMS,
        }
    }
}

impl ContextConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_context_window == 0 {
            return Err(ConfigError::Invalid(
                "model_context_window must be greater than zero".into(),
            ));
        }
        if !(self.compaction_threshold_ratio > 0.0 && self.compaction_threshold_ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "compaction_threshold_ratio must be in (0, 1], got {}",
                self.compaction_threshold_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.truncation_head_fraction) {
            return Err(ConfigError::Invalid(format!(
                "truncation_head_fraction must be in [0, 1], got {}",
                self.truncation_head_fraction
            )));
        }
        if self.compaction_target_ratio.is_nan() || self.compaction_target_ratio <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "compaction_target_ratio must be greater than 1, got {}",
                self.compaction_target_ratio
            )));
        }
        if self.instruction_ceiling_bytes == 0 {
            return Err(ConfigError::Invalid(
                "instruction_ceiling_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn with_model_context_window(mut self, tokens: usize) -> Self {
        self.model_context_window = tokens;
        self
    }

    pub fn with_compaction_threshold_ratio(mut self, ratio: f64) -> Self {
        self.compaction_threshold_ratio = ratio;
        self
    }

    pub fn with_truncate_tool_results(mut self, enabled: bool) -> Self {
        self.truncate_tool_results = enabled;
        self
    }

    pub fn with_output_limit_bytes(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn with_truncation_head_fraction(mut self, fraction: f64) -> Self {
        self.truncation_head_fraction = fraction;
        self
    }

    pub fn with_instruction_ceiling_bytes(mut self, bytes: usize) -> Self {
        self.instruction_ceiling_bytes = bytes;
        self
    }

    pub fn with_compaction_target_ratio(mut self, ratio: f64) -> Self {
        self.compaction_target_ratio = ratio;
        self
    }

    pub fn with_keep_recent_items(mut self, n: usize) -> Self {
        self.keep_recent_items = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ContextConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.compaction_threshold_ratio, 0.70);
        assert_eq!(config.output_limit_bytes, 10 * 1024);
        assert_eq!(config.instruction_ceiling_bytes, 32 * 1024);
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(ContextConfig::from_toml_str("").unwrap(), ContextConfig::default());
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = ContextConfig::from_toml_str(
            "model_context_window = 128000\ntruncate_tool_results = false\n",
        )
        .unwrap();
        assert_eq!(config.model_context_window, 128_000);
        assert!(!config.truncate_tool_results);
        assert_eq!(config.output_limit_bytes, 10 * 1024);
    }

    #[test]
    fn rejects_bad_ratio() {
        let err = ContextConfig::from_toml_str("compaction_threshold_ratio = 1.5").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = ContextConfig::from_toml_str("compaction_threshold_ratio = 0.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_window() {
        let config = ContextConfig::default().with_model_context_window(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = ContextConfig::from_toml_str("model_context_window = \"big\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctxkeep.toml");
        std::fs::write(&path, "output_limit_bytes = 4096\n").unwrap();
        assert_eq!(ContextConfig::load(&path).unwrap().output_limit_bytes, 4096);

        let missing = ContextConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
