//! Runner configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, ValidationError};

/// How a remaining-field group is extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Batched, confidence-gated pass that may stop early.
    #[default]
    Skim,

    /// Single complete pass over all classified content.
    Exhaustive,
}

impl SearchMode {
    /// Parse a model-provided label, defaulting to skim.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "exhaustive" | "full" | "complete" => Self::Exhaustive,
            _ => Self::Skim,
        }
    }
}

/// Global override for group-level search modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GlobalSearchMode {
    /// Respect each group's own choice.
    #[default]
    Intelligent,

    /// Force skim mode for every group.
    SkimOnly,

    /// Force exhaustive mode for every group.
    ExhaustiveOnly,
}

impl GlobalSearchMode {
    /// Resolve the effective mode for a group.
    pub fn resolve(self, group_mode: SearchMode) -> SearchMode {
        match self {
            Self::Intelligent => group_mode,
            Self::SkimOnly => SearchMode::Skim,
            Self::ExhaustiveOnly => SearchMode::Exhaustive,
        }
    }
}

/// Configuration for a task runner.
///
/// Resolved once per run and passed down explicitly. It is part of the plan
/// cache fingerprint, so any change here forces replanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum number of fields in a single planning group.
    ///
    /// Default: 10.
    pub group_max_points: usize,

    /// Global override for per-group search modes.
    pub global_search_mode: GlobalSearchMode,

    /// Number of page artifacts per skim batch.
    ///
    /// Default: 5.
    pub skim_batch_size: usize,

    /// Confidence (1-5) every field must reach to stop skimming early.
    ///
    /// Default: 4.
    pub confidence_threshold: u8,

    /// Per-inference-call timeout in seconds.
    ///
    /// Default: 300.
    pub extraction_timeout: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            group_max_points: 10,
            global_search_mode: GlobalSearchMode::Intelligent,
            skim_batch_size: 5,
            confidence_threshold: 4,
            extraction_timeout: 300,
        }
    }
}

impl RunnerConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config from a JSON value, filling in defaults.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone())?;
        config.validate()?;
        Ok(config)
    }

    /// Set the max fields per planning group.
    pub fn with_group_max_points(mut self, points: usize) -> Self {
        self.group_max_points = points;
        self
    }

    /// Set the global search mode.
    pub fn with_global_search_mode(mut self, mode: GlobalSearchMode) -> Self {
        self.global_search_mode = mode;
        self
    }

    /// Set the skim batch size.
    pub fn with_skim_batch_size(mut self, size: usize) -> Self {
        self.skim_batch_size = size;
        self
    }

    /// Set the confidence threshold.
    pub fn with_confidence_threshold(mut self, threshold: u8) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Set the per-call timeout in seconds.
    pub fn with_extraction_timeout(mut self, seconds: u64) -> Self {
        self.extraction_timeout = seconds;
        self
    }

    /// Per-call timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout)
    }

    /// Check that every value is in range.
    pub fn validate(&self) -> Result<()> {
        if self.group_max_points == 0 {
            return Err(ValidationError::InvalidConfig {
                field: "group_max_points",
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.skim_batch_size == 0 {
            return Err(ValidationError::InvalidConfig {
                field: "skim_batch_size",
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if !(1..=5).contains(&self.confidence_threshold) {
            return Err(ValidationError::InvalidConfig {
                field: "confidence_threshold",
                reason: format!("{} is outside 1-5", self.confidence_threshold),
            }
            .into());
        }
        if self.extraction_timeout == 0 {
            return Err(ValidationError::InvalidConfig {
                field: "extraction_timeout",
                reason: "must be at least 1 second".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
