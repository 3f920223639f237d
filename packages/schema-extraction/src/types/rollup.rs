//! Rollup output types.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Counts of rolled-up objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RollupSummary {
    pub total_objects: usize,
    pub by_type: IndexMap<String, usize>,
}

/// The final nested object graph written to the rollup artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupOutput {
    pub extracted_at: DateTime<Utc>,
    pub objects: Vec<serde_json::Value>,
    pub summary: RollupSummary,
}
