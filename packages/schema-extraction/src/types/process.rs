//! Units of work inside a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What a process does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "Plan:Identify")]
    PlanIdentify,

    #[serde(rename = "Plan:Remaining")]
    PlanRemaining,

    #[serde(rename = "Classify")]
    Classify,

    #[serde(rename = "Extract Identity")]
    ExtractIdentity,

    #[serde(rename = "Extract Remaining")]
    ExtractRemaining,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlanIdentify => "Plan:Identify",
            Self::PlanRemaining => "Plan:Remaining",
            Self::Classify => "Classify",
            Self::ExtractIdentity => "Extract Identity",
            Self::ExtractRemaining => "Extract Remaining",
        }
    }

    /// Whether artifacts from this operation feed the rollup.
    pub fn is_extraction(self) -> bool {
        matches!(self, Self::ExtractIdentity | Self::ExtractRemaining)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group as returned by one planning attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedGroup {
    pub name: String,
    pub fields: Vec<String>,
}

/// One remaining-field planning attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageAttempt {
    pub attempt: usize,
    pub requested_fields: Vec<String>,
    pub groups_returned: Vec<PlannedGroup>,
    pub covered_fields: Vec<String>,
    pub missing_fields: Vec<String>,
    pub duplicate_fields: Vec<String>,
}

/// Operation-specific process metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProcessMeta {
    pub level: Option<u32>,
    pub object_type: Option<String>,

    /// Identity or remaining group key
    pub group_key: Option<String>,

    /// Target object for remaining extraction
    pub object_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempt_history: Vec<CoverageAttempt>,

    /// Accepted planning answer, kept so a retried run does not re-plan
    /// completed object types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// One unit of work inside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: Uuid,
    pub run_id: Uuid,
    pub operation: Operation,

    #[serde(default)]
    pub meta: ProcessMeta,

    #[serde(default)]
    pub input_artifact_ids: Vec<Uuid>,

    #[serde(default)]
    pub output_artifact_ids: Vec<Uuid>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Last soft-failure message
    #[serde(default)]
    pub error: Option<String>,

    /// Number of executions attempted
    #[serde(default)]
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
}

impl Process {
    pub fn new(run_id: Uuid, operation: Operation) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            operation,
            meta: ProcessMeta::default(),
            input_artifact_ids: Vec::new(),
            output_artifact_ids: Vec::new(),
            started_at: None,
            completed_at: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_meta(mut self, meta: ProcessMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_inputs(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.input_artifact_ids.extend(ids);
        self
    }

    /// Completion is a non-null `completed_at`.
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Mark an execution attempt as started.
    pub fn start(&mut self) {
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn complete(&mut self) {
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    /// Record a soft failure; the process stays incomplete.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn level(&self) -> Option<u32> {
        self.meta.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_serializes_with_display_names() {
        let json = serde_json::to_string(&Operation::PlanIdentify).unwrap();
        assert_eq!(json, "\"Plan:Identify\"");

        let op: Operation = serde_json::from_str("\"Extract Remaining\"").unwrap();
        assert_eq!(op, Operation::ExtractRemaining);
    }

    #[test]
    fn test_fail_keeps_process_incomplete() {
        let mut process = Process::new(Uuid::now_v7(), Operation::Classify);
        process.start();
        process.fail("timed out");

        assert!(!process.is_complete());
        assert_eq!(process.attempts, 1);

        process.start();
        process.complete();
        assert!(process.is_complete());
        assert!(process.error.is_none());
        assert_eq!(process.attempts, 2);
    }
}
