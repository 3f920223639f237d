//! Task definitions and runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::config::RunnerConfig;
use super::plan::PlanCacheEntry;

/// A reusable extraction task: a schema plus runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,

    /// JSON-schema-like definition of what to extract
    pub schema: serde_json::Value,

    /// Scope for resolved objects created by this task
    #[serde(default)]
    pub schema_definition_id: Option<Uuid>,

    #[serde(default)]
    pub runner_config: RunnerConfig,

    /// Last compiled plan
    #[serde(default)]
    pub plan_cache: Option<PlanCacheEntry>,
}

impl TaskDefinition {
    pub fn new(team_id: Uuid, name: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            team_id,
            name: name.into(),
            schema,
            schema_definition_id: None,
            runner_config: RunnerConfig::default(),
            plan_cache: None,
        }
    }

    pub fn with_runner_config(mut self, config: RunnerConfig) -> Self {
        self.runner_config = config;
        self
    }

    pub fn with_schema_definition(mut self, id: Uuid) -> Self {
        self.schema_definition_id = Some(id);
        self
    }
}

/// Completion state of one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LevelProgress {
    pub identity_complete: bool,
    pub extraction_complete: bool,

    #[serde(default)]
    pub identity_processes_created: bool,

    #[serde(default)]
    pub extraction_processes_created: bool,
}

impl LevelProgress {
    pub fn is_complete(&self) -> bool {
        self.identity_complete && self.extraction_complete
    }
}

/// One execution of a task over one source document set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub team_id: Uuid,
    pub task_definition_id: Uuid,

    /// Artifact whose children are the page artifacts
    pub output_artifact_id: Uuid,

    /// Artifact receiving the rolled-up object graph
    #[serde(default)]
    pub rollup_artifact_id: Option<Uuid>,

    pub current_level: u32,

    #[serde(default)]
    pub level_progress: BTreeMap<u32, LevelProgress>,

    /// object_type -> level -> resolved object ids
    #[serde(default)]
    pub resolved_objects: BTreeMap<String, BTreeMap<u32, Vec<Uuid>>>,

    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(task: &TaskDefinition, output_artifact_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            team_id: task.team_id,
            task_definition_id: task.id,
            output_artifact_id,
            rollup_artifact_id: None,
            current_level: 0,
            level_progress: BTreeMap::new(),
            resolved_objects: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_rollup_artifact(mut self, artifact_id: Uuid) -> Self {
        self.rollup_artifact_id = Some(artifact_id);
        self
    }

    /// Progress for a level (default: nothing done).
    pub fn progress(&self, level: u32) -> LevelProgress {
        self.level_progress.get(&level).copied().unwrap_or_default()
    }

    /// Mutable progress for a level.
    pub fn progress_mut(&mut self, level: u32) -> &mut LevelProgress {
        self.level_progress.entry(level).or_default()
    }

    /// Record a resolved object id, keeping the list duplicate-free.
    pub fn record_resolved(&mut self, object_type: &str, level: u32, object_id: Uuid) {
        let ids = self
            .resolved_objects
            .entry(object_type.to_string())
            .or_default()
            .entry(level)
            .or_default();
        if !ids.contains(&object_id) {
            ids.push(object_id);
        }
    }

    /// Resolved object ids of a type at a level.
    pub fn resolved_at(&self, object_type: &str, level: u32) -> &[Uuid] {
        self.resolved_objects
            .get(object_type)
            .and_then(|levels| levels.get(&level))
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_resolved_deduplicates() {
        let task = TaskDefinition::new(Uuid::now_v7(), "task", json!({}));
        let mut run = Run::new(&task, Uuid::now_v7());
        let id = Uuid::now_v7();

        run.record_resolved("Provider", 0, id);
        run.record_resolved("Provider", 0, id);
        run.record_resolved("Provider", 1, id);

        assert_eq!(run.resolved_at("Provider", 0), &[id]);
        assert_eq!(run.resolved_at("Provider", 1), &[id]);
        assert!(run.resolved_at("Diagnosis", 0).is_empty());
    }

    #[test]
    fn test_progress_defaults_to_incomplete() {
        let task = TaskDefinition::new(Uuid::now_v7(), "task", json!({}));
        let run = Run::new(&task, Uuid::now_v7());
        assert!(!run.progress(0).is_complete());
    }
}
