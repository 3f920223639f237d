//! Storage traits for tasks, runs, processes, artifacts and objects.
//!
//! The storage layer is split into focused traits for flexibility:
//! - `TaskStore`: Task definitions (carry the plan cache)
//! - `RunStore`: Runs and their level state
//! - `ProcessStore`: Units of work
//! - `ArtifactStore`: Artifact trees and source files
//! - `ClassificationCache`: Per-source-file classification results
//! - `ObjectStore`: Resolved domain objects and candidate search
//! - `Store`: Composite trait combining all of them
//!
//! Implementations are expected to give lock-on-write semantics per record.
//! Reads of artifact children must always hit the source of truth.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{ExtractionError, Result};
use crate::pipeline::field_types::FieldPredicate;
use crate::types::{
    artifact::{Artifact, ClassificationCacheEntry, SourceFile},
    object::ResolvedObject,
    process::{Operation, Process},
    run::{Run, TaskDefinition},
};

/// Storage for task definitions.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, id: Uuid) -> Result<Option<TaskDefinition>>;

    async fn save_task(&self, task: &TaskDefinition) -> Result<()>;

    /// Get a task or fail with `NotFound`.
    async fn require_task(&self, id: Uuid) -> Result<TaskDefinition> {
        self.get_task(id)
            .await?
            .ok_or_else(|| ExtractionError::not_found("task definition", id))
    }
}

/// Storage for runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get_run(&self, id: Uuid) -> Result<Option<Run>>;

    async fn save_run(&self, run: &Run) -> Result<()>;

    /// Get a run or fail with `NotFound`.
    async fn require_run(&self, id: Uuid) -> Result<Run> {
        self.get_run(id)
            .await?
            .ok_or_else(|| ExtractionError::not_found("run", id))
    }
}

/// Storage for processes.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn get_process(&self, id: Uuid) -> Result<Option<Process>>;

    /// Insert or replace a process.
    async fn save_process(&self, process: &Process) -> Result<()>;

    /// Processes of a run in creation order, optionally filtered by
    /// operation.
    async fn processes_for_run(
        &self,
        run_id: Uuid,
        operation: Option<Operation>,
    ) -> Result<Vec<Process>>;
}

/// Storage for artifacts and their source files.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>>;

    /// Insert or replace an artifact.
    async fn save_artifact(&self, artifact: &Artifact) -> Result<()>;

    /// Live children of an artifact, ordered by position then creation.
    async fn children(&self, parent_id: Uuid) -> Result<Vec<Artifact>>;

    async fn get_source_file(&self, id: Uuid) -> Result<Option<SourceFile>>;

    async fn save_source_file(&self, file: &SourceFile) -> Result<()>;

    /// Get an artifact or fail with `NotFound`.
    async fn require_artifact(&self, id: Uuid) -> Result<Artifact> {
        self.get_artifact(id)
            .await?
            .ok_or_else(|| ExtractionError::not_found("artifact", id))
    }

    /// Get several artifacts, skipping missing ids.
    async fn get_artifacts(&self, ids: &[Uuid]) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(artifact) = self.get_artifact(*id).await? {
                artifacts.push(artifact);
            }
        }
        Ok(artifacts)
    }
}

/// Persistent classification cache stored on source files.
#[async_trait]
pub trait ClassificationCache: Send + Sync {
    /// Cached classification of a source file for a schema hash.
    async fn get_classification(
        &self,
        source_file_id: Uuid,
        schema_hash: &str,
    ) -> Result<Option<ClassificationCacheEntry>>;

    /// Store (or overwrite) the classification for the entry's schema hash.
    async fn store_classification(
        &self,
        source_file_id: Uuid,
        entry: &ClassificationCacheEntry,
    ) -> Result<()>;
}

/// Scoped search over resolved objects.
#[derive(Debug, Clone)]
pub struct ObjectQuery {
    pub team_id: Uuid,
    pub object_type: String,

    /// Restrict to children of this object
    pub root_object_id: Option<Uuid>,

    /// Restrict to objects of this schema definition
    pub schema_definition_id: Option<Uuid>,

    /// All predicates must hold
    pub predicates: Vec<FieldPredicate>,

    pub limit: usize,
}

impl ObjectQuery {
    /// Whether an object is inside the query scope and satisfies every
    /// predicate.
    pub fn matches(&self, object: &ResolvedObject) -> bool {
        if object.team_id != self.team_id || object.object_type != self.object_type {
            return false;
        }
        if self.root_object_id.is_some() && object.root_object_id != self.root_object_id {
            return false;
        }
        if self.schema_definition_id.is_some()
            && object.schema_definition_id != self.schema_definition_id
        {
            return false;
        }
        self.predicates.iter().all(|p| p.matches(object))
    }
}

/// Storage for resolved objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, id: Uuid) -> Result<Option<ResolvedObject>>;

    /// Insert or replace an object.
    async fn save_object(&self, object: &ResolvedObject) -> Result<()>;

    /// Same-type, same-parent-scope object with a case-insensitive equal
    /// name. A `schema_definition_id` narrows the scope the way
    /// [`ObjectQuery`] does.
    async fn find_by_name(
        &self,
        team_id: Uuid,
        object_type: &str,
        root_object_id: Option<Uuid>,
        schema_definition_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<ResolvedObject>>;

    /// Objects matching a query, oldest first, at most `query.limit`.
    async fn search_objects(&self, query: &ObjectQuery) -> Result<Vec<ResolvedObject>>;

    /// Get an object or fail with `NotFound`.
    async fn require_object(&self, id: Uuid) -> Result<ResolvedObject> {
        self.get_object(id)
            .await?
            .ok_or_else(|| ExtractionError::not_found("resolved object", id))
    }
}

/// Composite storage trait combining all stores.
///
/// This is the main trait used by the orchestrator.
pub trait Store:
    TaskStore + RunStore + ProcessStore + ArtifactStore + ClassificationCache + ObjectStore
{
}

// Blanket implementation: anything implementing all the parts is a Store
impl<T> Store for T where
    T: TaskStore + RunStore + ProcessStore + ArtifactStore + ClassificationCache + ObjectStore
{
}
