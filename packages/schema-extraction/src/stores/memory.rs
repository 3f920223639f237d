//! In-memory storage implementation for testing and development.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::{ExtractionError, Result};
use crate::traits::store::{
    ArtifactStore, ClassificationCache, ObjectQuery, ObjectStore, ProcessStore, RunStore, TaskStore,
};
use crate::types::{
    artifact::{Artifact, ClassificationCacheEntry, SourceFile},
    object::ResolvedObject,
    process::{Operation, Process},
    run::{Run, TaskDefinition},
};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| ExtractionError::storage("memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| ExtractionError::storage("memory store lock poisoned"))
}

/// In-memory storage for tasks, runs, processes, artifacts and objects.
///
/// Records keep insertion order, which doubles as creation order. Useful
/// for testing and development. Not suitable for production as data is
/// lost on restart.
pub struct MemoryStore {
    tasks: RwLock<IndexMap<Uuid, TaskDefinition>>,
    runs: RwLock<IndexMap<Uuid, Run>>,
    processes: RwLock<IndexMap<Uuid, Process>>,
    artifacts: RwLock<IndexMap<Uuid, Artifact>>,
    source_files: RwLock<IndexMap<Uuid, SourceFile>>,
    objects: RwLock<IndexMap<Uuid, ResolvedObject>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(IndexMap::new()),
            runs: RwLock::new(IndexMap::new()),
            processes: RwLock::new(IndexMap::new()),
            artifacts: RwLock::new(IndexMap::new()),
            source_files: RwLock::new(IndexMap::new()),
            objects: RwLock::new(IndexMap::new()),
        }
    }

    /// Number of stored resolved objects.
    pub fn object_count(&self) -> Result<usize> {
        Ok(read(&self.objects)?.len())
    }

    /// Number of stored processes.
    pub fn process_count(&self) -> Result<usize> {
        Ok(read(&self.processes)?.len())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get_task(&self, id: Uuid) -> Result<Option<TaskDefinition>> {
        Ok(read(&self.tasks)?.get(&id).cloned())
    }

    async fn save_task(&self, task: &TaskDefinition) -> Result<()> {
        write(&self.tasks)?.insert(task.id, task.clone());
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(read(&self.runs)?.get(&id).cloned())
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        write(&self.runs)?.insert(run.id, run.clone());
        Ok(())
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn get_process(&self, id: Uuid) -> Result<Option<Process>> {
        Ok(read(&self.processes)?.get(&id).cloned())
    }

    async fn save_process(&self, process: &Process) -> Result<()> {
        write(&self.processes)?.insert(process.id, process.clone());
        Ok(())
    }

    async fn processes_for_run(
        &self,
        run_id: Uuid,
        operation: Option<Operation>,
    ) -> Result<Vec<Process>> {
        Ok(read(&self.processes)?
            .values()
            .filter(|p| p.run_id == run_id)
            .filter(|p| operation.map_or(true, |op| p.operation == op))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>> {
        Ok(read(&self.artifacts)?.get(&id).cloned())
    }

    async fn save_artifact(&self, artifact: &Artifact) -> Result<()> {
        write(&self.artifacts)?.insert(artifact.id, artifact.clone());
        Ok(())
    }

    async fn children(&self, parent_id: Uuid) -> Result<Vec<Artifact>> {
        let mut children: Vec<Artifact> = read(&self.artifacts)?
            .values()
            .filter(|a| a.parent_artifact_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|a| (a.position, a.created_at));
        Ok(children)
    }

    async fn get_source_file(&self, id: Uuid) -> Result<Option<SourceFile>> {
        Ok(read(&self.source_files)?.get(&id).cloned())
    }

    async fn save_source_file(&self, file: &SourceFile) -> Result<()> {
        write(&self.source_files)?.insert(file.id, file.clone());
        Ok(())
    }
}

#[async_trait]
impl ClassificationCache for MemoryStore {
    async fn get_classification(
        &self,
        source_file_id: Uuid,
        schema_hash: &str,
    ) -> Result<Option<ClassificationCacheEntry>> {
        Ok(read(&self.source_files)?
            .get(&source_file_id)
            .and_then(|f| f.classification_cache.get(schema_hash))
            .cloned())
    }

    async fn store_classification(
        &self,
        source_file_id: Uuid,
        entry: &ClassificationCacheEntry,
    ) -> Result<()> {
        let mut files = write(&self.source_files)?;
        let file = files
            .get_mut(&source_file_id)
            .ok_or_else(|| ExtractionError::not_found("source file", source_file_id))?;
        file.classification_cache
            .insert(entry.schema_hash.clone(), entry.clone());
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_object(&self, id: Uuid) -> Result<Option<ResolvedObject>> {
        Ok(read(&self.objects)?.get(&id).cloned())
    }

    async fn save_object(&self, object: &ResolvedObject) -> Result<()> {
        write(&self.objects)?.insert(object.id, object.clone());
        Ok(())
    }

    async fn find_by_name(
        &self,
        team_id: Uuid,
        object_type: &str,
        root_object_id: Option<Uuid>,
        schema_definition_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<ResolvedObject>> {
        let wanted = name.trim().to_lowercase();
        if wanted.is_empty() {
            return Ok(None);
        }

        Ok(read(&self.objects)?
            .values()
            .filter(|o| o.team_id == team_id && o.object_type == object_type)
            .filter(|o| o.root_object_id == root_object_id)
            .filter(|o| schema_definition_id.is_none() || o.schema_definition_id == schema_definition_id)
            .find(|o| {
                o.name
                    .as_deref()
                    .is_some_and(|n| n.trim().to_lowercase() == wanted)
            })
            .cloned())
    }

    async fn search_objects(&self, query: &ObjectQuery) -> Result<Vec<ResolvedObject>> {
        let mut found: Vec<ResolvedObject> = read(&self.objects)?
            .values()
            .filter(|o| query.matches(o))
            .cloned()
            .collect();
        found.sort_by_key(|o| o.created_at);
        found.truncate(query.limit);
        Ok(found)
    }
}
