//! Orchestrator - the main entry point.
//!
//! Owns a store and an inference service and drives a run through
//! plan → classify → {identity → remaining per level} → rollup, one unit of
//! work per [`Orchestrator::step`].

use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::pipeline::classification::{ClassificationEngine, ClassificationSummary};
use crate::pipeline::fields::FieldExtractionEngine;
use crate::pipeline::identity::IdentityResolutionEngine;
use crate::pipeline::levels::LevelOrchestrator;
use crate::pipeline::planning::PlanningEngine;
use crate::pipeline::rollup::RollupEngine;
use crate::traits::inference::InferenceService;
use crate::traits::store::Store;
use crate::types::{
    artifact::Artifact,
    plan::ExtractionPlan,
    process::{Operation, Process},
    rollup::RollupOutput,
    run::Run,
};

/// What one step did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// A plan was compiled and cached on the task.
    Planned { levels: usize },

    /// A planning call failed softly; the next step resumes planning.
    PlanningIncomplete,

    /// One classification pass ran.
    Classified(ClassificationSummary),

    IdentityProcessesCreated { level: u32, count: usize },

    IdentityExtracted {
        level: u32,
        process_id: Uuid,
        object_id: Option<Uuid>,
    },

    RemainingProcessesCreated { level: u32, count: usize },

    FieldsExtracted {
        level: u32,
        process_id: Uuid,
        object_id: Option<Uuid>,
    },

    /// A process failed softly and stays pending.
    ProcessFailed {
        operation: Operation,
        process_id: Uuid,
        error: String,
    },

    LevelAdvanced { level: u32 },

    RolledUp { total_objects: usize },

    /// Nothing left to do.
    Complete,
}

impl StepOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Drives extraction runs against a store and an inference service.
///
/// ```rust,ignore
/// let orchestrator = Orchestrator::new(MemoryStore::new(), inference);
/// let run = orchestrator.start_run(task.id, pages_artifact.id).await?;
/// orchestrator.run_until_idle(run.id, 500).await?;
/// ```
pub struct Orchestrator<S, I> {
    store: S,
    inference: I,
}

impl<S: Store, I: InferenceService> Orchestrator<S, I> {
    pub fn new(store: S, inference: I) -> Self {
        Self { store, inference }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn inference(&self) -> &I {
        &self.inference
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Create a run for a task over the pages under `output_artifact_id`.
    ///
    /// The rolled-up graph goes to a separate artifact so it is never taken
    /// for a page.
    pub async fn start_run(&self, task_id: Uuid, output_artifact_id: Uuid) -> Result<Run> {
        let task = self.store.require_task(task_id).await?;
        task.runner_config.validate()?;
        self.store.require_artifact(output_artifact_id).await?;

        let rollup = Artifact::new(task.team_id, format!("{} Rollup", task.name));
        self.store.save_artifact(&rollup).await?;

        let run = Run::new(&task, output_artifact_id).with_rollup_artifact(rollup.id);
        self.store.save_run(&run).await?;

        info!(run_id = %run.id, task_id = %task.id, "Run started");
        Ok(run)
    }

    /// Perform the next eligible unit of work for a run.
    ///
    /// Every call re-reads the run, task and artifacts, so steps can be
    /// interleaved with other writers and resumed after a crash.
    #[instrument(skip(self))]
    pub async fn step(&self, run_id: Uuid) -> Result<StepOutcome> {
        let mut run = self.store.require_run(run_id).await?;
        let mut task = self.store.require_task(run.task_definition_id).await?;
        let config = task.runner_config.clone();

        let planner = PlanningEngine::new(&self.store, &self.inference, &config);
        let plan = match planner.cached_plan(&task) {
            Some(plan) => plan,
            None => {
                return Ok(match planner.plan(&mut task, &run).await? {
                    Some(plan) => StepOutcome::Planned {
                        levels: plan.levels.len(),
                    },
                    None => StepOutcome::PlanningIncomplete,
                });
            }
        };

        let classifier = ClassificationEngine::new(&self.store, &self.inference, &config);
        if !classifier.pages_classified(&run, &plan).await? {
            let summary = classifier.classify(&run, &plan).await?;
            return Ok(StepOutcome::Classified(summary));
        }

        let levels = LevelOrchestrator::new(&self.store);
        let level = run.current_level;

        // Identity
        if !run.progress(level).identity_processes_created {
            let count = levels.create_identity_processes(&mut run, &plan).await?;
            return Ok(StepOutcome::IdentityProcessesCreated { level, count });
        }
        if let Some(mut process) = levels.next_pending(&run, Operation::ExtractIdentity, level).await? {
            let group = plan
                .identity_group(group_key(&process)?)
                .cloned()
                .ok_or_else(|| unknown_group(&process))?;
            let engine = IdentityResolutionEngine::new(&self.store, &self.inference, &task);
            let object = engine.run_process(&mut run, &mut process, &group, level).await?;
            return Ok(executed(process, level, object.map(|o| o.id)));
        }
        if !run.progress(level).identity_complete
            && levels.is_identity_complete_for_level(&run, level).await?
        {
            run.progress_mut(level).identity_complete = true;
            self.store.save_run(&run).await?;
            debug!(level, "Identity complete");
        }

        // Remaining fields
        if !run.progress(level).extraction_processes_created {
            let count = levels.create_remaining_processes(&mut run, &plan).await?;
            return Ok(StepOutcome::RemainingProcessesCreated { level, count });
        }
        if let Some(mut process) = levels.next_pending(&run, Operation::ExtractRemaining, level).await? {
            let group = plan
                .remaining_group(group_key(&process)?)
                .cloned()
                .ok_or_else(|| unknown_group(&process))?;
            let engine = FieldExtractionEngine::new(&self.store, &self.inference, &config);
            let object = engine.run_process(&run, &mut process, &group, level).await?;
            return Ok(executed(process, level, object.map(|o| o.id)));
        }
        if !run.progress(level).extraction_complete
            && levels.is_extraction_complete_for_level(&run, level).await?
        {
            run.progress_mut(level).extraction_complete = true;
            self.store.save_run(&run).await?;
            debug!(level, "Extraction complete");
        }

        if levels.advance_to_next_level(&mut run, &plan).await? {
            return Ok(StepOutcome::LevelAdvanced {
                level: run.current_level,
            });
        }

        Ok(match RollupEngine::new(&self.store).rollup(&run, false).await? {
            Some(output) => StepOutcome::RolledUp {
                total_objects: output.summary.total_objects,
            },
            None => StepOutcome::Complete,
        })
    }

    /// Step until the run completes, stalls on repeated soft failures, or
    /// `max_steps` is reached. Returns the last outcome.
    #[instrument(skip(self))]
    pub async fn run_until_idle(&self, run_id: Uuid, max_steps: usize) -> Result<StepOutcome> {
        let mut failed: HashSet<Uuid> = HashSet::new();
        let mut last = StepOutcome::Complete;

        for step in 0..max_steps {
            last = self.step(run_id).await?;
            debug!(step, outcome = ?last, "Step finished");

            let stalled = match &last {
                StepOutcome::Complete => return Ok(last),
                StepOutcome::PlanningIncomplete => true,
                StepOutcome::Classified(summary) => {
                    summary.failed > 0 && summary.classified == 0 && summary.cache_hits == 0
                }
                StepOutcome::ProcessFailed { process_id, .. } => !failed.insert(*process_id),
                _ => false,
            };
            if stalled {
                warn!(run_id = %run_id, outcome = ?last, "Run stalled on soft failures");
                return Ok(last);
            }
        }

        warn!(run_id = %run_id, max_steps, "Step budget exhausted");
        Ok(last)
    }

    /// Rebuild the rollup, optionally replacing an existing one.
    pub async fn rollup(&self, run_id: Uuid, force: bool) -> Result<Option<RollupOutput>> {
        let run = self.store.require_run(run_id).await?;
        RollupEngine::new(&self.store).rollup(&run, force).await
    }

    /// The run's current plan, if one is cached for its task.
    pub async fn plan_for(&self, run: &Run) -> Result<Option<ExtractionPlan>> {
        let task = self.store.require_task(run.task_definition_id).await?;
        Ok(PlanningEngine::new(&self.store, &self.inference, &task.runner_config).cached_plan(&task))
    }
}

fn group_key(process: &Process) -> Result<&str> {
    process
        .meta
        .group_key
        .as_deref()
        .ok_or_else(|| unknown_group(process))
}

fn unknown_group(process: &Process) -> crate::error::ExtractionError {
    ValidationError::UnknownGroup {
        process_id: process.id,
        key: process.meta.group_key.clone().unwrap_or_default(),
    }
    .into()
}

fn executed(process: Process, level: u32, object_id: Option<Uuid>) -> StepOutcome {
    if process.is_complete() {
        return match process.operation {
            Operation::ExtractIdentity => StepOutcome::IdentityExtracted {
                level,
                process_id: process.id,
                object_id,
            },
            _ => StepOutcome::FieldsExtracted {
                level,
                process_id: process.id,
                object_id,
            },
        };
    }

    StepOutcome::ProcessFailed {
        operation: process.operation,
        process_id: process.id,
        error: process.error.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use crate::testing::{sample_schema, seed_run, MockInference};
    use crate::error::ExtractionError;
    use crate::traits::store::{ArtifactStore, RunStore, TaskStore};
    use crate::types::{config::RunnerConfig, run::TaskDefinition};
    use serde_json::json;

    fn scripted() -> MockInference {
        MockInference::new()
            .with_response(
                Operation::PlanIdentify,
                json!({"identity_fields": ["name"], "skim_fields": [], "description": "Provider pages"}),
            )
            .with_response(
                Operation::PlanRemaining,
                json!({"groups": [{"name": "Contact", "fields": ["phone", "email"], "search_mode": "skim"}]}),
            )
            .with_response(
                Operation::PlanIdentify,
                json!({"identity_fields": ["code", "diagnosed_on"], "skim_fields": []}),
            )
            .with_response(
                Operation::ExtractIdentity,
                json!({"provider": {"name": "Dr. Smith", "_search_query": {"name": "%Smith%"}}}),
            )
            .with_response(
                Operation::ExtractRemaining,
                json!({"data": {"phone": "555-0100", "email": "smith@clinic.test"}, "confidence": {"phone": 5, "email": 5}}),
            )
            .with_response(
                Operation::ExtractIdentity,
                json!({"diagnoses": [{"code": "J45", "diagnosed_on": "10/23/2017", "_search_query": []}]}),
            )
    }

    #[tokio::test]
    async fn test_full_run_reaches_rollup() {
        let store = MemoryStore::new();
        let (task, seeded) = seed_run(&store, sample_schema(), &["Dr. Smith, 555-0100, asthma J45"]).await;
        let orchestrator = Orchestrator::new(store, scripted());
        let run = orchestrator.start_run(task.id, seeded.output_artifact_id).await.unwrap();

        let outcome = orchestrator.run_until_idle(run.id, 50).await.unwrap();
        assert!(outcome.is_complete());

        let run = orchestrator.store().require_run(run.id).await.unwrap();
        assert_eq!(run.current_level, 1);
        assert!(run.progress(0).is_complete());
        assert!(run.progress(1).is_complete());

        let rollup = orchestrator
            .store()
            .require_artifact(run.rollup_artifact_id.unwrap())
            .await
            .unwrap()
            .json_content
            .unwrap();
        let provider = &rollup["objects"][0];
        assert_eq!(provider["name"], "Dr. Smith");
        assert_eq!(provider["phone"], "555-0100");
        assert_eq!(provider["diagnoses"][0]["code"], "J45");
        assert_eq!(rollup["summary"]["total_objects"], 2);
    }

    #[tokio::test]
    async fn test_step_sequence_starts_with_planning() {
        let store = MemoryStore::new();
        let (task, seeded) = seed_run(&store, sample_schema(), &["page"]).await;
        let orchestrator = Orchestrator::new(store, scripted());
        let run = orchestrator.start_run(task.id, seeded.output_artifact_id).await.unwrap();

        assert_eq!(
            orchestrator.step(run.id).await.unwrap(),
            StepOutcome::Planned { levels: 2 }
        );
        assert!(matches!(
            orchestrator.step(run.id).await.unwrap(),
            StepOutcome::Classified(ClassificationSummary { classified: 1, .. })
        ));
        assert_eq!(
            orchestrator.step(run.id).await.unwrap(),
            StepOutcome::IdentityProcessesCreated { level: 0, count: 1 }
        );
    }

    #[tokio::test]
    async fn test_start_run_rejects_invalid_config() {
        let store = MemoryStore::new();
        let task = TaskDefinition::new(Uuid::now_v7(), "Broken", sample_schema())
            .with_runner_config(RunnerConfig::default().with_skim_batch_size(0));
        store.save_task(&task).await.unwrap();
        let pages = Artifact::new(task.team_id, "Pages");
        store.save_artifact(&pages).await.unwrap();

        let orchestrator = Orchestrator::new(store, MockInference::new());
        let err = tokio_test::assert_err!(orchestrator.start_run(task.id, pages.id).await);
        assert!(matches!(err, ExtractionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_repeated_soft_failure_stalls_without_error() {
        let store = MemoryStore::new();
        let (task, seeded) = seed_run(&store, sample_schema(), &["page"]).await;
        let inference = MockInference::new()
            .with_failure(Operation::PlanIdentify, "model overloaded");
        let orchestrator = Orchestrator::new(store, inference);
        let run = orchestrator.start_run(task.id, seeded.output_artifact_id).await.unwrap();

        let outcome = orchestrator.run_until_idle(run.id, 10).await.unwrap();
        assert_eq!(outcome, StepOutcome::PlanningIncomplete);
        assert!(orchestrator.plan_for(&run).await.unwrap().is_none());
    }
}
