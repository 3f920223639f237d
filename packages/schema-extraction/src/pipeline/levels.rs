//! Level state machine: process creation, completion checks and level
//! advancement.
//!
//! Every check reads live state from the store. Nothing here calls the
//! inference service.

use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::traits::store::Store;
use crate::types::{
    artifact::Artifact,
    plan::ExtractionPlan,
    process::{Operation, Process, ProcessMeta},
    run::Run,
};

/// Creates processes for a run's current level and moves it forward.
pub struct LevelOrchestrator<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> LevelOrchestrator<'a, S>
where
    S: Store + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    async fn live_pages(&self, run: &Run) -> Result<Vec<Artifact>> {
        self.store.children(run.output_artifact_id).await
    }

    async fn level_processes(&self, run: &Run, operation: Operation, level: u32) -> Result<Vec<Process>> {
        Ok(self
            .store
            .processes_for_run(run.id, Some(operation))
            .await?
            .into_iter()
            .filter(|p| p.level() == Some(level))
            .collect())
    }

    /// One `Extract Identity` process per identity group and page classified
    /// for it. Runs once per level.
    #[instrument(skip(self, run, plan), fields(run_id = %run.id, level = run.current_level))]
    pub async fn create_identity_processes(&self, run: &mut Run, plan: &ExtractionPlan) -> Result<usize> {
        let level = run.current_level;
        if run.progress(level).identity_processes_created {
            return Ok(0);
        }

        let pages = self.live_pages(run).await?;
        let mut created = 0;

        for group in plan.level(level).map(|l| l.identities.as_slice()).unwrap_or(&[]) {
            for page in pages.iter().filter(|p| p.meta.in_category(&group.key)) {
                let process = Process::new(run.id, Operation::ExtractIdentity)
                    .with_meta(ProcessMeta {
                        level: Some(level),
                        object_type: Some(group.object_type.clone()),
                        group_key: Some(group.key.clone()),
                        ..Default::default()
                    })
                    .with_inputs([page.id]);
                self.store.save_process(&process).await?;
                created += 1;
            }
        }

        run.progress_mut(level).identity_processes_created = true;
        self.store.save_run(run).await?;

        info!(created, "Identity processes created");
        Ok(created)
    }

    /// True when every `Extract Identity` process of the level completed.
    pub async fn is_identity_complete_for_level(&self, run: &Run, level: u32) -> Result<bool> {
        let processes = self.level_processes(run, Operation::ExtractIdentity, level).await?;
        Ok(processes.iter().all(Process::is_complete))
    }

    /// One `Extract Remaining` process per remaining group and resolved
    /// object of the group's type. Runs once per level.
    #[instrument(skip(self, run, plan), fields(run_id = %run.id, level = run.current_level))]
    pub async fn create_remaining_processes(&self, run: &mut Run, plan: &ExtractionPlan) -> Result<usize> {
        let level = run.current_level;
        if run.progress(level).extraction_processes_created {
            return Ok(0);
        }

        let pages = self.live_pages(run).await?;
        let mut created = 0;

        for group in plan.level(level).map(|l| l.remaining.as_slice()).unwrap_or(&[]) {
            if group.is_identification_only() {
                continue;
            }

            let inputs: Vec<_> = pages
                .iter()
                .filter(|p| p.meta.in_category(&group.key))
                .map(|p| p.id)
                .collect();
            if inputs.is_empty() {
                debug!(group = %group.name, "No pages classified for group");
                continue;
            }

            for object_id in run.resolved_at(&group.object_type, level) {
                let process = Process::new(run.id, Operation::ExtractRemaining)
                    .with_meta(ProcessMeta {
                        level: Some(level),
                        object_type: Some(group.object_type.clone()),
                        group_key: Some(group.key.clone()),
                        object_id: Some(*object_id),
                        ..Default::default()
                    })
                    .with_inputs(inputs.iter().copied());
                self.store.save_process(&process).await?;
                created += 1;
            }
        }

        run.progress_mut(level).extraction_processes_created = true;
        self.store.save_run(run).await?;

        info!(created, "Remaining processes created");
        Ok(created)
    }

    /// True when every `Extract Remaining` process of the level completed.
    ///
    /// A level that needed no remaining processes is complete once the
    /// creation pass has run.
    pub async fn is_extraction_complete_for_level(&self, run: &Run, level: u32) -> Result<bool> {
        if !run.progress(level).extraction_processes_created {
            return Ok(false);
        }
        let processes = self.level_processes(run, Operation::ExtractRemaining, level).await?;
        Ok(processes.iter().all(Process::is_complete))
    }

    /// Next incomplete process of an operation at a level, fewest attempts
    /// first.
    pub async fn next_pending(&self, run: &Run, operation: Operation, level: u32) -> Result<Option<Process>> {
        let processes = self.level_processes(run, operation, level).await?;
        Ok(processes
            .into_iter()
            .filter(|p| !p.is_complete())
            .min_by_key(|p| (p.attempts, p.created_at)))
    }

    /// Move to the next planned level if the current one is complete.
    ///
    /// Returns whether the level changed. Never moves backwards.
    pub async fn advance_to_next_level(&self, run: &mut Run, plan: &ExtractionPlan) -> Result<bool> {
        let current = run.current_level;
        if !run.progress(current).is_complete() {
            return Ok(false);
        }

        let Some(next) = plan.levels.iter().map(|l| l.level).filter(|l| *l > current).min() else {
            return Ok(false);
        };

        run.current_level = next;
        self.store.save_run(run).await?;

        info!(run_id = %run.id, from = current, to = next, "Advanced to next level");
        Ok(true)
    }
}
