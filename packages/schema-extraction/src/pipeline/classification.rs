//! Page classification against plan categories.
//!
//! Every page artifact gets a boolean per category key. Results are cached
//! on the page's source file keyed by the hash of the boolean schema, so a
//! re-run with the same plan categories costs no inference calls.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::pipeline::field_types::parse_bool;
use crate::pipeline::fingerprint::compute_schema_hash;
use crate::pipeline::prompts::format_classify_prompt;
use crate::traits::inference::{submit_bounded, InferenceRequest, InferenceService};
use crate::traits::store::Store;
use crate::types::{
    artifact::{Artifact, ClassificationCacheEntry},
    config::RunnerConfig,
    plan::ExtractionPlan,
    process::{Operation, Process},
    run::Run,
};

/// One required boolean property per plan category.
pub fn build_boolean_schema(plan: &ExtractionPlan) -> Value {
    let categories = plan.categories();

    let mut properties = Map::new();
    for (key, description) in &categories {
        properties.insert(
            key.clone(),
            json!({"type": "boolean", "description": description}),
        );
    }
    let required: Vec<&String> = categories.iter().map(|(k, _)| k).collect();

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

/// Cache key of a plan's boolean schema.
pub fn schema_hash(plan: &ExtractionPlan) -> String {
    compute_schema_hash(&build_boolean_schema(plan))
}

/// Read a model answer into a full category map; missing keys are false.
fn read_classification(keys: &[String], json: &Value) -> BTreeMap<String, bool> {
    keys.iter()
        .map(|key| {
            let value = json.get(key).and_then(parse_bool).unwrap_or(false);
            (key.clone(), value)
        })
        .collect()
}

/// Counts from one classification pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassificationSummary {
    pub classified: usize,
    pub cache_hits: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Classifies page artifacts of a run.
pub struct ClassificationEngine<'a, S: ?Sized, I: ?Sized> {
    store: &'a S,
    inference: &'a I,
    config: &'a RunnerConfig,
}

impl<'a, S, I> ClassificationEngine<'a, S, I>
where
    S: Store + ?Sized,
    I: InferenceService + ?Sized,
{
    pub fn new(store: &'a S, inference: &'a I, config: &'a RunnerConfig) -> Self {
        Self {
            store,
            inference,
            config,
        }
    }

    /// Classify every page not yet classified.
    ///
    /// Incomplete `Classify` processes from an earlier pass are re-executed.
    #[instrument(skip(self, run, plan), fields(run_id = %run.id))]
    pub async fn classify(&self, run: &Run, plan: &ExtractionPlan) -> Result<ClassificationSummary> {
        let schema = build_boolean_schema(plan);
        let hash = compute_schema_hash(&schema);
        let keys: Vec<String> = plan.categories().into_iter().map(|(k, _)| k).collect();
        let prompt = format_classify_prompt(&plan.categories());

        let pages = self.store.children(run.output_artifact_id).await?;
        let processes = self
            .store
            .processes_for_run(run.id, Some(Operation::Classify))
            .await?;

        let mut summary = ClassificationSummary::default();

        for page in pages {
            if page.meta.is_classified_for(keys.iter().map(String::as_str)) {
                summary.skipped += 1;
                continue;
            }

            let existing = processes
                .iter()
                .find(|p| p.input_artifact_ids.contains(&page.id))
                .cloned();
            if existing.as_ref().is_some_and(Process::is_complete) {
                summary.skipped += 1;
                continue;
            }

            if let Some(file_id) = page.source_file_id {
                if let Some(entry) = self.store.get_classification(file_id, &hash).await? {
                    debug!(artifact_id = %page.id, "Classification cache hit");
                    self.apply(&page, &keys, &entry.result).await?;
                    if let Some(mut process) = existing {
                        process.output_artifact_ids.push(page.id);
                        process.complete();
                        self.store.save_process(&process).await?;
                    }
                    summary.cache_hits += 1;
                    continue;
                }
            }

            let mut process = match existing {
                Some(process) => process,
                None => {
                    let process = Process::new(run.id, Operation::Classify).with_inputs([page.id]);
                    self.store.save_process(&process).await?;
                    process
                }
            };

            process.start();
            let request = InferenceRequest::new(
                Operation::Classify,
                prompt.clone(),
                schema.clone(),
                self.config.timeout(),
            )
            .with_artifacts([&page]);
            let response = submit_bounded(self.inference, request).await;
            let failure = response.failure_message();

            match response.into_json() {
                Some(json) => {
                    let result = read_classification(&keys, &json);
                    if let Some(file_id) = page.source_file_id {
                        let entry = ClassificationCacheEntry::new(hash.clone(), result.clone());
                        self.store.store_classification(file_id, &entry).await?;
                    }
                    self.apply(&page, &keys, &result).await?;

                    process.output_artifact_ids.push(page.id);
                    process.complete();
                    self.store.save_process(&process).await?;
                    summary.classified += 1;
                }
                None => {
                    warn!(artifact_id = %page.id, error = %failure, "Classification failed");
                    process.fail(failure);
                    self.store.save_process(&process).await?;
                    summary.failed += 1;
                }
            }
        }

        info!(
            classified = summary.classified,
            cache_hits = summary.cache_hits,
            skipped = summary.skipped,
            failed = summary.failed,
            "Classification pass finished"
        );
        Ok(summary)
    }

    /// Write a classification onto the live copy of a page.
    async fn apply(&self, page: &Artifact, keys: &[String], result: &BTreeMap<String, bool>) -> Result<()> {
        let mut live = self.store.require_artifact(page.id).await?;
        for key in keys {
            live.meta
                .classification
                .insert(key.clone(), result.get(key).copied().unwrap_or(false));
        }
        self.store.save_artifact(&live).await
    }

    /// True iff at least one `Classify` process exists and all completed.
    pub async fn is_classification_complete(&self, run: &Run) -> Result<bool> {
        let processes = self
            .store
            .processes_for_run(run.id, Some(Operation::Classify))
            .await?;
        Ok(!processes.is_empty() && processes.iter().all(Process::is_complete))
    }

    /// Whether every live page is classified (by inference or cache) for
    /// every category, or has a completed `Classify` process.
    pub async fn pages_classified(&self, run: &Run, plan: &ExtractionPlan) -> Result<bool> {
        let keys: Vec<String> = plan.categories().into_iter().map(|(k, _)| k).collect();
        let pages = self.store.children(run.output_artifact_id).await?;
        let processes = self
            .store
            .processes_for_run(run.id, Some(Operation::Classify))
            .await?;

        Ok(pages.iter().all(|page| {
            page.meta.is_classified_for(keys.iter().map(String::as_str))
                || processes
                    .iter()
                    .any(|p| p.is_complete() && p.input_artifact_ids.contains(&page.id))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use crate::testing::{sample_plan, seed_run, MockInference};
    use crate::traits::store::{ArtifactStore, ClassificationCache, ProcessStore};

    #[test]
    fn test_boolean_schema_requires_every_category() {
        let plan = sample_plan();
        let schema = build_boolean_schema(&plan);

        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(required, ["provider_identity", "contact", "diagnosis_identity"]);
        assert_eq!(schema["properties"]["contact"]["type"], "boolean");
        assert_eq!(schema["properties"]["diagnosis_identity"]["description"], "");
    }

    #[test]
    fn test_schema_hash_is_stable() {
        let plan = sample_plan();
        let a = schema_hash(&plan);
        assert_eq!(a.len(), 64);
        assert_eq!(a, schema_hash(&plan));

        let mut changed = plan.clone();
        changed.levels[0].remaining[0].description = Some("different".to_string());
        assert_ne!(a, schema_hash(&changed));
    }

    #[test]
    fn test_missing_keys_default_to_false() {
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let result = read_classification(&keys, &json!({"a": true, "b": "yes"}));
        assert_eq!(result["a"], true);
        assert_eq!(result["b"], true);
        assert_eq!(result["c"], false);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_inference_on_second_run() {
        let store = MemoryStore::new();
        let plan = sample_plan();
        let (task, run) = seed_run(&store, json!({"type": "object"}), &["page one", "page two"]).await;

        let inference = MockInference::new();
        let engine = ClassificationEngine::new(&store, &inference, &task.runner_config);
        let first = engine.classify(&run, &plan).await.unwrap();
        assert_eq!(first.classified, 2);
        assert!(engine.is_classification_complete(&run).await.unwrap());

        // Same source files under a new run: served from the cache.
        let pages = store.children(run.output_artifact_id).await.unwrap();
        let (_, second_run) = seed_run(&store, json!({"type": "object"}), &[]).await;
        for page in &pages {
            let mut copy = Artifact::new(page.team_id, page.name.clone())
                .with_parent(second_run.output_artifact_id)
                .with_text(page.text_content.clone().unwrap_or_default());
            copy.source_file_id = page.source_file_id;
            store.save_artifact(&copy).await.unwrap();
        }

        let second = engine.classify(&second_run, &plan).await.unwrap();
        assert_eq!(second.cache_hits, 2);
        assert_eq!(inference.calls_for(Operation::Classify), 2);
        assert!(store
            .processes_for_run(second_run.id, Some(Operation::Classify))
            .await
            .unwrap()
            .is_empty());
        assert!(engine.pages_classified(&second_run, &plan).await.unwrap());
        assert!(!engine.is_classification_complete(&second_run).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_is_per_schema_and_overwrites() {
        let store = MemoryStore::new();
        let plan = sample_plan();
        let (task, run) = seed_run(&store, json!({"type": "object"}), &["page"]).await;
        let page = store.children(run.output_artifact_id).await.unwrap().remove(0);
        let file_id = page.source_file_id.unwrap();

        let inference = MockInference::new()
            .with_response(Operation::Classify, json!({"provider_identity": true, "contact": false}));
        ClassificationEngine::new(&store, &inference, &task.runner_config)
            .classify(&run, &plan)
            .await
            .unwrap();

        let hash = schema_hash(&plan);
        let cached = store.get_classification(file_id, &hash).await.unwrap().unwrap();
        assert!(cached.result["provider_identity"]);
        assert!(!cached.result["diagnosis_identity"]);
        assert!(store.get_classification(file_id, "other-hash").await.unwrap().is_none());

        let mut replaced = cached.clone();
        replaced.result.insert("contact".to_string(), true);
        store.store_classification(file_id, &replaced).await.unwrap();
        let reread = store.get_classification(file_id, &hash).await.unwrap().unwrap();
        assert!(reread.result["contact"]);

        let live = store.require_artifact(page.id).await.unwrap();
        assert!(live.meta.in_category("provider_identity"));
        assert!(!live.meta.in_category("contact"));
    }

    #[tokio::test]
    async fn test_failed_process_is_retried() {
        let store = MemoryStore::new();
        let plan = sample_plan();
        let (task, run) = seed_run(&store, json!({"type": "object"}), &["page"]).await;

        let inference = MockInference::new().with_failure(Operation::Classify, "timed out");
        let engine = ClassificationEngine::new(&store, &inference, &task.runner_config);

        let first = engine.classify(&run, &plan).await.unwrap();
        assert_eq!(first.failed, 1);
        assert!(!engine.is_classification_complete(&run).await.unwrap());

        let second = engine.classify(&run, &plan).await.unwrap();
        assert_eq!(second.classified, 1);

        let processes = store
            .processes_for_run(run.id, Some(Operation::Classify))
            .await
            .unwrap();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].attempts, 2);
        assert!(engine.is_classification_complete(&run).await.unwrap());
    }
}
