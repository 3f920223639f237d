//! Remaining-field extraction in skim or exhaustive mode.
//!
//! Exhaustive mode makes one call over every classified page. Skim mode
//! walks the pages in batches, asking for a confidence per field, and stops
//! as soon as every field reaches the configured threshold.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::pipeline::fragment::{get_nesting_keys, get_parent_type, leaf, leaf_field_keys};
use crate::pipeline::identity::nest_content;
use crate::pipeline::prompts::{format_extract_remaining_prompt, format_skim_remaining_prompt};
use crate::traits::inference::{submit_bounded, InferenceRequest, InferenceService};
use crate::traits::store::Store;
use crate::types::{
    artifact::{Artifact, Provenance},
    config::{RunnerConfig, SearchMode},
    object::{is_blank, ResolvedObject, OBJECT_ID_KEY},
    plan::RemainingGroup,
    process::{Operation, Process},
    run::Run,
    schema::SelectorType,
};

/// One skim batch answer.
#[derive(Debug, Deserialize)]
struct SkimAnswer {
    #[serde(default)]
    data: Map<String, Value>,

    #[serde(default)]
    confidence: Map<String, Value>,
}

/// Schema of the field map for a group.
pub fn remaining_response_schema(group: &RemainingGroup) -> Value {
    let (_, leaf_selector) = leaf(&group.fragment_selector);

    let mut properties = Map::new();
    for key in &group.fields {
        let mut property = match leaf_selector.children.get(key) {
            Some(child) if child.kind == SelectorType::Array => json!({"type": ["array", "null"], "items": {}}),
            Some(child) if child.kind == SelectorType::Object => json!({"type": ["object", "null"]}),
            Some(child) => json!({"type": [child.kind.as_str(), "null"]}),
            None => json!({"type": ["string", "null"]}),
        };
        if let Some(format) = leaf_selector.children.get(key).and_then(|c| c.format.clone()) {
            if let Some(obj) = property.as_object_mut() {
                obj.insert("format".to_string(), Value::String(format));
            }
        }
        properties.insert(key.clone(), property);
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": group.fields
    })
}

/// Schema of one skim answer: data plus a 1-5 confidence per field.
pub fn skim_response_schema(group: &RemainingGroup) -> Value {
    let mut confidence = Map::new();
    for key in &group.fields {
        confidence.insert(
            key.clone(),
            json!({"type": "integer", "minimum": 1, "maximum": 5}),
        );
    }

    json!({
        "type": "object",
        "properties": {
            "data": remaining_response_schema(group),
            "confidence": {
                "type": "object",
                "properties": confidence,
                "required": group.fields
            }
        },
        "required": ["data", "confidence"]
    })
}

/// Keep the group's own fields with non-blank values.
pub fn filter_fields(group: &RemainingGroup, data: &Map<String, Value>) -> Map<String, Value> {
    group
        .fields
        .iter()
        .filter_map(|key| {
            data.get(key)
                .filter(|v| !is_blank(Some(v)))
                .map(|v| (key.clone(), v.clone()))
        })
        .collect()
}

fn confidence_of(value: Option<&Value>) -> u8 {
    value
        .and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .map(|c| c.round().clamp(1.0, 5.0) as u8)
        .unwrap_or(1)
}

/// Extracts a group's remaining fields for one object.
pub struct FieldExtractionEngine<'a, S: ?Sized, I: ?Sized> {
    store: &'a S,
    inference: &'a I,
    config: &'a RunnerConfig,
}

impl<'a, S, I> FieldExtractionEngine<'a, S, I>
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

    /// The group's mode after the global override.
    pub fn mode(&self, group: &RemainingGroup) -> SearchMode {
        self.config.global_search_mode.resolve(group.search_mode)
    }

    /// Extract the group's fields; `None` when every call failed.
    pub async fn extract(
        &self,
        object: &ResolvedObject,
        group: &RemainingGroup,
        artifacts: &[Artifact],
    ) -> Option<Map<String, Value>> {
        let snapshot = Value::Object(object.snapshot());
        let raw = match self.mode(group) {
            SearchMode::Exhaustive => self.extract_exhaustive(&snapshot, group, artifacts).await,
            SearchMode::Skim => self.extract_skim(&snapshot, group, artifacts).await,
        }?;
        Some(filter_fields(group, &raw))
    }

    async fn extract_exhaustive(
        &self,
        snapshot: &Value,
        group: &RemainingGroup,
        artifacts: &[Artifact],
    ) -> Option<Map<String, Value>> {
        let request = InferenceRequest::new(
            Operation::ExtractRemaining,
            format_extract_remaining_prompt(&group.name, &group.object_type, snapshot, &group.fields),
            remaining_response_schema(group),
            self.config.timeout(),
        )
        .with_artifacts(artifacts.iter());

        match submit_bounded(self.inference, request).await.into_json()? {
            Value::Object(map) => Some(map),
            other => {
                warn!(group = %group.name, response = %other, "Exhaustive extraction returned a non-object");
                None
            }
        }
    }

    async fn extract_skim(
        &self,
        snapshot: &Value,
        group: &RemainingGroup,
        artifacts: &[Artifact],
    ) -> Option<Map<String, Value>> {
        if artifacts.is_empty() {
            return Some(Map::new());
        }

        let mut target_fields = leaf_field_keys(&group.fragment_selector);
        if target_fields.is_empty() {
            target_fields = group.fields.clone();
        }
        let threshold = self.config.confidence_threshold;
        let batch_size = self.config.skim_batch_size.max(1);

        let mut merged = Map::new();
        let mut best: HashMap<String, u8> = HashMap::new();
        let mut succeeded = false;

        for (index, batch) in artifacts.chunks(batch_size).enumerate() {
            let request = InferenceRequest::new(
                Operation::ExtractRemaining,
                format_skim_remaining_prompt(&group.name, &group.object_type, snapshot, &group.fields),
                skim_response_schema(group),
                self.config.timeout(),
            )
            .with_artifacts(batch.iter());

            let Some(json) = submit_bounded(self.inference, request).await.into_json() else {
                debug!(batch = index, "Skim batch failed, skipping");
                continue;
            };
            let answer: SkimAnswer = match serde_json::from_value(json) {
                Ok(answer) => answer,
                Err(e) => {
                    warn!(batch = index, error = %e, "Unparseable skim answer");
                    continue;
                }
            };
            succeeded = true;

            for (field, value) in answer.data {
                if is_blank(Some(&value)) {
                    continue;
                }
                let confidence = confidence_of(answer.confidence.get(&field));
                let current = best.get(&field).copied().unwrap_or(0);
                if confidence >= current {
                    merged.insert(field.clone(), value);
                    best.insert(field, confidence);
                }
            }

            let confident = target_fields
                .iter()
                .all(|f| best.get(f).is_some_and(|c| *c >= threshold));
            if confident {
                debug!(batches = index + 1, total = artifacts.len(), "Skim reached confidence threshold");
                break;
            }
        }

        succeeded.then_some(merged)
    }

    /// Run one `Extract Remaining` process against its target object.
    #[instrument(skip(self, run, process, group), fields(run_id = %run.id, process_id = %process.id, group = %group.name))]
    pub async fn run_process(
        &self,
        run: &Run,
        process: &mut Process,
        group: &RemainingGroup,
        level: u32,
    ) -> Result<Option<ResolvedObject>> {
        let object_id = process
            .meta
            .object_id
            .ok_or_else(|| crate::error::ExtractionError::not_found("process target object", process.id))?;
        let mut object = self.store.require_object(object_id).await?;
        let artifacts = self.store.get_artifacts(&process.input_artifact_ids).await?;

        process.start();
        let mode = self.mode(group);

        let Some(fields) = self.extract(&object, group, &artifacts).await else {
            process.fail("every extraction call failed");
            self.store.save_process(process).await?;
            return Ok(None);
        };

        if fields.is_empty() {
            debug!(object_id = %object.id, "Nothing extracted");
            process.complete();
            self.store.save_process(process).await?;
            return Ok(None);
        }

        object.apply_fields(&fields);
        self.store.save_object(&object).await?;

        let (leaf_key, leaf_selector) = leaf(&group.fragment_selector);
        let is_array = leaf_selector.kind == SelectorType::Array;

        let mut content = fields.clone();
        content.insert(OBJECT_ID_KEY.to_string(), Value::String(object.id.to_string()));
        let json_content = nest_content(
            &get_nesting_keys(&group.fragment_selector),
            Value::Object(content),
            is_array,
        );

        let mut artifact = Artifact::new(run.team_id, format!("{} {}", group.object_type, group.name))
            .with_json(json_content);
        if let Some(source) = artifacts.first() {
            artifact = artifact.with_parent(source.id);
            artifact.source_file_id = source.source_file_id;
        } else {
            artifact = artifact.with_parent(run.output_artifact_id);
        }
        artifact.meta.provenance = Some(Provenance {
            operation: Operation::ExtractRemaining,
            process_id: process.id,
            object_id: object.id,
            object_type: object.object_type.clone(),
            parent_id: object.root_object_id,
            parent_type: get_parent_type(&group.fragment_selector),
            relationship_key: leaf_key,
            is_array_type: is_array,
            level,
            identity_group: None,
            extraction_group: Some(group.name.clone()),
            search_mode: Some(mode),
            search_query: None,
            was_existing: None,
            match_id: None,
        });
        self.store.save_artifact(&artifact).await?;

        process.output_artifact_ids.push(artifact.id);
        process.complete();
        self.store.save_process(process).await?;

        info!(object_id = %object.id, fields = fields.len(), mode = ?mode, "Remaining fields extracted");
        Ok(Some(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use crate::testing::{sample_plan, sample_schema, seed_run, MockInference};
    use crate::traits::store::{ArtifactStore, ObjectStore};
    use crate::types::config::GlobalSearchMode;
    use uuid::Uuid;

    fn contact_group() -> RemainingGroup {
        sample_plan().levels[0].remaining[0].clone()
    }

    fn pages(n: usize) -> Vec<Artifact> {
        let team_id = Uuid::now_v7();
        (0..n)
            .map(|i| Artifact::new(team_id, format!("page {i}")).with_text(format!("content {i}")))
            .collect()
    }

    fn provider() -> ResolvedObject {
        ResolvedObject::new(Uuid::now_v7(), "Provider").with_name("Dr. Smith")
    }

    #[tokio::test]
    async fn test_skim_stops_once_every_field_is_confident() {
        let inference = MockInference::new()
            .with_response(
                Operation::ExtractRemaining,
                json!({"data": {"phone": "555-0100", "email": "a@b.c"}, "confidence": {"phone": 5, "email": 4}}),
            )
            .with_response(
                Operation::ExtractRemaining,
                json!({"data": {"phone": "555-9999"}, "confidence": {"phone": 5}}),
            );
        let store = MemoryStore::new();
        let config = RunnerConfig::default().with_skim_batch_size(1);
        let engine = FieldExtractionEngine::new(&store, &inference, &config);

        let fields = engine.extract(&provider(), &contact_group(), &pages(3)).await.unwrap();
        assert_eq!(fields["phone"], "555-0100");
        assert_eq!(inference.calls_for(Operation::ExtractRemaining), 1);
    }

    #[tokio::test]
    async fn test_skim_equal_or_higher_confidence_overrides() {
        let inference = MockInference::new()
            .with_response(
                Operation::ExtractRemaining,
                json!({"data": {"phone": "first", "email": "keep@x.y"}, "confidence": {"phone": 2, "email": 3}}),
            )
            .with_failure(Operation::ExtractRemaining, "timed out")
            .with_response(
                Operation::ExtractRemaining,
                json!({"data": {"phone": "second", "email": "lower@x.y"}, "confidence": {"phone": 2, "email": 1}}),
            );
        let store = MemoryStore::new();
        let config = RunnerConfig::default().with_skim_batch_size(2);
        let engine = FieldExtractionEngine::new(&store, &inference, &config);

        let fields = engine.extract(&provider(), &contact_group(), &pages(6)).await.unwrap();
        assert_eq!(fields["phone"], "second");
        assert_eq!(fields["email"], "keep@x.y");
        assert_eq!(inference.calls_for(Operation::ExtractRemaining), 3);
    }

    #[tokio::test]
    async fn test_skim_with_every_batch_failing_is_soft_failure() {
        let inference = MockInference::new()
            .with_failure(Operation::ExtractRemaining, "timed out")
            .with_failure(Operation::ExtractRemaining, "timed out");
        let store = MemoryStore::new();
        let config = RunnerConfig::default().with_skim_batch_size(1);
        let engine = FieldExtractionEngine::new(&store, &inference, &config);

        assert!(engine.extract(&provider(), &contact_group(), &pages(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_global_override_forces_single_exhaustive_call() {
        let inference = MockInference::new().with_response(
            Operation::ExtractRemaining,
            json!({"phone": "555-0100", "email": "", "fax": "not in group"}),
        );
        let store = MemoryStore::new();
        let config = RunnerConfig::default()
            .with_skim_batch_size(1)
            .with_global_search_mode(GlobalSearchMode::ExhaustiveOnly);
        let engine = FieldExtractionEngine::new(&store, &inference, &config);

        let fields = engine.extract(&provider(), &contact_group(), &pages(4)).await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["phone"], "555-0100");

        let calls = inference.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].artifact_count, 4);
    }

    #[tokio::test]
    async fn test_run_process_updates_object_and_writes_provenance() {
        let store = MemoryStore::new();
        let (task, run) = seed_run(&store, sample_schema(), &["page"]).await;
        let page = store.children(run.output_artifact_id).await.unwrap().remove(0);

        let parent_id = Uuid::now_v7();
        let object = provider().with_root_object(Some(parent_id));
        store.save_object(&object).await.unwrap();

        let inference = MockInference::new().with_response(
            Operation::ExtractRemaining,
            json!({"data": {"phone": "555-0100"}, "confidence": {"phone": 5}}),
        );
        let engine = FieldExtractionEngine::new(&store, &inference, &task.runner_config);
        let mut process = Process::new(run.id, Operation::ExtractRemaining).with_inputs([page.id]);
        process.meta.object_id = Some(object.id);

        let updated = engine
            .run_process(&run, &mut process, &contact_group(), 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.field("phone"), Some(json!("555-0100")));
        assert!(process.is_complete());

        let artifact = store.require_artifact(process.output_artifact_ids[0]).await.unwrap();
        assert_eq!(artifact.parent_artifact_id, Some(page.id));
        assert_eq!(artifact.json_content.unwrap()["provider"]["phone"], "555-0100");
        let provenance = artifact.meta.provenance.unwrap();
        assert_eq!(provenance.parent_id, Some(parent_id));
        assert_eq!(provenance.extraction_group.as_deref(), Some("Contact"));
        assert_eq!(provenance.search_mode, Some(SearchMode::Skim));
    }

    #[tokio::test]
    async fn test_empty_result_writes_nothing() {
        let store = MemoryStore::new();
        let (task, run) = seed_run(&store, sample_schema(), &["page"]).await;
        let page = store.children(run.output_artifact_id).await.unwrap().remove(0);
        let object = provider();
        store.save_object(&object).await.unwrap();

        let inference = MockInference::new().with_response(
            Operation::ExtractRemaining,
            json!({"data": {}, "confidence": {}}),
        );
        let engine = FieldExtractionEngine::new(&store, &inference, &task.runner_config);
        let mut process = Process::new(run.id, Operation::ExtractRemaining).with_inputs([page.id]);
        process.meta.object_id = Some(object.id);

        assert!(engine
            .run_process(&run, &mut process, &contact_group(), 0)
            .await
            .unwrap()
            .is_none());
        assert!(process.is_complete());
        assert!(process.output_artifact_ids.is_empty());
        assert_eq!(store.children(page.id).await.unwrap().len(), 0);
    }
}
