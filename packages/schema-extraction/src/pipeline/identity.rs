//! Identity extraction and object resolution.
//!
//! One `Extract Identity` process covers one identity group over the pages
//! classified for it. Every extracted instance is matched against existing
//! objects and either reused or created, then recorded on the run and on
//! the input pages so the next level can find its parent.

use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::naming::to_snake_case;
use crate::pipeline::fragment::{get_nesting_keys, get_parent_type, leaf};
use crate::pipeline::matcher::{DuplicateMatcher, MatchScope};
use crate::pipeline::prompts::format_extract_identity_prompt;
use crate::traits::inference::{submit_bounded, InferenceRequest, InferenceService};
use crate::traits::store::Store;
use crate::types::{
    artifact::{Artifact, Provenance},
    object::{is_blank, ResolvedObject},
    plan::IdentityGroup,
    process::{Operation, Process},
    run::{Run, TaskDefinition},
    schema::{FragmentSelector, SelectorType},
};

/// Property holding the model's candidate search queries.
pub const SEARCH_QUERY_KEY: &str = "_search_query";

/// Key under which a group's instances appear in the response.
pub fn relationship_key(group: &IdentityGroup) -> String {
    leaf(&group.fragment_selector)
        .0
        .unwrap_or_else(|| to_snake_case(&group.object_type))
}

fn leaf_property_schema(selector: &FragmentSelector) -> Value {
    let mut schema = match selector.kind {
        SelectorType::Array => json!({"type": ["array", "null"], "items": {}}),
        SelectorType::Object => json!({"type": ["object", "null"]}),
        kind => json!({"type": [kind.as_str(), "null"]}),
    };
    if let (Some(format), Some(obj)) = (&selector.format, schema.as_object_mut()) {
        obj.insert("format".to_string(), Value::String(format.clone()));
    }
    schema
}

/// Response schema: the selector flattened to its leaf, each instance
/// carrying a `_search_query`.
pub fn identity_response_schema(group: &IdentityGroup) -> Value {
    let (_, leaf_selector) = leaf(&group.fragment_selector);
    let is_array = leaf_selector.kind == SelectorType::Array;

    let mut properties = Map::new();
    for (key, child) in &leaf_selector.children {
        if !child.is_nested() {
            properties.insert(key.clone(), leaf_property_schema(child));
        }
    }

    let query = json!({
        "type": "object",
        "description": "Field key to value, LIKE pattern, or keyword array",
        "additionalProperties": true
    });
    let search_query = if is_array {
        json!({"type": "array", "items": query})
    } else {
        query
    };
    properties.insert(SEARCH_QUERY_KEY.to_string(), search_query);

    let instance = json!({
        "type": "object",
        "properties": properties,
        "required": properties.keys().collect::<Vec<_>>()
    });
    let container = if is_array {
        json!({"type": "array", "items": instance})
    } else {
        json!({"anyOf": [instance, {"type": "null"}]})
    };

    let key = relationship_key(group);
    let mut root_properties = Map::new();
    root_properties.insert(key.clone(), container);
    json!({
        "type": "object",
        "properties": root_properties,
        "required": [key]
    })
}

/// Instances in a response: under the relationship key, under the full
/// nesting path, or the response itself.
pub fn extract_instances(json: &Value, key: &str, nesting_keys: &[String]) -> Vec<Map<String, Value>> {
    fn as_instances(value: &Value) -> Vec<Map<String, Value>> {
        match value {
            Value::Array(items) => items.iter().filter_map(|i| i.as_object().cloned()).collect(),
            Value::Object(obj) => vec![obj.clone()],
            _ => Vec::new(),
        }
    }

    if let Some(value) = json.get(key) {
        return as_instances(value);
    }

    let mut current = json;
    for nesting_key in nesting_keys {
        let next = match current.get(nesting_key) {
            Some(Value::Array(items)) if nesting_key != key => items.first(),
            other => other,
        };
        match next {
            Some(value) => current = value,
            None => return as_instances(json),
        }
    }
    as_instances(current)
}

/// Wrap a snapshot under its nesting keys: `{"provider": {"diagnoses": [..]}}`.
pub(crate) fn nest_content(nesting_keys: &[String], snapshot: Value, is_array: bool) -> Value {
    let mut content = if is_array {
        Value::Array(vec![snapshot])
    } else {
        snapshot
    };
    for key in nesting_keys.iter().rev() {
        let mut wrapper = Map::new();
        wrapper.insert(key.clone(), content);
        content = Value::Object(wrapper);
    }
    content
}

/// Extracts identities for one group and resolves them to objects.
pub struct IdentityResolutionEngine<'a, S: ?Sized, I: ?Sized> {
    store: &'a S,
    inference: &'a I,
    task: &'a TaskDefinition,
}

impl<'a, S, I> IdentityResolutionEngine<'a, S, I>
where
    S: Store + ?Sized,
    I: InferenceService + ?Sized,
{
    pub fn new(store: &'a S, inference: &'a I, task: &'a TaskDefinition) -> Self {
        Self {
            store,
            inference,
            task,
        }
    }

    /// Parent object id recorded on the input pages.
    fn parent_id(&self, group: &IdentityGroup, inputs: &[Artifact]) -> Option<(String, Uuid)> {
        let parent_type = group
            .parent_type
            .clone()
            .or_else(|| get_parent_type(&group.fragment_selector))?;
        inputs
            .iter()
            .find_map(|a| a.meta.resolved_objects.get(&parent_type).copied())
            .map(|id| (parent_type, id))
    }

    /// Run one `Extract Identity` process.
    ///
    /// Returns the last resolved object, or `None` when nothing was
    /// extracted or the inference call failed.
    ///
    /// Each input page keeps one object id per type in
    /// `meta.resolved_objects`. When a page yields several instances of an
    /// array type, the last one is recorded, so next-level children on that
    /// page all attach to it. Deliberate: the page map holds a single
    /// parent id per type.
    #[instrument(skip(self, run, process, group), fields(run_id = %run.id, process_id = %process.id, group = %group.name))]
    pub async fn run_process(
        &self,
        run: &mut Run,
        process: &mut Process,
        group: &IdentityGroup,
        level: u32,
    ) -> Result<Option<ResolvedObject>> {
        let inputs = self.store.get_artifacts(&process.input_artifact_ids).await?;
        if inputs.is_empty() {
            let error = ValidationError::NoInputArtifacts {
                process_id: process.id,
            };
            process.fail(error.to_string());
            self.store.save_process(process).await?;
            return Err(error.into());
        }
        let parent = self.parent_id(group, &inputs);
        let parent_id = parent.as_ref().map(|(_, id)| *id);

        let parent_snapshot = match parent_id {
            Some(id) => self
                .store
                .get_object(id)
                .await?
                .map(|o| Value::Object(o.snapshot())),
            None => None,
        };
        let parent_prompt = parent
            .as_ref()
            .zip(parent_snapshot.as_ref())
            .map(|((parent_type, _), snapshot)| (parent_type.as_str(), snapshot));

        process.start();
        let key = relationship_key(group);
        let request = InferenceRequest::new(
            Operation::ExtractIdentity,
            format_extract_identity_prompt(&group.object_type, &group.identity_fields, parent_prompt, group.is_array),
            identity_response_schema(group),
            self.task.runner_config.timeout(),
        )
        .with_artifacts(inputs.iter());

        let response = submit_bounded(self.inference, request).await;
        let failure = response.failure_message();
        let Some(json) = response.into_json() else {
            process.fail(failure);
            self.store.save_process(process).await?;
            return Ok(None);
        };

        let nesting_keys = get_nesting_keys(&group.fragment_selector);
        let instances = extract_instances(&json, &key, &nesting_keys);
        let matcher = DuplicateMatcher::new(
            self.store,
            self.inference,
            &self.task.runner_config,
            &self.task.schema,
        );

        let mut last = None;
        for instance in instances {
            let data: Map<String, Value> = group
                .identity_fields
                .iter()
                .filter_map(|f| instance.get(f).filter(|v| !v.is_null()).map(|v| (f.clone(), v.clone())))
                .collect();
            if group.identity_fields.iter().all(|f| is_blank(data.get(f))) {
                debug!("Skipping instance with blank identity fields");
                continue;
            }

            let search_query = instance.get(SEARCH_QUERY_KEY).cloned();
            let queries: Vec<Value> = match &search_query {
                Some(Value::Array(items)) => items.clone(),
                Some(query @ Value::Object(_)) => vec![query.clone()],
                _ => Vec::new(),
            };

            let scope = MatchScope {
                team_id: run.team_id,
                object_type: group.object_type.clone(),
                root_object_id: parent_id,
                schema_definition_id: self.task.schema_definition_id,
            };
            let candidates = matcher
                .find_candidates(&scope, &queries, Some(&data), &group.identity_fields)
                .await?;

            let mut match_id = candidates.exact_match_id;
            if match_id.is_none() && candidates.candidates.len() > 1 {
                if let Some(result) = matcher
                    .resolve_duplicate(&group.object_type, &candidates.candidates, &data)
                    .await?
                {
                    debug!(is_duplicate = result.is_duplicate, confidence = result.confidence, "Duplicate resolved");
                    if result.is_duplicate {
                        match_id = result.existing_object_id;
                    }
                }
            }

            let existing = match match_id {
                Some(id) => self.store.get_object(id).await?,
                None => None,
            };
            let was_existing = existing.is_some();
            let object = match existing {
                Some(object) => object,
                None => {
                    let mut object = ResolvedObject::new(run.team_id, group.object_type.clone())
                        .with_root_object(parent_id)
                        .with_schema_definition(self.task.schema_definition_id);
                    object.apply_fields(&data);
                    self.store.save_object(&object).await?;
                    object
                }
            };

            run.record_resolved(&group.object_type, level, object.id);
            for input in &inputs {
                let mut live = self.store.require_artifact(input.id).await?;
                live.meta
                    .resolved_objects
                    .insert(group.object_type.clone(), object.id);
                self.store.save_artifact(&live).await?;
            }

            let source = &inputs[0];
            let mut artifact = Artifact::new(run.team_id, format!("{} Identity", group.object_type))
                .with_parent(source.id)
                .with_json(nest_content(&nesting_keys, Value::Object(object.snapshot()), group.is_array));
            artifact.source_file_id = source.source_file_id;
            artifact.meta.provenance = Some(Provenance {
                operation: Operation::ExtractIdentity,
                process_id: process.id,
                object_id: object.id,
                object_type: group.object_type.clone(),
                parent_id,
                parent_type: parent.as_ref().map(|(t, _)| t.clone()),
                relationship_key: Some(key.clone()),
                is_array_type: group.is_array,
                level,
                identity_group: Some(group.name.clone()),
                extraction_group: None,
                search_mode: None,
                search_query,
                was_existing: Some(was_existing),
                match_id: if was_existing { Some(object.id) } else { None },
            });
            self.store.save_artifact(&artifact).await?;
            process.output_artifact_ids.push(artifact.id);

            info!(object_id = %object.id, object_type = %group.object_type, was_existing, "Identity resolved");
            last = Some(object);
        }

        if last.is_none() {
            warn!(group = %group.name, "No identities extracted");
        }

        process.complete();
        self.store.save_process(process).await?;
        self.store.save_run(run).await?;
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use crate::testing::{sample_plan, seed_run, MockInference};
    use crate::traits::store::{ArtifactStore, ObjectStore, ProcessStore, RunStore};

    fn diagnosis_group() -> IdentityGroup {
        sample_plan().levels[1].identities[0].clone()
    }

    fn provider_group() -> IdentityGroup {
        sample_plan().levels[0].identities[0].clone()
    }

    #[test]
    fn test_response_schema_embeds_search_query() {
        let schema = identity_response_schema(&diagnosis_group());
        let items = &schema["properties"]["diagnoses"]["items"];
        assert_eq!(items["properties"][SEARCH_QUERY_KEY]["type"], "array");
        assert!(items["properties"]["code"].is_object());

        let single = identity_response_schema(&provider_group());
        let instance = &single["properties"]["provider"]["anyOf"][0];
        assert_eq!(instance["properties"][SEARCH_QUERY_KEY]["type"], "object");
    }

    #[test]
    fn test_extract_instances_accepts_leaf_or_nested_shapes() {
        let keys = vec!["provider".to_string(), "diagnoses".to_string()];

        let flat = json!({"diagnoses": [{"code": "A"}, {"code": "B"}]});
        assert_eq!(extract_instances(&flat, "diagnoses", &keys).len(), 2);

        let nested = json!({"provider": {"diagnoses": [{"code": "A"}]}});
        assert_eq!(extract_instances(&nested, "diagnoses", &keys).len(), 1);

        let single = json!({"provider": {"name": "Dr. Smith"}});
        assert_eq!(extract_instances(&single, "provider", &["provider".to_string()])[0]["name"], "Dr. Smith");
    }

    #[test]
    fn test_nest_content_wraps_arrays() {
        let keys = vec!["provider".to_string(), "diagnoses".to_string()];
        let content = nest_content(&keys, json!({"code": "A"}), true);
        assert_eq!(content, json!({"provider": {"diagnoses": [{"code": "A"}]}}));
    }

    #[tokio::test]
    async fn test_requires_input_artifacts() {
        let store = MemoryStore::new();
        let (task, mut run) = seed_run(&store, json!({"type": "object"}), &[]).await;
        let mut process = Process::new(run.id, Operation::ExtractIdentity);

        let inference = MockInference::new();
        let engine = IdentityResolutionEngine::new(&store, &inference, &task);
        let err = engine
            .run_process(&mut run, &mut process, &provider_group(), 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has no input artifacts"));
    }

    #[tokio::test]
    async fn test_creates_objects_and_links_parent() {
        let store = MemoryStore::new();
        let (task, mut run) = seed_run(&store, json!({"type": "object"}), &["Dr. Smith treats asthma"]).await;
        let page = store.children(run.output_artifact_id).await.unwrap().remove(0);

        let inference = MockInference::new()
            .with_response(
                Operation::ExtractIdentity,
                json!({"provider": {"name": "Dr. Smith", "_search_query": {"name": "%Smith%"}}}),
            )
            .with_response(
                Operation::ExtractIdentity,
                json!({"diagnoses": [
                    {"code": "J45", "_search_query": [{"code": "J45"}]},
                    {"code": null, "_search_query": []}
                ]}),
            );
        let engine = IdentityResolutionEngine::new(&store, &inference, &task);

        let mut provider_process = Process::new(run.id, Operation::ExtractIdentity).with_inputs([page.id]);
        let provider = engine
            .run_process(&mut run, &mut provider_process, &provider_group(), 0)
            .await
            .unwrap()
            .unwrap();
        assert!(provider_process.is_complete());

        let mut diagnosis_process = Process::new(run.id, Operation::ExtractIdentity).with_inputs([page.id]);
        let diagnosis = engine
            .run_process(&mut run, &mut diagnosis_process, &diagnosis_group(), 1)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(diagnosis.root_object_id, Some(provider.id));
        assert_eq!(diagnosis.field("code"), Some(json!("J45")));
        assert_eq!(diagnosis_process.output_artifact_ids.len(), 1);

        let saved_run = store.require_run(run.id).await.unwrap();
        assert_eq!(saved_run.resolved_at("Diagnosis", 1), &[diagnosis.id]);

        let live_page = store.require_artifact(page.id).await.unwrap();
        assert_eq!(live_page.meta.resolved_objects["Provider"], provider.id);

        let artifact = store
            .require_artifact(diagnosis_process.output_artifact_ids[0])
            .await
            .unwrap();
        assert_eq!(artifact.parent_artifact_id, Some(page.id));
        let provenance = artifact.meta.provenance.unwrap();
        assert_eq!(provenance.parent_id, Some(provider.id));
        assert_eq!(provenance.relationship_key.as_deref(), Some("diagnoses"));
        assert!(provenance.is_array_type);
        assert_eq!(provenance.was_existing, Some(false));
    }

    #[tokio::test]
    async fn test_reuses_exact_name_match() {
        let store = MemoryStore::new();
        let (task, mut run) = seed_run(&store, json!({"type": "object"}), &["page"]).await;
        let page = store.children(run.output_artifact_id).await.unwrap().remove(0);

        let existing = ResolvedObject::new(run.team_id, "Provider").with_name("Dr. Smith");
        store.save_object(&existing).await.unwrap();

        let inference = MockInference::new().with_response(
            Operation::ExtractIdentity,
            json!({"provider": {"name": "dr. smith", "_search_query": {}}}),
        );
        let engine = IdentityResolutionEngine::new(&store, &inference, &task);
        let mut process = Process::new(run.id, Operation::ExtractIdentity).with_inputs([page.id]);
        let resolved = engine
            .run_process(&mut run, &mut process, &provider_group(), 0)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.id, existing.id);
        let artifact = store.require_artifact(process.output_artifact_ids[0]).await.unwrap();
        let provenance = artifact.meta.provenance.unwrap();
        assert_eq!(provenance.was_existing, Some(true));
        assert_eq!(provenance.match_id, Some(existing.id));
    }

    #[tokio::test]
    async fn test_soft_failure_leaves_process_incomplete() {
        let store = MemoryStore::new();
        let (task, mut run) = seed_run(&store, json!({"type": "object"}), &["page"]).await;
        let page = store.children(run.output_artifact_id).await.unwrap().remove(0);

        let inference = MockInference::new().with_failure(Operation::ExtractIdentity, "timed out");
        let engine = IdentityResolutionEngine::new(&store, &inference, &task);
        let mut process = Process::new(run.id, Operation::ExtractIdentity).with_inputs([page.id]);

        let result = engine
            .run_process(&mut run, &mut process, &provider_group(), 0)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(!process.is_complete());
        assert_eq!(process.error.as_deref(), Some("timed out"));

        let saved = store.get_process(process.id).await.unwrap().unwrap();
        assert!(!saved.is_complete());
    }
}
