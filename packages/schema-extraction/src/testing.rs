//! Testing utilities including mock implementations.
//!
//! These are useful for testing applications that use the extraction library
//! without making real inference calls.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::Result;
use crate::pipeline::fragment::from_node;
use crate::pipeline::hierarchy::extract_hierarchy;
use crate::traits::inference::{InferenceRequest, InferenceResponse, InferenceService};
use crate::traits::store::{ArtifactStore, RunStore, TaskStore};
use crate::types::{
    artifact::{Artifact, SourceFile},
    config::SearchMode,
    plan::{ExtractionPlan, IdentityGroup, LevelPlan, RemainingGroup},
    process::Operation,
    run::{Run, TaskDefinition},
};

type Handler = dyn Fn(&InferenceRequest) -> Option<InferenceResponse> + Send + Sync;

/// A scriptable mock inference service.
///
/// Responses are queued per operation and consumed in order. When a queue
/// is empty the optional handler is consulted. Unscripted `Classify` calls
/// answer `true` for every category; any other unscripted call fails softly.
#[derive(Clone, Default)]
pub struct MockInference {
    /// Queued responses by operation
    scripted: Arc<RwLock<HashMap<Operation, VecDeque<InferenceResponse>>>>,

    /// Fallback for unscripted calls
    handler: Option<Arc<Handler>>,

    /// Call tracking for assertions
    calls: Arc<RwLock<Vec<MockInferenceCall>>>,
}

/// Record of a call made to the mock.
#[derive(Debug, Clone)]
pub struct MockInferenceCall {
    pub operation: Operation,
    pub prompt: String,
    pub artifact_count: usize,
    pub artifact_ids: Vec<Uuid>,
}

impl MockInference {
    /// Create a mock with default behavior.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, operation: Operation, response: InferenceResponse) {
        self.scripted
            .write()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(response);
    }

    /// Queue a completed response for an operation.
    pub fn with_response(self, operation: Operation, json: Value) -> Self {
        self.push(operation, InferenceResponse::completed(json));
        self
    }

    /// Queue a soft failure for an operation.
    pub fn with_failure(self, operation: Operation, error: impl Into<String>) -> Self {
        self.push(operation, InferenceResponse::failed(error));
        self
    }

    /// Answer unscripted calls with a closure; `None` falls through to the
    /// defaults.
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&InferenceRequest) -> Option<InferenceResponse> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Get all calls made to this mock.
    pub fn calls(&self) -> Vec<MockInferenceCall> {
        self.calls.read().unwrap().clone()
    }

    /// Number of calls made for an operation.
    pub fn calls_for(&self, operation: Operation) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Clear call history.
    pub fn clear_calls(&self) {
        self.calls.write().unwrap().clear();
    }

    /// Every response-schema property set to `true`.
    fn all_categories(request: &InferenceRequest) -> InferenceResponse {
        let answer: Map<String, Value> = request
            .response_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().map(|k| (k.clone(), Value::Bool(true))).collect())
            .unwrap_or_default();
        InferenceResponse::completed(Value::Object(answer))
    }
}

#[async_trait]
impl InferenceService for MockInference {
    async fn submit(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        self.calls.write().unwrap().push(MockInferenceCall {
            operation: request.operation,
            prompt: request.prompt.clone(),
            artifact_count: request.artifacts.len(),
            artifact_ids: request.artifacts.iter().map(|a| a.id).collect(),
        });

        let queued = self
            .scripted
            .write()
            .unwrap()
            .get_mut(&request.operation)
            .and_then(|queue| queue.pop_front());
        if let Some(response) = queued {
            return Ok(response);
        }

        if let Some(response) = self.handler.as_ref().and_then(|h| h(&request)) {
            return Ok(response);
        }

        Ok(match request.operation {
            Operation::Classify => Self::all_categories(&request),
            operation => InferenceResponse::failed(format!("no scripted response for {}", operation)),
        })
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// A provider with contact fields and an array of diagnoses.
pub fn sample_schema() -> Value {
    json!({
        "name": "Provider",
        "type": "object",
        "properties": {
            "name": {"type": "string", "description": "Full name of the provider"},
            "phone": {"type": "string"},
            "email": {"type": "string"},
            "diagnoses": {
                "type": "array",
                "items": {
                    "title": "Diagnosis",
                    "type": "object",
                    "properties": {
                        "code": {"type": "string", "description": "ICD-10 code"},
                        "diagnosed_on": {"type": "string", "format": "date"}
                    }
                }
            }
        }
    })
}

fn strings(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

/// The plan a well-behaved model would produce for [`sample_schema`].
///
/// Categories, in order: `provider_identity`, `contact`,
/// `diagnosis_identity`.
pub fn sample_plan() -> ExtractionPlan {
    let nodes = extract_hierarchy(&sample_schema(), "Provider");
    let (provider, diagnosis) = (&nodes[0], &nodes[1]);

    let provider_identity = strings(&["name"]);
    let contact = strings(&["phone", "email"]);
    let diagnosis_identity = strings(&["code", "diagnosed_on"]);

    ExtractionPlan {
        levels: vec![
            LevelPlan {
                level: 0,
                identities: vec![IdentityGroup {
                    name: "Provider Identity".to_string(),
                    key: "provider_identity".to_string(),
                    object_type: "Provider".to_string(),
                    parent_type: None,
                    is_array: false,
                    fragment_selector: from_node(provider, &nodes, &provider_identity),
                    identity_fields: provider_identity,
                    skim_fields: Vec::new(),
                    description: Some("Pages naming a provider".to_string()),
                }],
                remaining: vec![RemainingGroup {
                    name: "Contact".to_string(),
                    key: "contact".to_string(),
                    object_type: "Provider".to_string(),
                    fragment_selector: from_node(provider, &nodes, &contact),
                    fields: contact,
                    search_mode: SearchMode::Skim,
                    description: Some("Phone numbers and email addresses".to_string()),
                }],
            },
            LevelPlan {
                level: 1,
                identities: vec![IdentityGroup {
                    name: "Diagnosis Identity".to_string(),
                    key: "diagnosis_identity".to_string(),
                    object_type: "Diagnosis".to_string(),
                    parent_type: Some("Provider".to_string()),
                    is_array: true,
                    fragment_selector: from_node(diagnosis, &nodes, &diagnosis_identity),
                    identity_fields: diagnosis_identity,
                    skim_fields: Vec::new(),
                    description: None,
                }],
                remaining: Vec::new(),
            },
        ],
    }
}

/// Save a task, an output artifact with one page per text (each backed by
/// its own source file) and a run over them.
pub async fn seed_run<S>(store: &S, schema: Value, pages: &[&str]) -> (TaskDefinition, Run)
where
    S: TaskStore + RunStore + ArtifactStore + ?Sized,
{
    let team_id = Uuid::now_v7();
    let task = TaskDefinition::new(team_id, "Provider Directory", schema)
        .with_schema_definition(Uuid::now_v7());
    store.save_task(&task).await.unwrap();

    let output = Artifact::new(team_id, "Run Output");
    store.save_artifact(&output).await.unwrap();

    for (index, text) in pages.iter().enumerate() {
        let file = SourceFile::new(format!("page-{}.pdf", index + 1));
        store.save_source_file(&file).await.unwrap();

        let page = Artifact::new(team_id, format!("Page {}", index + 1))
            .with_parent(output.id)
            .with_source_file(file.id)
            .with_text(*text)
            .with_position(index as u32);
        store.save_artifact(&page).await.unwrap();
    }

    let run = Run::new(&task, output.id);
    store.save_run(&run).await.unwrap();
    (task, run)
}
