//! Integration tests for the full extraction loop.
//!
//! These tests verify the whole workflow over a two-page document:
//! 1. Plan identity and remaining groups
//! 2. Classify pages
//! 3. Resolve providers, then their diagnoses, de-duplicating across pages
//! 4. Fill remaining fields
//! 5. Roll up into a nested graph

use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use schema_extraction::{
    testing::{sample_schema, seed_run},
    ArtifactStore, InferenceRequest, InferenceResponse, MemoryStore, MockInference, Operation,
    Orchestrator, ProcessStore, RunStore, StepOutcome,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn page_text(request: &InferenceRequest) -> String {
    request
        .artifacts
        .iter()
        .map(|a| a.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Answers like a model reading the two sample pages.
fn respond(request: &InferenceRequest) -> Option<InferenceResponse> {
    let diagnosis = request.prompt.contains("\"Diagnosis\"");
    let json = match request.operation {
        Operation::PlanIdentify if diagnosis => {
            json!({"identity_fields": ["code", "diagnosed_on"], "skim_fields": []})
        }
        Operation::PlanIdentify => json!({
            "identity_fields": ["name"],
            "skim_fields": ["phone"],
            "description": "Pages that name a treating provider"
        }),
        Operation::PlanRemaining => json!({
            "groups": [{"name": "Contact", "fields": ["phone", "email"], "search_mode": "skim"}]
        }),
        Operation::ExtractIdentity if diagnosis => {
            let code = if page_text(request).contains("J45") { "J45" } else { "E11" };
            json!({"diagnoses": [{
                "code": code,
                "diagnosed_on": "2017-10-23",
                "_search_query": [{"code": code}]
            }]})
        }
        Operation::ExtractIdentity => json!({
            "provider": {"name": "Dr. Ann Smith", "_search_query": {"name": "%Smith%"}}
        }),
        Operation::ExtractRemaining => json!({
            "data": {"phone": "555-0100", "email": "ann@clinic.test"},
            "confidence": {"phone": 5, "email": 5}
        }),
        Operation::Classify => return None,
    };
    Some(InferenceResponse::completed(json))
}

const PAGES: &[&str] = &[
    "Dr. Ann Smith, tel 555-0100. Asthma (J45) diagnosed 10/23/2017.",
    "Follow-up with Dr. Ann Smith. Type 2 diabetes (E11) diagnosed October 23, 2017.",
];

async fn orchestrator() -> (Orchestrator<MemoryStore, MockInference>, uuid::Uuid, uuid::Uuid) {
    let store = MemoryStore::new();
    let (task, seeded) = seed_run(&store, sample_schema(), PAGES).await;
    (
        Orchestrator::new(store, MockInference::new().with_handler(respond)),
        task.id,
        seeded.output_artifact_id,
    )
}

fn rollup_of(artifact_json: Value) -> Value {
    artifact_json["objects"].clone()
}

#[tokio::test]
async fn test_full_run_deduplicates_across_pages() {
    init_tracing();
    let (orchestrator, task_id, pages_id) = orchestrator().await;
    let run = orchestrator.start_run(task_id, pages_id).await.unwrap();

    let outcome = orchestrator.run_until_idle(run.id, 100).await.unwrap();
    assert_eq!(outcome, StepOutcome::Complete);

    // One provider despite two identity processes, two diagnoses under it.
    assert_eq!(orchestrator.store().object_count().unwrap(), 3);

    let run = orchestrator.store().require_run(run.id).await.unwrap();
    assert_eq!(run.resolved_at("Provider", 0).len(), 1);
    assert_eq!(run.resolved_at("Diagnosis", 1).len(), 2);

    let target = orchestrator
        .store()
        .require_artifact(run.rollup_artifact_id.unwrap())
        .await
        .unwrap();
    let objects = rollup_of(target.json_content.unwrap());
    assert_eq!(objects.as_array().unwrap().len(), 1);

    let provider = &objects[0];
    assert_eq!(provider["name"], "Dr. Ann Smith");
    assert_eq!(provider["email"], "ann@clinic.test");

    let mut codes: Vec<&str> = provider["diagnoses"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["code"].as_str().unwrap())
        .collect();
    codes.sort();
    assert_eq!(codes, ["E11", "J45"]);

    let mock = orchestrator.inference();
    assert_eq!(mock.calls_for(Operation::Classify), 2);
    assert_eq!(mock.calls_for(Operation::ExtractRemaining), 1);
}

#[tokio::test]
async fn test_soft_failure_is_retried_on_next_step() {
    init_tracing();
    let store = MemoryStore::new();
    let (task, seeded) = seed_run(&store, sample_schema(), PAGES).await;
    let inference = MockInference::new()
        .with_failure(Operation::ExtractRemaining, "timed out after 300s")
        .with_handler(respond);
    let orchestrator = Orchestrator::new(store, inference);
    let run = orchestrator.start_run(task.id, seeded.output_artifact_id).await.unwrap();

    let outcome = orchestrator.run_until_idle(run.id, 100).await.unwrap();
    assert_eq!(outcome, StepOutcome::Complete);

    let processes = orchestrator
        .store()
        .processes_for_run(run.id, Some(Operation::ExtractRemaining))
        .await
        .unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].attempts, 2);
    assert!(processes[0].is_complete());
    assert!(processes[0].error.is_none());
}

#[tokio::test]
async fn test_second_run_reuses_plan_and_objects() {
    init_tracing();
    let (orchestrator, task_id, pages_id) = orchestrator().await;

    let first = orchestrator.start_run(task_id, pages_id).await.unwrap();
    orchestrator.run_until_idle(first.id, 100).await.unwrap();
    let plan_calls = orchestrator.inference().calls_for(Operation::PlanIdentify);
    let classify_calls = orchestrator.inference().calls_for(Operation::Classify);

    let second = orchestrator.start_run(task_id, pages_id).await.unwrap();
    let outcome = orchestrator.run_until_idle(second.id, 100).await.unwrap();
    assert_eq!(outcome, StepOutcome::Complete);

    let mock = orchestrator.inference();
    assert_eq!(mock.calls_for(Operation::PlanIdentify), plan_calls);
    assert_eq!(mock.calls_for(Operation::Classify), classify_calls);
    assert_eq!(orchestrator.store().object_count().unwrap(), 3);
}

#[tokio::test]
async fn test_forced_rollup_rewrites_output() {
    init_tracing();
    let (orchestrator, task_id, pages_id) = orchestrator().await;
    let run = orchestrator.start_run(task_id, pages_id).await.unwrap();
    orchestrator.run_until_idle(run.id, 100).await.unwrap();

    assert!(orchestrator.rollup(run.id, false).await.unwrap().is_none());

    let output = orchestrator.rollup(run.id, true).await.unwrap().unwrap();
    assert_eq!(output.summary.total_objects, 3);
    assert_eq!(output.summary.by_type["Diagnosis"], 2);
}
