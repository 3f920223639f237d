//! Hierarchical Run - End-to-end Example
//!
//! Extracts providers and their diagnoses from a handful of page texts and
//! prints the rolled-up graph.
//!
//! By default a canned [`MockInference`] stands in for the model, so the
//! example runs offline. With the `openai` feature and `OPENAI_API_KEY` set,
//! the same run goes through [`OpenAIInference`].
//!
//! ```bash
//! cargo run --example hierarchical_run
//! OPENAI_API_KEY=sk-... cargo run --example hierarchical_run --features openai
//! ```
//!
//! Set `RUST_LOG=schema_extraction=debug` to watch each step.

use serde_json::json;
use tracing_subscriber::EnvFilter;

use schema_extraction::{
    testing::{sample_schema, seed_run},
    ArtifactStore, InferenceRequest, InferenceResponse, InferenceService, MemoryStore,
    MockInference, Operation, Orchestrator, ProcessStore, RunStore, StepOutcome,
};

/// Knobs for the demo run.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    /// Upper bound on orchestrator steps.
    pub max_steps: usize,

    /// Page texts fed to the run.
    pub pages: Vec<&'static str>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            max_steps: 200,
            pages: vec![
                "Dr. Ann Smith, Lakeside Clinic. Tel 555-0100. Assessment: asthma (J45), first diagnosed 10/23/2017.",
                "Follow-up visit with Dr. Ann Smith (ann@lakeside.test). New diagnosis: type 2 diabetes (E11) on 2019-03-02.",
                "Billing summary. No clinical content on this page.",
            ],
        }
    }
}

/// Canned answers keyed on what the request asks for.
fn canned(request: &InferenceRequest) -> Option<InferenceResponse> {
    let about_diagnosis = request.prompt.contains("\"Diagnosis\"");
    let text: String = request.artifacts.iter().map(|a| a.content.as_str()).collect();

    let json = match request.operation {
        Operation::PlanIdentify if about_diagnosis => {
            json!({"identity_fields": ["code", "diagnosed_on"], "skim_fields": []})
        }
        Operation::PlanIdentify => json!({
            "identity_fields": ["name"],
            "skim_fields": ["phone"],
            "description": "Pages naming a treating provider"
        }),
        Operation::PlanRemaining => json!({
            "groups": [{"name": "Contact", "fields": ["phone", "email"], "search_mode": "skim"}]
        }),
        Operation::Classify => {
            let clinical = text.contains("Dr.");
            let answer: serde_json::Map<_, _> = request.response_schema["properties"]
                .as_object()?
                .keys()
                .map(|k| (k.clone(), json!(clinical)))
                .collect();
            serde_json::Value::Object(answer)
        }
        Operation::ExtractIdentity if about_diagnosis => {
            let (code, date) = if text.contains("J45") {
                ("J45", "2017-10-23")
            } else {
                ("E11", "2019-03-02")
            };
            json!({"diagnoses": [{
                "code": code,
                "diagnosed_on": date,
                "_search_query": [{"code": code}]
            }]})
        }
        Operation::ExtractIdentity => json!({
            "provider": {"name": "Dr. Ann Smith", "_search_query": {"name": "%Smith%"}}
        }),
        Operation::ExtractRemaining => {
            let phone = text.contains("555-0100").then_some("555-0100");
            let email = text.contains("ann@lakeside.test").then_some("ann@lakeside.test");
            json!({
                "data": {"phone": phone, "email": email},
                "confidence": {
                    "phone": if phone.is_some() { 5 } else { 1 },
                    "email": if email.is_some() { 5 } else { 1 }
                }
            })
        }
    };
    Some(InferenceResponse::completed(json))
}

async fn run_demo<I: InferenceService>(inference: I, config: DemoConfig) -> schema_extraction::error::Result<()> {
    let store = MemoryStore::new();
    let (task, seeded) = seed_run(&store, sample_schema(), &config.pages).await;

    let orchestrator = Orchestrator::new(store, inference);
    let run = orchestrator.start_run(task.id, seeded.output_artifact_id).await?;

    let mut steps = 0;
    loop {
        let outcome = orchestrator.step(run.id).await?;
        steps += 1;
        println!("step {:>3}: {:?}", steps, outcome);

        if outcome.is_complete() || steps >= config.max_steps {
            break;
        }
        if let StepOutcome::ProcessFailed { error, .. } = &outcome {
            eprintln!("  soft failure, will retry: {}", error);
        }
    }

    let run = orchestrator.store().require_run(run.id).await?;
    let processes = orchestrator.store().processes_for_run(run.id, None).await?;
    println!(
        "\n{} processes, {} objects, reached level {}",
        processes.len(),
        orchestrator.store().object_count()?,
        run.current_level
    );

    if let Some(rollup_id) = run.rollup_artifact_id {
        let rollup = orchestrator.store().require_artifact(rollup_id).await?;
        if let Some(json) = rollup.json_content {
            println!("{}", serde_json::to_string_pretty(&json).unwrap_or_default());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> schema_extraction::error::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let config = DemoConfig::default();

    #[cfg(feature = "openai")]
    if std::env::var("OPENAI_API_KEY").is_ok() {
        let inference = schema_extraction::ai::OpenAIInference::from_env()?;
        return run_demo(inference, config).await;
    }

    run_demo(MockInference::new().with_handler(canned), config).await
}
