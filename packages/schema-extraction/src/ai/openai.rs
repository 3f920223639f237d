//! OpenAI implementation of the inference trait.
//!
//! A reference implementation over chat completions with the `json_schema`
//! response format.
//!
//! # Example
//!
//! ```rust,ignore
//! use schema_extraction::ai::OpenAIInference;
//!
//! let inference = OpenAIInference::new("sk-...").with_model("gpt-4o");
//! let orchestrator = Orchestrator::new(store, inference);
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ExtractionError, Result};
use crate::traits::inference::{InferenceRequest, InferenceResponse, InferenceService};

const SYSTEM_PROMPT: &str = "You extract structured data from documents. \
Answer only with JSON matching the response schema. Use null for anything the documents do not state.";

/// OpenAI-based inference service.
#[derive(Clone)]
pub struct OpenAIInference {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAIInference {
    /// Client for the public OpenAI endpoint.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    /// Read the key from `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ExtractionError::Config("OPENAI_API_KEY not set".into()))?;
        Ok(Self::new(api_key))
    }

    /// Chat model used for every operation.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Point at any OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn chat_request(&self, request: &InferenceRequest) -> StructuredRequest {
        StructuredRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_message(request),
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: JsonSchemaFormat {
                    name: request.operation.as_str().replace([':', ' '], "_").to_lowercase(),
                    // Response schemas carry nullable unions and optional keys
                    strict: false,
                    schema: request.response_schema.clone(),
                },
            },
        }
    }
}

/// Prompt followed by every attached artifact.
fn user_message(request: &InferenceRequest) -> String {
    let mut message = request.prompt.clone();
    for artifact in &request.artifacts {
        message.push_str(&format!(
            "\n\n## {} ({})\n\n{}",
            artifact.name, artifact.id, artifact.content
        ));
    }
    message
}

#[async_trait]
impl InferenceService for OpenAIInference {
    async fn submit(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        let body = self.chat_request(&request);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExtractionError::Inference(e.to_string().into()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Ok(InferenceResponse::failed(format!(
                "OpenAI error {}: {}",
                status, error_text
            )));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExtractionError::Inference(e.to_string().into()))?;

        Ok(parse_choice(chat_response))
    }
}

fn parse_choice(response: ChatResponse) -> InferenceResponse {
    let Some(choice) = response.choices.into_iter().next() else {
        return InferenceResponse::failed("No response from OpenAI");
    };

    if choice.finish_reason.as_deref() == Some("length") {
        return InferenceResponse::failed("response truncated at max tokens");
    }

    let Some(content) = choice.message.content else {
        return InferenceResponse::failed("empty message content");
    };

    match serde_json::from_str(&content) {
        Ok(json) => InferenceResponse::completed(json),
        Err(e) => {
            debug!(error = %e, "Model answered with invalid JSON");
            InferenceResponse::failed(format!("invalid JSON in response: {}", e))
        }
    }
}

// Request/Response types

#[derive(Serialize)]
struct StructuredRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    json_schema: JsonSchemaFormat,
}

#[derive(Serialize)]
struct JsonSchemaFormat {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,

    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}
