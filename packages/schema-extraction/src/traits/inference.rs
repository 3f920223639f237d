//! Inference service trait.
//!
//! The inference service is a black box: it receives a prompt, the content
//! of the artifacts the prompt refers to, and a JSON response schema, and
//! returns structured JSON or a typed failure. Retry policy belongs to the
//! service, not to the orchestrator.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{artifact::Artifact, process::Operation};

/// Artifact content attached to an inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArtifact {
    pub id: Uuid,
    pub name: String,
    pub content: String,
}

impl From<&Artifact> for PromptArtifact {
    fn from(artifact: &Artifact) -> Self {
        Self {
            id: artifact.id,
            name: artifact.name.clone(),
            content: artifact.content_for_prompt(),
        }
    }
}

/// A single structured-output call.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Which pipeline step is asking (used for routing and tracing)
    pub operation: Operation,
    pub prompt: String,
    pub artifacts: Vec<PromptArtifact>,
    pub response_schema: serde_json::Value,
    pub timeout: Duration,
}

impl InferenceRequest {
    pub fn new(
        operation: Operation,
        prompt: impl Into<String>,
        response_schema: serde_json::Value,
        timeout: Duration,
    ) -> Self {
        Self {
            operation,
            prompt: prompt.into(),
            artifacts: Vec::new(),
            response_schema,
            timeout,
        }
    }

    pub fn with_artifacts<'a>(mut self, artifacts: impl IntoIterator<Item = &'a Artifact>) -> Self {
        self.artifacts.extend(artifacts.into_iter().map(PromptArtifact::from));
        self
    }
}

/// Result of an inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InferenceResponse {
    pub completed: bool,
    pub json: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl InferenceResponse {
    /// A completed call carrying JSON.
    pub fn completed(json: serde_json::Value) -> Self {
        Self {
            completed: true,
            json: Some(json),
            error: None,
        }
    }

    /// A call that did not complete.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            completed: false,
            json: None,
            error: Some(error.into()),
        }
    }

    /// JSON of a completed call; `None` is a soft failure.
    pub fn into_json(self) -> Option<serde_json::Value> {
        if self.completed {
            self.json
        } else {
            None
        }
    }

    /// Error message for a soft failure.
    pub fn failure_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "inference call did not complete".to_string())
    }
}

/// JSON schema for a typed response (must be a top-level object).
pub fn response_schema<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(serde_json::Value::Null)
}

/// Black-box structured inference.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Submit a prompt with artifacts and a response schema.
    async fn submit(&self, request: InferenceRequest) -> Result<InferenceResponse>;
}

/// Submit with the request timeout enforced locally.
///
/// Timeouts and transport errors are folded into an incomplete response so
/// callers only deal with the soft-failure contract.
pub async fn submit_bounded<I>(inference: &I, request: InferenceRequest) -> InferenceResponse
where
    I: InferenceService + ?Sized,
{
    let timeout = request.timeout;
    let operation = request.operation;

    match tokio::time::timeout(timeout, inference.submit(request)).await {
        Ok(Ok(response)) => {
            if !response.completed {
                warn!(operation = %operation, error = ?response.error, "Inference call incomplete");
            }
            response
        }
        Ok(Err(e)) => {
            warn!(operation = %operation, error = %e, "Inference call failed");
            InferenceResponse::failed(e.to_string())
        }
        Err(_) => {
            warn!(operation = %operation, timeout_secs = timeout.as_secs(), "Inference call timed out");
            InferenceResponse::failed(format!("timed out after {}s", timeout.as_secs()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractionError;
    use serde_json::json;

    fn request(timeout: Duration) -> InferenceRequest {
        InferenceRequest::new(Operation::Classify, "prompt", json!({}), timeout)
    }

    #[tokio::test]
    async fn test_submit_bounded_passes_through_completed() {
        let mut mock = MockInferenceService::new();
        mock.expect_submit()
            .times(1)
            .returning(|_| Ok(InferenceResponse::completed(json!({"ok": true}))));

        let response = submit_bounded(&mock, request(Duration::from_secs(5))).await;
        assert_eq!(response.into_json(), Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_submit_bounded_folds_errors_into_soft_failure() {
        let mut mock = MockInferenceService::new();
        mock.expect_submit()
            .times(1)
            .returning(|_| Err(ExtractionError::Inference("connection reset".into())));

        let response = submit_bounded(&mock, request(Duration::from_secs(5))).await;
        assert!(!response.completed);
        assert!(response.failure_message().contains("connection reset"));
    }

    struct SlowInference;

    #[async_trait]
    impl InferenceService for SlowInference {
        async fn submit(&self, _request: InferenceRequest) -> Result<InferenceResponse> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(InferenceResponse::completed(json!({})))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_bounded_times_out() {
        let response = submit_bounded(&SlowInference, request(Duration::from_secs(1))).await;
        assert!(!response.completed);
        assert!(response.failure_message().contains("timed out"));
    }

    #[test]
    fn test_incomplete_response_yields_no_json() {
        let response = InferenceResponse {
            completed: false,
            json: Some(json!({"partial": true})),
            error: None,
        };
        assert!(response.into_json().is_none());
    }
}
