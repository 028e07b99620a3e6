//! Inference service contract and the OpenAI-compatible HTTP client.

use crate::config::InferenceConfig;
use crate::error::{InferenceError, WorkerError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// A text-in, text-out model endpoint.
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn invoke(&self, model_id: &str, prompt: &str) -> Result<String, InferenceError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: u16, body: &str) -> InferenceError {
    match status {
        401 | 403 => InferenceError::AccessDenied(format!("HTTP {}: {}", status, body)),
        429 => InferenceError::RateLimited(format!("HTTP {}: {}", status, body)),
        400 | 422 => InferenceError::ValidationError(format!("HTTP {}: {}", status, body)),
        _ => InferenceError::ModelError(format!("HTTP {}: {}", status, body)),
    }
}

fn map_http_error(error: reqwest::Error) -> InferenceError {
    if let Some(status) = error.status() {
        classify_status(status.as_u16(), &error.to_string())
    } else if error.is_timeout() {
        InferenceError::ModelError(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        InferenceError::ModelError(format!("Connection error: {}", error))
    } else {
        InferenceError::ModelError(format!("HTTP error: {}", error))
    }
}

/// Client for `POST {endpoint}/chat/completions`.
pub struct HttpInferenceClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .no_proxy()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                WorkerError::InferenceClient(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl InferenceService for HttpInferenceClient {
    async fn invoke(&self, model_id: &str, prompt: &str) -> Result<String, InferenceError> {
        let request = ChatCompletionRequest {
            model: model_id,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(map_http_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_status(status.as_u16(), &error_text));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::ModelError(format!("Failed to parse response: {}", e)))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| InferenceError::ModelError("No content in response".to_string()))?;

        debug!(model_id, prompt_chars = prompt.len(), output_chars = content.len(), "Inference call completed");
        Ok(content)
    }
}
