// orchestrator-service-rs/src/inference.rs
//
// Client for the inference backend (Ollama-compatible `/api/chat`).
//
// The backend is only ever reached through `InferenceBackend`, so workers can
// be exercised against a mock. Transport failures are mapped onto the shared
// error taxonomy:
// - connection refused -> Communication
// - request timeout    -> Timeout
// - unparsable body    -> MalformedResponse

use std::time::Duration;

use async_trait::async_trait;
use config_rs::InferenceSettings;
use error_handling_rs::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

const SERVICE: &str = "inference";

/// One chat turn sent to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Anything that turns a model id and a message list into text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// HTTP client for an Ollama-style chat endpoint
#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInferenceClient {
    pub fn new(settings: &InferenceSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| Error::from(e).service(SERVICE))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[async_trait]
impl InferenceBackend for HttpInferenceClient {
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let request = ChatRequest {
            model,
            messages,
            stream: false,
        };

        let response = self
            .client
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::from(e).service(SERVICE).context("model", model))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = Error::new(
                ErrorKind::Communication,
                format!("inference backend returned {}: {}", status, body.trim()),
            )
            .service(SERVICE)
            .context("status", status.as_u16())
            .context("model", model);
            // Client errors will not go away on their own.
            return Err(if status.is_client_error() {
                error.permanent()
            } else {
                error
            });
        }

        let body: ChatResponse = response.json().await.map_err(|e| {
            Error::new(
                ErrorKind::MalformedResponse,
                format!("could not decode chat response: {}", e),
            )
            .service(SERVICE)
            .cause(e)
        })?;

        match body.message {
            Some(message) if !message.content.trim().is_empty() => Ok(message.content),
            _ => Err(Error::new(
                ErrorKind::MalformedResponse,
                "chat response carried no message content",
            )
            .service(SERVICE)
            .context("model", model)),
        }
    }
}
