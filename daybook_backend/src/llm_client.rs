use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::BackendConfig;
use crate::http_client::build_http_client_with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Completion history is empty")]
    EmptyHistory,

    #[error("Failed to reach completion endpoint: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Completion endpoint returned {status}: {body}")]
    Endpoint {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Failed to parse completion response: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("Completion response contained no choices")]
    NoChoices,
}

/// One request/response exchange with a chat-completion endpoint.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, history: &[Message]) -> Result<String, CompletionError>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    max_retries: u32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model: String,
        client: reqwest::Client,
    ) -> Self {
        Self {
            api_url,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model,
            max_retries: 0,
            client,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let client =
            build_http_client_with_timeout(Some(Duration::from_secs(config.llm_timeout_secs)))?;
        Ok(Self::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            client,
        )
        .with_max_retries(config.llm_max_retries))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_url.trim_end_matches('/'))
    }

    async fn send_once(
        &self,
        request: &ChatCompletionRequest<'_>,
    ) -> Result<String, CompletionError> {
        let mut req = self.client.post(self.endpoint()).json(request);

        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.map_err(CompletionError::Transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(CompletionError::Endpoint { status, body });
        }

        let completion: ChatCompletionResponse =
            response.json().await.map_err(CompletionError::Decode)?;

        first_choice_content(completion)
    }
}

fn first_choice_content(completion: ChatCompletionResponse) -> Result<String, CompletionError> {
    completion
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content.unwrap_or_default())
        .ok_or(CompletionError::NoChoices)
}

fn is_transient(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

#[async_trait]
impl CompletionClient for LlmClient {
    async fn complete(&self, history: &[Message]) -> Result<String, CompletionError> {
        if history.is_empty() {
            return Err(CompletionError::EmptyHistory);
        }

        let request = ChatCompletionRequest {
            model: &self.model,
            messages: history,
        };

        let mut attempt = 0;
        loop {
            match self.send_once(&request).await {
                Err(CompletionError::Transport(error))
                    if attempt < self.max_retries && is_transient(&error) =>
                {
                    attempt += 1;
                    tracing::warn!(
                        "Completion request failed ({}), retrying ({}/{})",
                        error,
                        attempt,
                        self.max_retries
                    );
                }
                result => {
                    if let Ok(content) = &result {
                        tracing::debug!(
                            "Completion from {} returned {} chars",
                            self.model,
                            content.len()
                        );
                    }
                    return result;
                }
            }
        }
    }
}
