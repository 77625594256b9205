//! # Chat Completions Reasoning
//!
//! Answers each user turn through an OpenAI-compatible `/chat/completions`
//! endpoint (Groq by default).
//!
//! ## Request shape:
//! 1. The configured system prompt
//! 2. Related older memories, if any were fetched, as a second system message
//! 3. The last `history_window` history entries (user → `user`, agent → `assistant`)
//! 4. The current utterance
//!
//! The utterance has usually been stored already when the history is read, so
//! a trailing history entry identical to it is not sent twice.

use crate::config::ReasoningConfig;
use crate::error::ReasoningError;
use crate::services::{MemoryEntry, ReasoningContext, ReasoningService, Role};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatCompletionsClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    system_prompt: String,
    history_window: usize,
}

impl ChatCompletionsClient {
    pub fn new(config: &ReasoningConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
            history_window: config.history_window,
        })
    }

    /// Session overrides in `context` win over the values the client was built with.
    fn build_request<'a>(&'a self, text: &str, context: &ReasoningContext) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: self.build_messages(text, context),
            temperature: context.temperature.unwrap_or(self.temperature),
        }
    }

    fn build_messages(&self, text: &str, context: &ReasoningContext) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::new("system", self.system_prompt.clone())];

        if !context.relevant.is_empty() {
            let recalled = context
                .relevant
                .iter()
                .map(|entry| format!("- {}: {}", entry.role.as_str(), entry.text))
                .collect::<Vec<_>>()
                .join("\n");
            messages.push(ChatMessage::new(
                "system",
                format!("Earlier in this conversation:\n{recalled}"),
            ));
        }

        let mut history: &[MemoryEntry] = &context.history;
        if let Some(last) = history.last() {
            if last.role == Role::User && last.text.trim() == text.trim() {
                history = &history[..history.len() - 1];
            }
        }
        let window = context.history_window.unwrap_or(self.history_window);
        let skip = history.len().saturating_sub(window);
        for entry in &history[skip..] {
            let role = match entry.role {
                Role::User => "user",
                Role::Agent => "assistant",
            };
            messages.push(ChatMessage::new(role, entry.text.clone()));
        }

        messages.push(ChatMessage::new("user", text));
        messages
    }
}

#[async_trait]
impl ReasoningService for ChatCompletionsClient {
    async fn reason(&self, text: &str, context: &ReasoningContext) -> Result<String, ReasoningError> {
        if self.api_key.is_empty() {
            return Err(ReasoningError::NotConfigured("GROQ_API_KEY is not set".into()));
        }

        let request = self.build_request(text, context);
        debug!(model = %self.model, messages = request.messages.len(), "requesting completion");

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ReasoningError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ReasoningError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReasoningError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatResponse = response
            .json()
            .await
            .map_err(|e| ReasoningError::Transport(e.to_string()))?;
        extract_reply(completion)
    }
}

fn extract_reply(completion: ChatResponse) -> Result<String, ReasoningError> {
    completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or(ReasoningError::EmptyResponse)
}
