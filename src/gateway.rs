use async_trait::async_trait;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ProviderConfig};
use crate::error::{LeaderboardError, Result};

pub const PRIMARY_MODEL: &str = "openai";
pub const SECONDARY_MODEL: &str = "meta-llama/llama-3.1-8b-instruct:free";
pub const APP_TITLE: &str = "SASA Leaderboard";
const TEMPERATURE: f64 = 0.3;

/// One chat turn sent to a completion provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A backend that turns a conversation into one reply.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Produce the assistant reply. An empty reply is an error.
    async fn complete(&self, messages: &[ChatMessage], max_tokens: u32, bearer: Option<&str>) -> Result<String>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f64,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Option<Vec<Choice>>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ReplyMessage>,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

/// Any endpoint speaking the OpenAI `chat/completions` protocol.
pub struct OpenAiCompatible {
    name: String,
    http: reqwest::Client,
    base_url: String,
    model: String,
    headers: Vec<(&'static str, String)>,
}

impl OpenAiCompatible {
    pub fn new(name: impl Into<String>, base_url: &str, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(OpenAiCompatible {
            name: name.into(),
            http: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            headers: Vec::new(),
        })
    }

    /// Extra header sent with every request.
    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatible {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, messages: &[ChatMessage], max_tokens: u32, bearer: Option<&str>) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.http.post(&url).json(&CompletionRequest {
            model: &self.model,
            messages,
            max_tokens,
            temperature: TEMPERATURE,
        });
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        for (name, value) in &self.headers {
            req = req.header(*name, value);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LeaderboardError::UpstreamFetch(format!(
                "{} returned {}: {}",
                self.name, status, body
            )));
        }

        let parsed: CompletionResponse = resp.json().await?;
        parsed
            .choices
            .and_then(|choices| choices.into_iter().next())
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| LeaderboardError::UpstreamFetch(format!("{} returned no content", self.name)))
    }
}

/// Primary provider with a credentialed fallback.
pub struct CompletionGateway {
    primary: Arc<dyn CompletionProvider>,
    primary_key: Option<String>,
    secondary: Arc<dyn CompletionProvider>,
}

impl CompletionGateway {
    pub fn new(
        primary: Arc<dyn CompletionProvider>,
        primary_key: Option<String>,
        secondary: Arc<dyn CompletionProvider>,
    ) -> Self {
        CompletionGateway {
            primary,
            primary_key,
            secondary,
        }
    }

    /// Pollinations as primary, OpenRouter as secondary.
    pub fn from_config(config: &Config) -> Result<Self> {
        let ProviderConfig { base_url, api_key } = &config.primary_ai;
        let primary = OpenAiCompatible::new("pollinations", base_url, PRIMARY_MODEL, config.ai_timeout)?;
        let secondary = OpenAiCompatible::new(
            "openrouter",
            &config.secondary_ai.base_url,
            SECONDARY_MODEL,
            config.ai_timeout,
        )?
        .with_header("HTTP-Referer", config.app_url.clone())
        .with_header("X-Title", APP_TITLE);
        Ok(CompletionGateway::new(
            Arc::new(primary),
            api_key.clone(),
            Arc::new(secondary),
        ))
    }

    /// Try the primary provider, then the secondary when `credential` is present.
    ///
    /// # Arguments
    /// * `messages` - Conversation, system prompt first
    /// * `max_tokens` - Reply length cap
    /// * `credential` - Bearer token for the secondary provider
    ///
    /// # Errors
    /// * `AllProvidersFailed` when the primary fails and the secondary fails or has no credential
    pub async fn complete(&self, messages: &[ChatMessage], max_tokens: u32, credential: Option<&str>) -> Result<String> {
        match self
            .primary
            .complete(messages, max_tokens, self.primary_key.as_deref())
            .await
        {
            Ok(reply) => return Ok(reply),
            Err(e) => warn!("{} failed, trying fallback: {}", self.primary.name(), e),
        }

        let Some(token) = credential else {
            debug!("no credential for {}, giving up", self.secondary.name());
            return Err(LeaderboardError::AllProvidersFailed);
        };

        self.secondary
            .complete(messages, max_tokens, Some(token))
            .await
            .map_err(|e| {
                error!("{} failed: {}", self.secondary.name(), e);
                LeaderboardError::AllProvidersFailed
            })
    }
}
