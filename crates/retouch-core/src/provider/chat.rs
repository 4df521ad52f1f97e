//! Provider backed by an OpenAI-compatible `/chat/completions` endpoint.
//!
//! One [`ChatProvider`] serves all four capabilities: the analyzer and
//! verifier use the vision model, the planner and generator the text model.
//! The API key is a [`SecretString`] and is only exposed when building the
//! `Authorization` header.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    parse, prompts, AnalyzeRequest, Analyzer, CommandGenerator, GenerateRequest, InferenceError,
    PlanRequest, Planner, Verifier, VerifyRequest,
};
use crate::config::{resolve_api_key, ProviderConfig, API_KEY_VAR};
use crate::executor::ToolCommand;
use crate::media;
use crate::session::{AnalysisNotes, EditPlan, VerificationResult};

/// Cloning is cheap; clones share the HTTP connection pool.
#[derive(Clone)]
pub struct ChatProvider {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    api_key: Option<SecretString>,
    key_env: String,
    base_url: String,
    text_model: String,
    vision_model: String,
    temperature: f32,
    request_timeout: Duration,
    tool: String,
}

// Not derived: keeps the credential out of debug output.
impl fmt::Debug for ChatProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatProvider")
            .field("base_url", &self.inner.base_url)
            .field("text_model", &self.inner.text_model)
            .field("vision_model", &self.inner.vision_model)
            .field("has_api_key", &self.inner.api_key.is_some())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
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

impl ChatProvider {
    /// Build a provider. A missing key is allowed here and reported by
    /// `preflight`, so a run fails before any stage executes.
    pub fn new(
        config: &ProviderConfig,
        tool: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self, InferenceError> {
        let request_timeout = Duration::from_secs(config.request_timeout_seconds);
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| InferenceError::Unavailable(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                api_key,
                key_env: config.api_key_env.clone(),
                base_url: config.base_url.trim_end_matches('/').to_string(),
                text_model: config.text_model.clone(),
                vision_model: config.vision_model.clone(),
                temperature: config.temperature,
                request_timeout,
                tool: tool.into(),
            }),
        })
    }

    /// Build a provider with the key taken from the process environment.
    pub fn from_env(config: &ProviderConfig, tool: impl Into<String>) -> Result<Self, InferenceError> {
        let key = resolve_api_key(config, |k| std::env::var(k).ok());
        Self::new(config, tool, key)
    }

    fn check_key(&self) -> Result<&SecretString, InferenceError> {
        self.inner.api_key.as_ref().ok_or_else(|| {
            InferenceError::Unavailable(format!(
                "no API key: set {API_KEY_VAR} or {}",
                self.inner.key_env
            ))
        })
    }

    async fn complete(&self, model: &str, messages: Vec<Value>) -> Result<String, InferenceError> {
        let key = self.check_key()?;
        let url = format!("{}/chat/completions", self.inner.base_url);
        let body = json!({
            "model": model,
            "temperature": self.inner.temperature,
            "messages": messages,
        });

        debug!(%model, messages = messages_len(&body), "sending chat completion");

        let response = self
            .inner
            .client
            .post(&url)
            .header("authorization", format!("Bearer {}", key.expose_secret()))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => InferenceError::Authentication(format!("HTTP {status}")),
                code => InferenceError::Http {
                    status: code,
                    body: truncate(&body, 500),
                },
            });
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::MalformedResponse(format!("invalid completion body: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| InferenceError::MalformedResponse("completion has no content".into()))
    }

    fn map_transport(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                seconds: self.inner.request_timeout.as_secs(),
            }
        } else {
            InferenceError::Transport(e.to_string())
        }
    }
}

fn messages_len(body: &Value) -> usize {
    body["messages"].as_array().map_or(0, Vec::len)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn system(text: impl Into<String>) -> Value {
    json!({ "role": "system", "content": text.into() })
}

fn user(text: impl Into<String>) -> Value {
    json!({ "role": "user", "content": text.into() })
}

fn assistant(text: impl Into<String>) -> Value {
    json!({ "role": "assistant", "content": text.into() })
}

fn user_with_image(data_uri: String, text: String) -> Value {
    json!({
        "role": "user",
        "content": [
            { "type": "image_url", "image_url": { "url": data_uri } },
            { "type": "text", "text": text },
        ],
    })
}

impl Analyzer for ChatProvider {
    fn preflight(&self) -> Result<(), InferenceError> {
        self.check_key().map(|_| ())
    }

    async fn analyze(&self, request: AnalyzeRequest) -> Result<AnalysisNotes, InferenceError> {
        let image = media::data_uri(&request.image).await?;
        let messages = vec![user_with_image(image, prompts::analyze(&request.instruction))];
        let text = self.complete(&self.inner.vision_model, messages).await?;
        Ok(parse::parse_analysis(&text))
    }
}

impl Planner for ChatProvider {
    fn preflight(&self) -> Result<(), InferenceError> {
        self.check_key().map(|_| ())
    }

    async fn plan(&self, request: PlanRequest) -> Result<EditPlan, InferenceError> {
        let mut messages = vec![
            system(prompts::PLANNER_SYSTEM),
            user(prompts::plan_request(&request.instruction, &request.analysis)),
        ];
        if let (Some(feedback), Some(previous)) = (&request.prior_feedback, &request.previous_plan) {
            let previous = serde_json::to_string(previous).unwrap_or_default();
            messages.push(assistant(previous));
            messages.push(user(prompts::replan(feedback)));
        } else if let Some(feedback) = &request.prior_feedback {
            messages.push(user(prompts::replan(feedback)));
        }

        let text = self.complete(&self.inner.text_model, messages).await?;
        parse::parse_plan(&text)
    }
}

impl CommandGenerator for ChatProvider {
    fn preflight(&self) -> Result<(), InferenceError> {
        self.check_key().map(|_| ())
    }

    async fn generate(&self, request: GenerateRequest) -> Result<ToolCommand, InferenceError> {
        let input = request.input.to_string_lossy().into_owned();
        let output = request.output.to_string_lossy().into_owned();

        let mut messages = vec![
            system(prompts::generator_system(&self.inner.tool)),
            user(prompts::generate_request(&request.plan)),
        ];
        if let Some(previous) = &request.prior_command {
            messages.push(assistant(prompts::previous_args(previous, &input, &output)));
            let stderr = request.prior_stderr.as_deref().unwrap_or("(no error output)");
            messages.push(user(prompts::repair(stderr)));
        }

        let text = self.complete(&self.inner.text_model, messages).await?;
        parse::parse_command(&text, &self.inner.tool, &request.input, &request.output)
    }
}

impl Verifier for ChatProvider {
    fn preflight(&self) -> Result<(), InferenceError> {
        self.check_key().map(|_| ())
    }

    async fn verify(&self, request: VerifyRequest) -> Result<VerificationResult, InferenceError> {
        let image = media::data_uri(&request.result).await?;
        let messages = vec![user_with_image(
            image,
            prompts::verify(&request.instruction, &request.plan),
        )];
        let text = self.complete(&self.inner.vision_model, messages).await?;
        Ok(parse::parse_verification(&text))
    }
}
