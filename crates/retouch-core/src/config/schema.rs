use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `retouch.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetouchConfig {
    pub workflow: WorkflowConfig,
    pub executor: ExecutorConfig,
    pub provider: ProviderConfig,
}

/// Retry ceiling and timeouts for the workflow engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkflowConfig {
    pub max_retries: u32,
    pub retry_budget: RetryBudget,
    pub provider_timeout_seconds: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_budget: RetryBudget::Independent,
            provider_timeout_seconds: 120,
        }
    }
}

/// How the two loop-back kinds share the configured retry ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBudget {
    /// Each loop kind gets its own budget of `max_retries`.
    #[default]
    Independent,
    /// Both loop kinds draw from a single budget of `max_retries`.
    Shared,
}

/// External image tool invocation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutorConfig {
    pub tool: String,
    pub binary: Option<String>,
    pub timeout_seconds: u64,
    pub output_dir: String,
    pub output_buffer_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tool: "ffmpeg".to_string(),
            binary: None,
            timeout_seconds: 60,
            output_dir: "output".to_string(),
            output_buffer_bytes: 1024 * 1024, // 1 MiB per stream
        }
    }
}

/// OpenAI-compatible inference endpoint settings.
///
/// The API key itself never lives in the file; it is read from the
/// environment variable named by `api_key_env` (or `RETOUCH_API_KEY`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub text_model: String,
    pub vision_model: String,
    pub api_key_env: String,
    pub request_timeout_seconds: u64,
    pub temperature: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            text_model: "openai/gpt-oss-120b".to_string(),
            vision_model: "meta-llama/llama-4-maverick-17b-128e-instruct".to_string(),
            api_key_env: "GROQ_API_KEY".to_string(),
            request_timeout_seconds: 120,
            temperature: 0.1,
        }
    }
}
