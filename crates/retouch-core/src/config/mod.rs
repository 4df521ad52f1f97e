use std::path::Path;

use secrecy::SecretString;
use thiserror::Error;

mod schema;

pub use schema::{ExecutorConfig, ProviderConfig, RetouchConfig, RetryBudget, WorkflowConfig};

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "retouch.toml";

/// Environment variable that always takes precedence for the provider credential.
pub const API_KEY_VAR: &str = "RETOUCH_API_KEY";

/// Environment variables overriding the external tool binary path, in priority order.
pub const TOOL_PATH_VARS: [&str; 2] = ["RETOUCH_TOOL_PATH", "FFMPEG_PATH"];

/// Environment variable overriding the result image directory.
pub const OUTPUT_DIR_VAR: &str = "RETOUCH_OUTPUT_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("config validation error: {message}")]
    Validation { message: String },

    #[error("missing provider credential: set {variable} or {fallback}")]
    MissingCredential { variable: String, fallback: String },
}

/// Load and validate a `RetouchConfig` from a TOML file path.
///
/// Returns the default config if the file does not exist.
pub fn load_config(path: &Path) -> Result<RetouchConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(RetouchConfig::default());
    }

    let data = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_config(&data)
}

/// Parse and validate a `RetouchConfig` from a TOML string.
pub fn parse_config(data: &str) -> Result<RetouchConfig, ConfigError> {
    let config: RetouchConfig = toml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

/// Apply environment overrides on top of a parsed config.
///
/// `lookup` is usually `|k| std::env::var(k).ok()`; tests pass a map.
pub fn apply_env_overrides<F>(config: &mut RetouchConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(path) = TOOL_PATH_VARS.iter().find_map(|var| non_empty(*var)) {
        tracing::debug!(binary = %path, "tool binary overridden from environment");
        config.executor.binary = Some(path);
    }

    if let Some(dir) = non_empty(OUTPUT_DIR_VAR) {
        config.executor.output_dir = dir;
    }
}

/// Resolve the provider credential from the environment.
///
/// `RETOUCH_API_KEY` wins; otherwise the variable named by `api_key_env`.
pub fn resolve_api_key<F>(provider: &ProviderConfig, lookup: F) -> Option<SecretString>
where
    F: Fn(&str) -> Option<String>,
{
    [API_KEY_VAR, provider.api_key_env.as_str()]
        .into_iter()
        .filter_map(|var| lookup(var))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .map(SecretString::from)
}

/// Like [`resolve_api_key`] but reports which variables were consulted.
pub fn require_api_key<F>(provider: &ProviderConfig, lookup: F) -> Result<SecretString, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    resolve_api_key(provider, lookup).ok_or_else(|| ConfigError::MissingCredential {
        variable: API_KEY_VAR.to_string(),
        fallback: provider.api_key_env.clone(),
    })
}

fn validate(config: &RetouchConfig) -> Result<(), ConfigError> {
    if config.workflow.provider_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "workflow.provider_timeout_seconds must be > 0".to_string(),
        });
    }

    if config.executor.tool.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "executor.tool must not be empty".to_string(),
        });
    }

    if config.executor.timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "executor.timeout_seconds must be > 0".to_string(),
        });
    }

    if config.executor.output_buffer_bytes == 0 {
        return Err(ConfigError::Validation {
            message: "executor.output_buffer_bytes must be > 0".to_string(),
        });
    }

    if config.provider.base_url.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "provider.base_url must not be empty".to_string(),
        });
    }

    if config.provider.request_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "provider.request_timeout_seconds must be > 0".to_string(),
        });
    }

    let t = config.provider.temperature;
    if !t.is_finite() || !(0.0..=2.0).contains(&t) {
        return Err(ConfigError::Validation {
            message: format!("provider.temperature must be 0..=2, got {t}"),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn default_config_passes_validation() {
        let config = RetouchConfig::default();
        validate(&config).unwrap();
    }

    #[test]
    fn minimal_toml_parses_to_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.workflow.max_retries, 3);
        assert_eq!(config.workflow.retry_budget, RetryBudget::Independent);
        assert_eq!(config.executor.tool, "ffmpeg");
        assert_eq!(config.executor.timeout_seconds, 60);
        assert_eq!(config.provider.api_key_env, "GROQ_API_KEY");
    }

    #[test]
    fn full_example_config_parses() {
        let data = r#"
[workflow]
max_retries = 5
retry_budget = "shared"
provider_timeout_seconds = 90

[executor]
tool = "magick"
binary = "/opt/im/bin/magick"
timeout_seconds = 30
output_dir = "/tmp/retouch-out"
output_buffer_bytes = 4096

[provider]
base_url = "http://localhost:11434/v1"
text_model = "llama3"
vision_model = "llava"
api_key_env = "LOCAL_KEY"
request_timeout_seconds = 45
temperature = 0.3
"#;

        let config = parse_config(data).unwrap();
        assert_eq!(config.workflow.max_retries, 5);
        assert_eq!(config.workflow.retry_budget, RetryBudget::Shared);
        assert_eq!(config.workflow.provider_timeout_seconds, 90);
        assert_eq!(config.executor.tool, "magick");
        assert_eq!(config.executor.binary.as_deref(), Some("/opt/im/bin/magick"));
        assert_eq!(config.executor.output_buffer_bytes, 4096);
        assert_eq!(config.provider.vision_model, "llava");
        assert_eq!(config.provider.api_key_env, "LOCAL_KEY");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config = parse_config("[workflow]\nmax_retries = 0\n").unwrap();
        assert_eq!(config.workflow.max_retries, 0);
        assert_eq!(config.workflow.provider_timeout_seconds, 120);
        assert_eq!(config.executor.output_dir, "output");
    }

    #[test]
    fn unknown_field_in_toml_returns_parse_error() {
        let err = parse_config("[executor]\nshell = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn zero_executor_timeout_rejected() {
        let err = parse_config("[executor]\ntimeout_seconds = 0\n").unwrap_err();
        assert!(err.to_string().contains("executor.timeout_seconds"));
    }

    #[test]
    fn empty_tool_rejected() {
        let err = parse_config("[executor]\ntool = \"  \"\n").unwrap_err();
        assert!(err.to_string().contains("executor.tool"));
    }

    #[test]
    fn out_of_range_temperature_rejected() {
        let err = parse_config("[provider]\ntemperature = 3.5\n").unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = load_config(Path::new("/tmp/nonexistent-retouch-test.toml")).unwrap();
        assert_eq!(config, RetouchConfig::default());
    }

    #[test]
    fn env_overrides_tool_path_and_output_dir() {
        let vars = env(&[
            ("FFMPEG_PATH", "/usr/local/bin/ffmpeg"),
            ("RETOUCH_OUTPUT_DIR", "/srv/edits"),
        ]);
        let mut config = RetouchConfig::default();
        apply_env_overrides(&mut config, |k| vars.get(k).cloned());

        assert_eq!(
            config.executor.binary.as_deref(),
            Some("/usr/local/bin/ffmpeg")
        );
        assert_eq!(config.executor.output_dir, "/srv/edits");
    }

    #[test]
    fn retouch_tool_path_beats_ffmpeg_path() {
        let vars = env(&[
            ("FFMPEG_PATH", "/a/ffmpeg"),
            ("RETOUCH_TOOL_PATH", "/b/ffmpeg"),
        ]);
        let mut config = RetouchConfig::default();
        apply_env_overrides(&mut config, |k| vars.get(k).cloned());
        assert_eq!(config.executor.binary.as_deref(), Some("/b/ffmpeg"));
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let vars = env(&[("FFMPEG_PATH", "  ")]);
        let mut config = RetouchConfig::default();
        apply_env_overrides(&mut config, |k| vars.get(k).cloned());
        assert!(config.executor.binary.is_none());
    }

    #[test]
    fn api_key_prefers_retouch_variable() {
        let vars = env(&[("RETOUCH_API_KEY", "primary"), ("GROQ_API_KEY", "fallback")]);
        let key = resolve_api_key(&ProviderConfig::default(), |k| vars.get(k).cloned()).unwrap();
        assert_eq!(key.expose_secret(), "primary");
    }

    #[test]
    fn api_key_falls_back_to_configured_variable() {
        let vars = env(&[("GROQ_API_KEY", "gsk-test")]);
        let key = resolve_api_key(&ProviderConfig::default(), |k| vars.get(k).cloned()).unwrap();
        assert_eq!(key.expose_secret(), "gsk-test");
    }

    #[test]
    fn missing_api_key_names_both_variables() {
        let err = require_api_key(&ProviderConfig::default(), |_| None).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("RETOUCH_API_KEY"));
        assert!(msg.contains("GROQ_API_KEY"));
    }
}
