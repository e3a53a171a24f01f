use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Immutable process configuration, loaded once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub request_timeout: Duration,
    /// Admission body cap in bytes; 0 means unlimited.
    pub max_body_bytes: usize,
    pub aws_region: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_session_token: String,
    pub default_model_id: String,
    /// Applied when the request omits max_tokens; 0 disables the default.
    pub default_max_output_tokens: i32,
    /// Floor for max_tokens when tools are present, so tool-call JSON is not
    /// truncated mid-argument.
    pub min_tool_max_output_tokens: i32,
    pub global_max_concurrent: usize,
    pub db_path: String,
    pub log_queue_size: usize,
    /// Code-point cap for request/response previews in call logs.
    pub max_content_chars: usize,
    /// When the request carries tools and tool_choice is auto/absent, force
    /// the model to call one of them.
    pub force_tool_use: bool,
}

impl Config {
    pub fn load() -> Result<Config> {
        let cfg = Config {
            listen_addr: get_env("LISTEN_ADDR", ":8080"),
            request_timeout: Duration::from_secs(get_env_int("REQUEST_TIMEOUT_SECONDS", 300).max(0)
                as u64),
            max_body_bytes: get_env_int("MAX_BODY_BYTES", 0).max(0) as usize,
            aws_region: get_env("AWS_REGION", ""),
            aws_access_key_id: get_env("AWS_ACCESS_KEY_ID", ""),
            aws_secret_access_key: get_env("AWS_SECRET_ACCESS_KEY", ""),
            aws_session_token: get_env("AWS_SESSION_TOKEN", ""),
            default_model_id: get_env("DEFAULT_MODEL_ID", ""),
            default_max_output_tokens: get_env_int("DEFAULT_MAX_OUTPUT_TOKENS", 0) as i32,
            min_tool_max_output_tokens: get_env_int("MIN_TOOL_MAX_OUTPUT_TOKENS", 8192) as i32,
            global_max_concurrent: get_env_int("GLOBAL_MAX_CONCURRENT", 512).max(0) as usize,
            db_path: get_env("DB_PATH", "./data/router.db"),
            log_queue_size: get_env_int("LOG_QUEUE_SIZE", 10_000).max(0) as usize,
            max_content_chars: get_env_int("MAX_CONTENT_CHARS", 20_000).max(0) as usize,
            force_tool_use: get_env_bool("FORCE_TOOL_USE", true),
        };

        if cfg.default_max_output_tokens < 0 {
            bail!("DEFAULT_MAX_OUTPUT_TOKENS must be >= 0");
        }
        if cfg.min_tool_max_output_tokens < 0 {
            bail!("MIN_TOOL_MAX_OUTPUT_TOKENS must be >= 0");
        }
        if cfg.request_timeout.is_zero() {
            bail!("REQUEST_TIMEOUT_SECONDS must be > 0");
        }
        if cfg.log_queue_size == 0 {
            bail!("LOG_QUEUE_SIZE must be > 0");
        }
        if cfg.max_content_chars == 0 {
            bail!("MAX_CONTENT_CHARS must be > 0");
        }

        Ok(cfg)
    }
}

/// Persisted per-client policy row, shared between the store and the auth
/// registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub api_key: String,
    #[serde(default)]
    pub max_requests_per_minute: i64,
    #[serde(default)]
    pub max_concurrent: i64,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
}

fn get_env(name: &str, fallback: &str) -> String {
    match std::env::var(name) {
        Ok(value) => {
            let value = value.trim().to_string();
            if value.is_empty() {
                fallback.to_string()
            } else {
                value
            }
        }
        Err(_) => fallback.to_string(),
    }
}

fn get_env_int(name: &str, fallback: i64) -> i64 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<i64>().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn get_env_bool(name: &str, fallback: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw.trim().to_ascii_lowercase();
            if value.is_empty() {
                fallback
            } else {
                value == "true" || value == "1" || value == "yes"
            }
        }
        Err(_) => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment access is process-global, so every env-dependent assertion
    // lives in this single test to avoid cross-test races.
    #[test]
    fn load_reads_overrides_and_defaults() {
        std::env::set_var("LISTEN_ADDR", " :9090 ");
        std::env::set_var("MIN_TOOL_MAX_OUTPUT_TOKENS", "9000");
        std::env::set_var("FORCE_TOOL_USE", "no");
        std::env::remove_var("REQUEST_TIMEOUT_SECONDS");
        std::env::remove_var("LOG_QUEUE_SIZE");

        let cfg = Config::load().expect("config loads");
        assert_eq!(cfg.listen_addr, ":9090");
        assert_eq!(cfg.min_tool_max_output_tokens, 9000);
        assert!(!cfg.force_tool_use);
        assert_eq!(cfg.request_timeout, Duration::from_secs(300));
        assert_eq!(cfg.log_queue_size, 10_000);
        assert_eq!(cfg.max_content_chars, 20_000);

        std::env::set_var("MIN_TOOL_MAX_OUTPUT_TOKENS", "-1");
        assert!(Config::load().is_err());

        std::env::remove_var("LISTEN_ADDR");
        std::env::remove_var("MIN_TOOL_MAX_OUTPUT_TOKENS");
        std::env::remove_var("FORCE_TOOL_USE");
    }
}
