use std::path::PathBuf;
use std::time::Duration;

use crate::inference::{BackendKind, RetryPolicy};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_INFERENCE_ENDPOINT: &str = "http://localhost:11434/api/generate";
const DEFAULT_MODEL: &str = "llama3.2";
const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_REQUEST_TIMEOUT: u64 = 120;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;
const DEFAULT_JUDGE_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_JUDGE_MODEL: &str = "gpt-4o-mini";
const DEFAULT_JUDGE_MAX_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub auth_token: Option<String>,
    pub data_dir: PathBuf,
    pub inference_endpoint: String,
    pub inference_backend: BackendKind,
    pub default_model: String,
    pub max_concurrency: usize,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub judge_endpoint: String,
    pub judge_backend: BackendKind,
    pub judge_model: String,
    pub judge_api_key: Option<String>,
    pub judge_max_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            auth_token: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            inference_endpoint: DEFAULT_INFERENCE_ENDPOINT.into(),
            inference_backend: BackendKind::Ollama,
            default_model: DEFAULT_MODEL.into(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            judge_endpoint: DEFAULT_JUDGE_ENDPOINT.into(),
            judge_backend: BackendKind::OpenAi,
            judge_model: DEFAULT_JUDGE_MODEL.into(),
            judge_api_key: None,
            judge_max_concurrency: DEFAULT_JUDGE_MAX_CONCURRENCY,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            auth_token: std::env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.into()),
            ),
            inference_endpoint: env_string("INFERENCE_ENDPOINT", DEFAULT_INFERENCE_ENDPOINT),
            inference_backend: env_parse("INFERENCE_BACKEND", BackendKind::Ollama),
            default_model: env_string("DEFAULT_MODEL", DEFAULT_MODEL),
            max_concurrency: env_parse("MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY).max(1),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT),
            max_attempts: env_parse("MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS).max(1),
            backoff_base_ms: env_parse("BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS),
            backoff_max_ms: env_parse("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            judge_endpoint: env_string("JUDGE_ENDPOINT", DEFAULT_JUDGE_ENDPOINT),
            judge_backend: env_parse("JUDGE_BACKEND", BackendKind::OpenAi),
            judge_model: env_string("JUDGE_MODEL", DEFAULT_JUDGE_MODEL),
            judge_api_key: std::env::var("JUDGE_API_KEY").ok().filter(|k| !k.is_empty()),
            judge_max_concurrency: env_parse("JUDGE_MAX_CONCURRENCY", DEFAULT_JUDGE_MAX_CONCURRENCY)
                .max(1),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    /// The judge shares the inference admission gate unless it lives on a
    /// different host.
    pub fn judge_shares_gate(&self) -> bool {
        origin(&self.inference_endpoint) == origin(&self.judge_endpoint)
    }

    pub fn print_banner(&self) {
        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║           promptbench v{}                    ║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Port:              {:<28}║", self.port);
        tracing::info!("║  Auth:              {:<28}║", if self.auth_token.is_some() { "enabled" } else { "disabled" });
        tracing::info!("║  Data dir:          {:<28}║", self.data_dir.display());
        tracing::info!("║  Backend:           {:<28}║", format!("{:?}", self.inference_backend));
        tracing::info!("║  Default model:     {:<28}║", self.default_model);
        tracing::info!("║  Max concurrency:   {:<28}║", self.max_concurrency);
        tracing::info!("║  Request timeout:   {:<25}s ║", self.request_timeout_secs);
        tracing::info!("║  Max attempts:      {:<28}║", self.max_attempts);
        tracing::info!("║  Backoff:           {:<28}║", format!("{}ms..{}ms", self.backoff_base_ms, self.backoff_max_ms));
        tracing::info!("║  Judge model:       {:<28}║", self.judge_model);
        tracing::info!("║  Judge gate:        {:<28}║", if self.judge_shares_gate() { "shared".to_string() } else { format!("separate ({})", self.judge_max_concurrency) });
        tracing::info!("╚══════════════════════════════════════════════════╝");
        tracing::info!("Inference endpoint: {}", self.inference_endpoint);
        tracing::info!("Judge endpoint:     {}", self.judge_endpoint);
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// `scheme://host[:port]` of an endpoint URL, lower-cased.
fn origin(url: &str) -> String {
    let (scheme, rest) = url.split_once("://").unwrap_or(("", url));
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    format!("{}://{}", scheme, authority).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(cfg.inference_backend, BackendKind::Ollama);
        assert_eq!(cfg.retry_policy().max_attempts, 3);
        assert_eq!(cfg.retry_policy().max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_env_parse_fallback() {
        assert_eq!(env_parse::<u16>("NONEXISTENT_VAR_XYZ", 42), 42);
        assert_eq!(env_string("NONEXISTENT_VAR_XYZ", "x"), "x");
    }

    #[test]
    fn test_origin_comparison() {
        assert_eq!(
            origin("http://LOCALHOST:11434/api/generate"),
            "http://localhost:11434"
        );
        let mut cfg = Config::default();
        assert!(!cfg.judge_shares_gate());
        cfg.judge_endpoint = "http://localhost:11434/v1/chat/completions".into();
        assert!(cfg.judge_shares_gate());
    }
}
