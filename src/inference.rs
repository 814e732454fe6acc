use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{CallError, EngineError};

const MAX_ERROR_BODY: usize = 500;
const MIN_BACKOFF_MS: u64 = 10;

/// Wire dialect spoken by a text-generation endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// `POST /api/generate` with `{"model","prompt","stream":false}`.
    #[default]
    Ollama,
    /// OpenAI-compatible `POST /v1/chat/completions`.
    OpenAi,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" | "open_ai" | "chat" => Ok(Self::OpenAi),
            other => Err(format!("unknown backend kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            prompt: prompt.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// One outbound generation call. Implementations make exactly one request
/// and never retry.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, endpoint: &str, request: &CompletionRequest)
        -> Result<String, CallError>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    kind: BackendKind,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(
        kind: BackendKind,
        timeout: Duration,
        api_key: Option<String>,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("promptbench/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(EngineError::Client)?;
        Ok(Self {
            client,
            kind,
            api_key,
        })
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        match self.kind {
            BackendKind::Ollama => {
                let mut body = json!({
                    "model": request.model,
                    "prompt": request.prompt,
                    "stream": false,
                });
                if let Some(ref system) = request.system {
                    body["system"] = json!(system);
                }
                body
            }
            BackendKind::OpenAi => {
                let mut messages = Vec::new();
                if let Some(ref system) = request.system {
                    messages.push(json!({ "role": "system", "content": system }));
                }
                messages.push(json!({ "role": "user", "content": request.prompt }));
                json!({
                    "model": request.model,
                    "messages": messages,
                })
            }
        }
    }

    fn extract_text(&self, reply: &Value) -> Option<String> {
        let text = match self.kind {
            BackendKind::Ollama => reply.get("response"),
            BackendKind::OpenAi => reply.pointer("/choices/0/message/content"),
        };
        text.and_then(|v| v.as_str()).map(str::to_string)
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn complete(
        &self,
        endpoint: &str,
        request: &CompletionRequest,
    ) -> Result<String, CallError> {
        let mut req = self.client.post(endpoint).json(&self.body(request));
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(classify_transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            return Err(CallError::Backend {
                status: status.as_u16(),
                message: backend_message(&text),
            });
        }

        let reply: Value = serde_json::from_str(&text).map_err(|e| CallError::Backend {
            status: status.as_u16(),
            message: format!("invalid JSON reply: {}", e),
        })?;

        self.extract_text(&reply).ok_or_else(|| CallError::Backend {
            status: status.as_u16(),
            message: format!("reply has no generated text: {}", truncate(&text)),
        })
    }
}

fn classify_transport(err: reqwest::Error) -> CallError {
    if err.is_timeout() {
        CallError::Timeout { after_ms: 0 }
    } else {
        CallError::Connection(err.to_string())
    }
}

/// Pull the backend's own message out of an error body when it has one.
fn backend_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        let msg = v
            .pointer("/error/message")
            .or_else(|| v.get("error"))
            .or_else(|| v.get("message"))
            .and_then(|m| m.as_str());
        if let Some(m) = msg {
            return truncate(m);
        }
    }
    truncate(body)
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_ERROR_BODY {
        return s.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the backoff after the given failed attempt (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Full-jitter backoff: uniform in `[0, ceiling]`, floored at a few ms.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling_ms = self.ceiling(attempt).as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(0..=ceiling_ms);
        Duration::from_millis(jittered.max(MIN_BACKOFF_MS.min(ceiling_ms)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub attempts: u32,
}

/// Retrying front for a [`CompletionBackend`]. Every attempt runs under a
/// hard deadline; only transient failures are retried.
#[derive(Clone)]
pub struct InferenceClient {
    backend: Arc<dyn CompletionBackend>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl InferenceClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            backend,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn infer(
        &self,
        endpoint: &str,
        model: &str,
        prompt: &str,
    ) -> Result<Completion, CallError> {
        self.call(endpoint, &CompletionRequest::new(model, prompt))
            .await
    }

    pub async fn call(
        &self,
        endpoint: &str,
        request: &CompletionRequest,
    ) -> Result<Completion, CallError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = match tokio::time::timeout(
                self.timeout,
                self.backend.complete(endpoint, request),
            )
            .await
            {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(CallError::Timeout { .. })) | Err(_) => Err(CallError::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                }),
                Ok(Err(e)) => Err(e),
            };

            match result {
                Ok(text) => {
                    debug!(
                        endpoint,
                        model = %request.model,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Completion received"
                    );
                    return Ok(Completion {
                        text,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let backoff = self.policy.backoff(attempt);
                    warn!(
                        endpoint,
                        model = %request.model,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient backend failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(CallError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e.on_attempt(attempt)),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake backend driven by the prompt text: any prompt containing a key
    /// of `scripted` pops the next scripted result for that key; anything
    /// else echoes the prompt back.
    #[derive(Default)]
    pub struct ScriptedBackend {
        scripted: Mutex<HashMap<String, VecDeque<Result<String, CallError>>>>,
        pub delay: Option<Duration>,
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub peak_in_flight: AtomicUsize,
    }

    impl ScriptedBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn script(self, key: &str, results: Vec<Result<String, CallError>>) -> Self {
            self.scripted
                .lock()
                .insert(key.to_string(), results.into_iter().collect());
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn peak(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            _endpoint: &str,
            request: &CompletionRequest,
        ) -> Result<String, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let scripted = {
                let mut map = self.scripted.lock();
                map.iter_mut()
                    .find(|(key, _)| request.prompt.contains(key.as_str()))
                    .and_then(|(_, queue)| queue.pop_front())
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            scripted.unwrap_or_else(|| Ok(format!("echo: {}", request.prompt)))
        }
    }
}
