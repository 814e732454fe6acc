//! Automated grading of responses by a judge model.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::debug;

use crate::error::CallError;
use crate::inference::{CompletionRequest, InferenceClient};
use crate::model::{Validation, Verdict};

pub const UNPARSEABLE_REASON: &str = "unparseable judge response";

const MAX_OBJECT_STARTS: usize = 32;
const MAX_REASON_CHARS: usize = 500;

const SYSTEM_PROMPT: &str = "You are a validation assistant. Your task is to validate if the \
model's response is the correct output.\n\n\
Evaluate whether the model's response is correct. You do not need to worry about punctuation \
or capitalization, however otherwise the answer must be in the requested format.\n\
Respond with a JSON object containing:\n\
- reason: brief explanation of your assessment\n\
- valid: boolean indicating if the response is valid\n\
- format_fail: boolean indicating if there was a formatting issue\n\
Example:\n\
{\n  \"reason\": \"The response names the same street address as the context.\",\n  \
\"valid\": true,\n  \"format_fail\": false\n}\n";

#[derive(Debug, Clone, PartialEq)]
pub struct Graded {
    pub verdict: Verdict,
    pub reason: String,
}

/// A judge model reachable through its own [`InferenceClient`].
#[derive(Clone)]
pub struct Judge {
    client: InferenceClient,
    endpoint: String,
    model: String,
}

impl Judge {
    pub fn new(client: InferenceClient, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask the judge about one response. Transport failures are retried by
    /// the client; a reply that cannot be read yields a `skipped` verdict.
    pub async fn grade(
        &self,
        prompt: &str,
        context: &str,
        response: &str,
    ) -> Result<Validation, CallError> {
        let request = CompletionRequest::new(
            self.model.as_str(),
            format!(
                "Prompt:\n{}\n{}\n\n\nResponse to validate:\n{}",
                prompt, context, response
            ),
        )
        .with_system(SYSTEM_PROMPT);

        let completion = self.client.call(&self.endpoint, &request).await?;
        let reply = completion.text;
        let validation = match parse_reply(&reply) {
            Some(graded) => Validation::automated(
                graded.verdict,
                graded.reason,
                Some(self.model.clone()),
                Some(reply),
            ),
            None => {
                debug!(model = %self.model, "Judge reply had no recognizable verdict");
                Validation::automated(
                    Verdict::Skipped,
                    UNPARSEABLE_REASON,
                    Some(self.model.clone()),
                    Some(reply),
                )
            }
        };
        Ok(validation)
    }
}

/// Read a verdict out of free-form judge output.
pub fn parse_reply(reply: &str) -> Option<Graded> {
    let reply = reply.trim();
    if reply.is_empty() {
        return None;
    }
    if let Some(graded) = from_json(reply) {
        return Some(graded);
    }
    let verdict = from_token(reply).or_else(|| from_bare_word(reply))?;
    Some(Graded {
        verdict,
        reason: clip(reply),
    })
}

fn from_json(reply: &str) -> Option<Graded> {
    for (start, _) in reply.match_indices('{').take(MAX_OBJECT_STARTS) {
        let mut stream = serde_json::Deserializer::from_str(&reply[start..]).into_iter::<Value>();
        let Some(Ok(Value::Object(obj))) = stream.next() else {
            continue;
        };
        if let Some(verdict) = object_verdict(&obj) {
            let reason = ["reason", "rationale", "justification", "explanation"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| clip(reply));
            return Some(Graded { verdict, reason });
        }
    }
    None
}

fn object_verdict(obj: &Map<String, Value>) -> Option<Verdict> {
    for key in ["valid", "passed", "pass"] {
        if let Some(b) = obj.get(key).and_then(Value::as_bool) {
            return Some(if b { Verdict::Pass } else { Verdict::Fail });
        }
    }
    for key in ["verdict", "status", "result"] {
        if let Some(v) = obj.get(key).and_then(Value::as_str).and_then(word_verdict) {
            return Some(v);
        }
    }
    None
}

fn word_verdict(word: &str) -> Option<Verdict> {
    match word.trim().to_ascii_lowercase().as_str() {
        "pass" | "passed" | "valid" => Some(Verdict::Pass),
        "fail" | "failed" | "invalid" => Some(Verdict::Fail),
        _ => None,
    }
}

fn from_token(reply: &str) -> Option<Verdict> {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    let re = TOKEN.get_or_init(|| {
        Regex::new(
            r#"(?i)\b(?:verdict|result|status|grade)\b\s*[:=\-]?\s*\**\s*"?(pass(?:ed)?|fail(?:ed)?|valid|invalid)\b"#,
        )
        .expect("verdict token regex is valid")
    });
    re.captures(reply)
        .and_then(|c| c.get(1))
        .and_then(|m| word_verdict(m.as_str()))
}

fn from_bare_word(reply: &str) -> Option<Verdict> {
    static PASS: OnceLock<Regex> = OnceLock::new();
    static FAIL: OnceLock<Regex> = OnceLock::new();
    let pass = PASS
        .get_or_init(|| Regex::new(r"\bPASS\b").expect("PASS regex is valid"))
        .is_match(reply);
    let fail = FAIL
        .get_or_init(|| Regex::new(r"\bFAIL\b").expect("FAIL regex is valid"))
        .is_match(reply);
    match (pass, fail) {
        (true, false) => Some(Verdict::Pass),
        (false, true) => Some(Verdict::Fail),
        _ => None,
    }
}

fn clip(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(MAX_REASON_CHARS) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
