use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::context::ContextSource;

pub type RunId = String;

const CONTEXT_PLACEHOLDER: &str = "{context}";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InferenceStatus {
    Queued,
    InFlight,
    Succeeded,
    Errored,
}

impl InferenceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Errored)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    #[default]
    Unvalidated,
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    #[default]
    None,
    Manual,
    Automated,
}

/// Verdict fields of an item. Manual and automated verdicts share this one
/// shape, distinguished only by `source`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Validation {
    pub verdict: Verdict,
    pub source: VerdictSource,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_reply: Option<String>,
    #[serde(default)]
    pub validated_at: Option<DateTime<Utc>>,
}

impl Validation {
    pub fn manual(verdict: Verdict, reason: Option<String>) -> Self {
        Self {
            verdict,
            source: VerdictSource::Manual,
            reason,
            judge_model: None,
            judge_reply: None,
            validated_at: Some(Utc::now()),
        }
    }

    pub fn automated(
        verdict: Verdict,
        reason: impl Into<String>,
        judge_model: Option<String>,
        judge_reply: Option<String>,
    ) -> Self {
        Self {
            verdict,
            source: VerdictSource::Automated,
            reason: Some(reason.into()),
            judge_model,
            judge_reply,
            validated_at: Some(Utc::now()),
        }
    }

    pub fn is_validated(&self) -> bool {
        self.verdict != Verdict::Unvalidated
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub index: usize,
    pub context: String,
    pub response: Option<String>,
    pub status: InferenceStatus,
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    validation: Validation,
}

impl Item {
    pub fn queued(index: usize, context: String) -> Self {
        Self {
            index,
            context,
            response: None,
            status: InferenceStatus::Queued,
            error: None,
            attempts: 0,
            duration_ms: None,
            completed_at: None,
            validation: Validation::default(),
        }
    }

    /// Verdict fields only carry meaning once inference has succeeded.
    pub fn validation(&self) -> Validation {
        if self.status == InferenceStatus::Succeeded {
            self.validation.clone()
        } else {
            Validation::default()
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.validation().verdict
    }

    pub(crate) fn set_validation(&mut self, validation: Validation) {
        self.validation = validation;
    }

    pub(crate) fn apply_result(&mut self, result: &ItemResult) {
        match &result.outcome {
            Outcome::Succeeded { response } => {
                self.status = InferenceStatus::Succeeded;
                self.response = Some(response.clone());
                self.error = None;
            }
            Outcome::Errored { error } => {
                self.status = InferenceStatus::Errored;
                self.response = None;
                self.error = Some(error.clone());
            }
        }
        self.attempts = result.attempts;
        self.duration_ms = Some(result.duration_ms);
        self.completed_at = Some(result.completed_at);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { response: String },
    Errored { error: String },
}

/// Result of one item's inference, as appended to the run log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemResult {
    pub index: usize,
    pub outcome: Outcome,
    pub attempts: u32,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl ItemResult {
    pub fn succeeded(index: usize, response: String, attempts: u32, duration_ms: u64) -> Self {
        Self {
            index,
            outcome: Outcome::Succeeded { response },
            attempts,
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn errored(index: usize, error: String, attempts: u32, duration_ms: u64) -> Self {
        Self {
            index,
            outcome: Outcome::Errored { error },
            attempts,
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn status(&self) -> InferenceStatus {
        match self.outcome {
            Outcome::Succeeded { .. } => InferenceStatus::Succeeded,
            Outcome::Errored { .. } => InferenceStatus::Errored,
        }
    }
}

/// Ordered, immutable list of contexts produced by one import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSet {
    contexts: Vec<String>,
    digest: String,
}

impl ContextSet {
    pub fn new(contexts: Vec<String>) -> Self {
        let mut hasher = Sha256::new();
        for ctx in &contexts {
            hasher.update((ctx.len() as u64).to_le_bytes());
            hasher.update(ctx.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        Self { contexts, digest }
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.contexts
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn into_vec(self) -> Vec<String> {
        self.contexts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prompt {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Run-level metadata fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunHeader {
    pub id: RunId,
    pub project: String,
    #[serde(default)]
    pub prompt_id: Option<String>,
    pub prompt: String,
    pub endpoint: String,
    pub model: String,
    pub context_digest: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ContextSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    #[serde(flatten)]
    pub header: RunHeader,
    pub status: RunStatus,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
    pub items: Vec<Item>,
}

impl Run {
    pub fn new(header: RunHeader, contexts: Vec<String>) -> Self {
        let items = contexts
            .into_iter()
            .enumerate()
            .map(|(index, ctx)| Item::queued(index, ctx))
            .collect();
        Self {
            header,
            status: RunStatus::Pending,
            finished_at: None,
            failure: None,
            items,
        }
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn item(&self, index: usize) -> Option<&Item> {
        self.items.get(index)
    }

    pub fn finished_count(&self) -> usize {
        self.items.iter().filter(|i| i.status.is_terminal()).count()
    }

    pub fn all_items_finished(&self) -> bool {
        self.items.iter().all(|i| i.status.is_terminal())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.header.id.clone(),
            project: self.header.project.clone(),
            prompt_id: self.header.prompt_id.clone(),
            model: self.header.model.clone(),
            status: self.status,
            created_at: self.header.created_at,
            finished_at: self.finished_at,
            total: self.items.len(),
            finished: self.finished_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub id: RunId,
    pub project: String,
    pub prompt_id: Option<String>,
    pub model: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub finished: usize,
}

/// Substitute a context into a prompt template. A template without a
/// `{context}` placeholder gets the context appended under a heading.
pub fn render_prompt(template: &str, context: &str) -> String {
    if template.contains(CONTEXT_PLACEHOLDER) {
        template.replacen(CONTEXT_PLACEHOLDER, context, 1)
    } else {
        format!("{}\n\nContext:\n{}", template, context)
    }
}
