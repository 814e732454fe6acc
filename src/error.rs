use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Failure of one outbound call to a text-generation backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("no response within {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("backend rejected request (HTTP {status}): {message}")]
    Backend { status: u16, message: String },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<CallError> },

    /// A permanent failure that followed one or more retried ones.
    #[error("{last} (on attempt {attempts})")]
    Rejected { attempts: u32, last: Box<CallError> },
}

impl CallError {
    /// Connection and timeout failures are worth retrying; a backend
    /// rejection will be rejected again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Rejected { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// Attach the attempt count to a permanent failure seen after retries.
    pub(crate) fn on_attempt(self, attempt: u32) -> Self {
        if attempt <= 1 {
            return self;
        }
        Self::Rejected {
            attempts: attempt,
            last: Box::new(self),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed input at record {index}: {message}")]
    MalformedInput { index: usize, message: String },

    #[error("malformed input: {0}")]
    InvalidDocument(String),

    #[error("unsupported context source format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("project '{0}' already exists")]
    DuplicateName(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("corrupt run log {} at line {line}: {message}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    pub fn run_not_found(run_id: &str) -> Self {
        Self::NotFound(format!("run {}", run_id))
    }

    pub fn item_not_found(run_id: &str, index: usize) -> Self {
        Self::NotFound(format!("item {} of run {}", index, run_id))
    }

    pub fn project_not_found(name: &str) -> Self {
        Self::NotFound(format!("project '{}'", name))
    }

    /// Errors that mean the run log can no longer be trusted to be durable.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Serde(_) | Self::Corrupt { .. })
    }
}
