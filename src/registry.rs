use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::model::{InferenceStatus, RunId, RunStatus};

const EVENT_BUFFER: usize = 256;

/// Progress notification for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Snapshot {
        run_id: RunId,
        status: RunStatus,
        completed: usize,
        total: usize,
    },
    ItemFinished {
        run_id: RunId,
        index: usize,
        outcome: InferenceStatus,
        completed: usize,
        total: usize,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        completed: usize,
        total: usize,
    },
}

impl ProgressEvent {
    pub fn completed(&self) -> usize {
        match self {
            Self::Snapshot { completed, .. }
            | Self::ItemFinished { completed, .. }
            | Self::RunFinished { completed, .. } => *completed,
        }
    }

    pub fn total(&self) -> usize {
        match self {
            Self::Snapshot { total, .. }
            | Self::ItemFinished { total, .. }
            | Self::RunFinished { total, .. } => *total,
        }
    }

    pub fn is_final(&self) -> bool {
        match self {
            Self::RunFinished { .. } => true,
            Self::Snapshot { status, .. } => status.is_terminal(),
            Self::ItemFinished { .. } => false,
        }
    }
}

/// A run currently being executed by this process.
pub struct ActiveRun {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    cancel: watch::Sender<bool>,
    events_tx: broadcast::Sender<ProgressEvent>,
    finished: watch::Sender<Option<RunStatus>>,
}

impl ActiveRun {
    fn new(run_id: RunId) -> Self {
        let (cancel, _) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (finished, _) = watch::channel(None);
        Self {
            run_id,
            started_at: Utc::now(),
            cancel,
            events_tx,
            finished,
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn cancel_rx(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events_tx.subscribe()
    }

    /// Never blocks; events are dropped when nobody listens.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn mark_finished(&self, status: RunStatus) {
        self.finished.send_replace(Some(status));
    }

    /// Wait until the runner has written the run's terminal status.
    pub async fn wait(&self) -> RunStatus {
        let mut rx = self.finished.subscribe();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => status.unwrap_or(RunStatus::Failed),
            Err(_) => RunStatus::Failed,
        };
        status
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveRunSummary {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

#[derive(Default)]
pub struct RunRegistry {
    runs: DashMap<RunId, Arc<ActiveRun>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a run for execution. A run can only be executed once at a time.
    pub fn register(&self, run_id: &str) -> Result<Arc<ActiveRun>> {
        match self.runs.entry(run_id.to_string()) {
            Entry::Occupied(_) => Err(EngineError::InvalidState(format!(
                "run {} is already executing",
                run_id
            ))),
            Entry::Vacant(slot) => {
                let active = Arc::new(ActiveRun::new(run_id.to_string()));
                slot.insert(active.clone());
                debug!(run_id, "Registered active run");
                Ok(active)
            }
        }
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<ActiveRun>> {
        self.runs.get(run_id).map(|r| r.value().clone())
    }

    pub fn remove(&self, run_id: &str) -> Option<Arc<ActiveRun>> {
        self.runs.remove(run_id).map(|(_, r)| r)
    }

    pub fn active_count(&self) -> usize {
        self.runs.len()
    }

    pub fn cancel(&self, run_id: &str) -> bool {
        match self.get(run_id) {
            Some(active) => {
                active.request_cancel();
                info!(run_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> Vec<Arc<ActiveRun>> {
        let all: Vec<Arc<ActiveRun>> = self.runs.iter().map(|e| e.value().clone()).collect();
        for active in &all {
            active.request_cancel();
        }
        all
    }

    pub fn list(&self) -> Vec<ActiveRunSummary> {
        let mut out: Vec<ActiveRunSummary> = self
            .runs
            .iter()
            .map(|entry| {
                let r = entry.value();
                ActiveRunSummary {
                    run_id: r.run_id.clone(),
                    started_at: r.started_at,
                    cancel_requested: r.is_cancelled(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }
}
