//! The engine facade: every operation the HTTP layer (or an embedding
//! program) needs, addressed by explicit project names and run ids.

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Semaphore};
use tracing::{info, warn};

use crate::config::Config;
use crate::context::{from_strings, ContextSource};
use crate::error::{EngineError, Result};
use crate::inference::{CompletionBackend, HttpBackend, InferenceClient};
use crate::judge::Judge;
use crate::metrics::Metrics;
use crate::model::{ContextSet, Project, Prompt, Run, RunHeader, RunStatus, RunSummary};
use crate::registry::{ActiveRunSummary, ProgressEvent, RunRegistry};
use crate::runner::Runner;
use crate::stats::{compute_stats, StatsSnapshot};
use crate::store::RunStore;
use crate::validation::ValidationEngine;

/// Parameters of a new run beyond the bare minimum.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub project: String,
    /// Prompt template. May be empty when `prompt_id` names a stored prompt.
    pub prompt: String,
    pub prompt_id: Option<String>,
    pub contexts: ContextSet,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub source: Option<ContextSource>,
}

pub struct Engine {
    config: Arc<Config>,
    store: Arc<RunStore>,
    registry: Arc<RunRegistry>,
    runner: Runner,
    validation: ValidationEngine,
    metrics: Arc<Metrics>,
    gate: Arc<Semaphore>,
    started_at: Instant,
}

impl Engine {
    /// Open the engine with HTTP backends built from `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let timeout = config.request_timeout();
        let inference = Arc::new(HttpBackend::new(config.inference_backend, timeout, None)?);
        let judge = Arc::new(HttpBackend::new(
            config.judge_backend,
            timeout,
            config.judge_api_key.clone(),
        )?);
        Self::with_backends(config, inference, judge).await
    }

    pub async fn with_backends(
        config: Config,
        inference: Arc<dyn CompletionBackend>,
        judge: Arc<dyn CompletionBackend>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let store = Arc::new(RunStore::open(&config.data_dir).await?);
        let registry = Arc::new(RunRegistry::new());
        let metrics = Metrics::new();

        let gate = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let judge_gate = if config.judge_shares_gate() {
            gate.clone()
        } else {
            Arc::new(Semaphore::new(config.judge_max_concurrency.max(1)))
        };

        let policy = config.retry_policy();
        let timeout = config.request_timeout();
        let runner = Runner::new(
            store.clone(),
            InferenceClient::new(inference, policy, timeout),
            gate.clone(),
            registry.clone(),
            metrics.clone(),
        );
        let judge = Judge::new(
            InferenceClient::new(judge, policy, timeout),
            config.judge_endpoint.clone(),
            config.judge_model.clone(),
        );
        let validation = ValidationEngine::new(store.clone(), judge, judge_gate, metrics.clone());

        Ok(Self {
            config,
            store,
            registry,
            runner,
            validation,
            metrics,
            gate,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn validation(&self) -> &ValidationEngine {
        &self.validation
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }

    pub fn active_runs(&self) -> Vec<ActiveRunSummary> {
        self.registry.list()
    }

    // ---- projects & prompts ----

    pub async fn create_project(&self, name: &str) -> Result<Project> {
        self.store.create_project(name).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.store.list_projects().await
    }

    /// Delete a project and its runs, stopping any of them still executing.
    pub async fn delete_project(&self, name: &str) -> Result<usize> {
        for summary in self.store.list_runs(name).await? {
            if let Some(active) = self.registry.get(&summary.id) {
                active.request_cancel();
                active.wait().await;
            }
        }
        self.store.delete_project(name).await
    }

    pub async fn add_prompt(&self, project: &str, text: &str) -> Result<Prompt> {
        if text.trim().is_empty() {
            return Err(EngineError::InvalidDocument("prompt text is empty".into()));
        }
        self.store.add_prompt(project, text).await
    }

    pub async fn list_prompts(&self, project: &str) -> Result<Vec<Prompt>> {
        self.store.get_project(project).await?;
        self.store.list_prompts(project).await
    }

    // ---- runs ----

    pub async fn create_run(
        &self,
        project: &str,
        prompt: &str,
        contexts: ContextSet,
        model: &str,
    ) -> Result<Run> {
        self.create_run_with(NewRun {
            project: project.to_string(),
            prompt: prompt.to_string(),
            prompt_id: None,
            contexts,
            model: Some(model.to_string()),
            endpoint: None,
            source: None,
        })
        .await
    }

    pub async fn create_run_with(&self, new: NewRun) -> Result<Run> {
        let prompt = match (&new.prompt_id, new.prompt.trim().is_empty()) {
            (Some(id), true) => self
                .store
                .list_prompts(&new.project)
                .await?
                .into_iter()
                .find(|p| &p.id == id)
                .map(|p| p.text)
                .ok_or_else(|| {
                    EngineError::NotFound(format!("prompt {} in project '{}'", id, new.project))
                })?,
            (None, true) => {
                return Err(EngineError::InvalidDocument("prompt text is empty".into()));
            }
            (_, false) => new.prompt.clone(),
        };

        let header = RunHeader {
            id: uuid::Uuid::new_v4().to_string(),
            project: new.project,
            prompt_id: new.prompt_id,
            prompt,
            endpoint: new
                .endpoint
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| self.config.inference_endpoint.clone()),
            model: new
                .model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| self.config.default_model.clone()),
            context_digest: new.contexts.digest().to_string(),
            created_at: Utc::now(),
            source: new.source,
        };
        self.store.create_run(header, new.contexts.into_vec()).await
    }

    /// Convenience for callers holding raw context strings.
    pub async fn create_run_from_strings(
        &self,
        project: &str,
        prompt: &str,
        contexts: Vec<String>,
        model: &str,
    ) -> Result<Run> {
        self.create_run(project, prompt, from_strings(contexts)?, model)
            .await
    }

    /// Begin executing a freshly created run.
    pub async fn start_run(&self, run_id: &str) -> Result<()> {
        let run = self.store.load(run_id).await?;
        if run.status != RunStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "run {} is {:?}; only pending runs can be started",
                run_id, run.status
            )));
        }
        self.runner.spawn(run_id).await?;
        Ok(())
    }

    /// Continue a run interrupted by a restart. Finished items are kept.
    pub async fn resume_run(&self, run_id: &str) -> Result<()> {
        self.runner.spawn(run_id).await?;
        info!(run_id, "Resumed run");
        Ok(())
    }

    /// Start (if needed) and wait for the run to reach a terminal status.
    pub async fn run_to_completion(&self, run_id: &str) -> Result<Run> {
        let active = match self.registry.get(run_id) {
            Some(active) => active,
            None => {
                let run = self.store.load(run_id).await?;
                if run.status.is_terminal() {
                    return Ok(run);
                }
                self.runner.spawn(run_id).await?
            }
        };
        active.wait().await;
        self.store.load(run_id).await
    }

    /// Request cancellation. Returns false when the run had already
    /// finished, or had nothing left to run and was settled as completed.
    pub async fn cancel_run(&self, run_id: &str) -> Result<bool> {
        let run = self.store.load(run_id).await?;
        if self.registry.cancel(run_id) {
            return Ok(true);
        }
        if run.status.is_terminal() {
            return Ok(false);
        }
        if run.all_items_finished() {
            return match self.store.set_status(run_id, RunStatus::Completed, None).await {
                Ok(_) | Err(EngineError::InvalidState(_)) => Ok(false),
                Err(e) => Err(e),
            };
        }
        // Not executing in this process: record the cancellation directly.
        match self.store.set_status(run_id, RunStatus::Cancelled, None).await {
            Ok(_) => Ok(true),
            Err(EngineError::InvalidState(_)) => Ok(self.registry.cancel(run_id)),
            Err(e) => Err(e),
        }
    }

    pub async fn load_run(&self, run_id: &str) -> Result<Run> {
        self.store.load(run_id).await
    }

    pub async fn list_runs(&self, project: &str) -> Result<Vec<RunSummary>> {
        self.store.get_project(project).await?;
        self.store.list_runs(project).await
    }

    pub async fn stats(&self, run_id: &str) -> Result<StatsSnapshot> {
        Ok(compute_stats(&self.store.load(run_id).await?))
    }

    /// Runs left `running` by an earlier process.
    pub async fn interrupted_runs(&self) -> Result<Vec<RunSummary>> {
        let mut runs: Vec<RunSummary> = self
            .store
            .all_runs()
            .await?
            .into_iter()
            .filter(|r| r.status == RunStatus::Running && self.registry.get(&r.id).is_none())
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    /// Progress of a run as a finite stream. The first event is a snapshot
    /// of stored state; the stream ends after a terminal status is seen, or
    /// right after the snapshot when the run is not executing.
    pub async fn stream_progress(&self, run_id: &str) -> Result<BoxStream<'static, ProgressEvent>> {
        // Subscribe before reading so no event between the two is lost.
        let rx = self.registry.get(run_id).map(|active| active.subscribe());
        let run = self.store.load(run_id).await?;

        let state = ProgressState {
            store: self.store.clone(),
            run_id: run_id.to_string(),
            pending: Some(snapshot(&run)),
            rx,
        };
        Ok(stream::unfold(state, ProgressState::next).boxed())
    }

    /// Cancel every executing run and wait for each to settle.
    pub async fn shutdown(&self) {
        let active = self.registry.cancel_all();
        if !active.is_empty() {
            info!("Waiting for {} active runs to drain", active.len());
        }
        for run in active {
            let status = run.wait().await;
            info!(run_id = %run.run_id, ?status, "Run settled for shutdown");
        }
    }
}

fn snapshot(run: &Run) -> ProgressEvent {
    ProgressEvent::Snapshot {
        run_id: run.id().to_string(),
        status: run.status,
        completed: run.finished_count(),
        total: run.items.len(),
    }
}

struct ProgressState {
    store: Arc<RunStore>,
    run_id: String,
    pending: Option<ProgressEvent>,
    rx: Option<broadcast::Receiver<ProgressEvent>>,
}

impl ProgressState {
    async fn next(mut self) -> Option<(ProgressEvent, Self)> {
        if let Some(event) = self.pending.take() {
            if event.is_final() {
                self.rx = None;
            }
            return Some((event, self));
        }

        let rx = self.rx.as_mut()?;
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(run_id = %self.run_id, skipped, "Progress subscriber lagged; resyncing");
                self.reload().await?
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.rx = None;
                self.reload().await?
            }
        };
        if event.is_final() {
            self.rx = None;
        }
        Some((event, self))
    }

    async fn reload(&self) -> Option<ProgressEvent> {
        match self.store.load(&self.run_id).await {
            Ok(run) => Some(snapshot(&run)),
            Err(e) => {
                warn!(run_id = %self.run_id, "Progress stream ended: {}", e);
                None
            }
        }
    }
}
