use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::inference::InferenceClient;
use crate::metrics::Metrics;
use crate::model::{render_prompt, InferenceStatus, ItemResult, Run, RunStatus};
use crate::registry::{ActiveRun, ProgressEvent, RunRegistry};
use crate::store::RunStore;

/// Executes runs: one outbound call per unfinished item, bounded by the
/// shared admission gate.
#[derive(Clone)]
pub struct Runner {
    store: Arc<RunStore>,
    client: InferenceClient,
    gate: Arc<Semaphore>,
    registry: Arc<RunRegistry>,
    metrics: Arc<Metrics>,
}

impl Runner {
    pub fn new(
        store: Arc<RunStore>,
        client: InferenceClient,
        gate: Arc<Semaphore>,
        registry: Arc<RunRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            client,
            gate,
            registry,
            metrics,
        }
    }

    /// Start executing a non-terminal run in the background. Items that
    /// already finished are left alone, so this also resumes interrupted
    /// runs.
    pub async fn spawn(&self, run_id: &str) -> Result<Arc<ActiveRun>> {
        let run = self.store.load(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "run {} is already {:?}",
                run_id, run.status
            )));
        }
        let active = self.registry.register(run_id)?;

        let runner = self.clone();
        let handle = active.clone();
        tokio::spawn(async move {
            runner.execute(run, handle).await;
        });
        Ok(active)
    }

    async fn execute(&self, run: Run, active: Arc<ActiveRun>) {
        let run_id = run.id().to_string();
        let total = run.items.len();
        let start = Instant::now();
        self.metrics.start_run();

        let (status, completed) = match self.drive(&run, &active).await {
            Ok(completed) => {
                let status = if completed == total {
                    RunStatus::Completed
                } else {
                    RunStatus::Cancelled
                };
                (self.finish(&run_id, status, None).await, completed)
            }
            Err((e, completed)) => {
                error!(run_id = %run_id, "Run aborted: {}", e);
                (
                    self.finish(&run_id, RunStatus::Failed, Some(e.to_string()))
                        .await,
                    completed,
                )
            }
        };

        self.metrics.finish_run(status);
        info!(
            run_id = %run_id,
            ?status,
            completed,
            total,
            duration_ms = start.elapsed().as_millis() as u64,
            "Run finished"
        );
        active.emit(ProgressEvent::RunFinished {
            run_id: run_id.clone(),
            status,
            completed,
            total,
        });
        active.mark_finished(status);
        self.registry.remove(&run_id);
    }

    /// Write the terminal status. When the store refuses it, settle on
    /// what the stored run allows: completed once every item finished,
    /// failed otherwise.
    async fn finish(&self, run_id: &str, status: RunStatus, failure: Option<String>) -> RunStatus {
        let err = match self.store.set_status(run_id, status, failure).await {
            Ok(run) => return run.status,
            Err(e) => e,
        };
        warn!(run_id, ?status, "Could not record terminal status: {}", err);
        let fallback = match self.store.load(run_id).await {
            Ok(run) if run.status.is_terminal() => return run.status,
            Ok(run) if run.all_items_finished() => RunStatus::Completed,
            _ => RunStatus::Failed,
        };
        if fallback == status {
            return fallback;
        }
        let failure = (fallback == RunStatus::Failed).then(|| err.to_string());
        match self.store.set_status(run_id, fallback, failure).await {
            Ok(run) => run.status,
            Err(e) => {
                error!(run_id, ?fallback, "Could not record fallback status: {}", e);
                fallback
            }
        }
    }

    /// Dispatch every unfinished item and wait for all in-flight calls.
    /// Returns the number of finished items; on a storage failure, the
    /// error together with that count.
    async fn drive(
        &self,
        run: &Run,
        active: &ActiveRun,
    ) -> std::result::Result<usize, (EngineError, usize)> {
        let run_id = run.id().to_string();
        let total = run.items.len();
        let mut completed = run.finished_count();

        if run.status != RunStatus::Running {
            if let Err(e) = self.store.set_status(&run_id, RunStatus::Running, None).await {
                return Err((e, completed));
            }
        }

        let mut queue = run.items.iter().filter(|i| !i.status.is_terminal());
        let mut next = queue.next();
        let mut cancel_rx = active.cancel_rx();
        let mut tasks: JoinSet<Result<ItemOutcome>> = JoinSet::new();
        let mut fatal: Option<EngineError> = None;

        info!(
            run_id = %run_id,
            pending = total - completed,
            total,
            "Dispatching run"
        );

        loop {
            if next.is_none() && tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match settle(joined) {
                        Ok((index, outcome, duration_ms)) => {
                            completed += 1;
                            self.metrics.record_item(outcome, duration_ms);
                            active.emit(ProgressEvent::ItemFinished {
                                run_id: run_id.clone(),
                                index,
                                outcome,
                                completed,
                                total,
                            });
                        }
                        Err(e) => {
                            error!(run_id = %run_id, "Item task failed: {}", e);
                            fatal.get_or_insert(e);
                            next = None;
                        }
                    }
                }

                permit = self.gate.clone().acquire_owned(), if next.is_some() => {
                    let Ok(permit) = permit else {
                        fatal.get_or_insert(EngineError::InvalidState("admission gate is closed".into()));
                        next = None;
                        continue;
                    };
                    if *cancel_rx.borrow() {
                        next = None;
                        continue;
                    }
                    let Some(item) = next else { continue };

                    if let Err(e) = self.store.mark_dispatched(&run_id, item.index).await {
                        error!(run_id = %run_id, index = item.index, "Failed to mark item dispatched: {}", e);
                        fatal.get_or_insert(e);
                        next = None;
                        continue;
                    }

                    let index = item.index;
                    let prompt = render_prompt(&run.header.prompt, &item.context);
                    let endpoint = run.header.endpoint.clone();
                    let model = run.header.model.clone();
                    let client = self.client.clone();
                    let store = self.store.clone();
                    let task_run_id = run_id.clone();
                    debug!(run_id = %run_id, index, "Dispatched item");

                    tasks.spawn(async move {
                        let started = Instant::now();
                        let call = AssertUnwindSafe(client.infer(&endpoint, &model, &prompt))
                            .catch_unwind()
                            .await;
                        drop(permit);
                        let duration_ms = started.elapsed().as_millis() as u64;
                        let result = match call {
                            Ok(Ok(c)) => ItemResult::succeeded(index, c.text, c.attempts, duration_ms),
                            Ok(Err(e)) => {
                                warn!(run_id = %task_run_id, index, "Inference failed: {}", e);
                                ItemResult::errored(index, e.to_string(), e.attempts(), duration_ms)
                            }
                            Err(_) => ItemResult::errored(
                                index,
                                "inference task panicked".into(),
                                1,
                                duration_ms,
                            ),
                        };
                        let outcome = result.status();
                        store.append_result(&task_run_id, result).await?;
                        Ok((index, outcome, duration_ms))
                    });

                    next = queue.next();
                }

                _ = async { let _ = cancel_rx.wait_for(|c| *c).await; }, if next.is_some() => {
                    info!(run_id = %run_id, in_flight = tasks.len(), "Cancellation observed; draining");
                    next = None;
                }
            }
        }

        match fatal {
            Some(e) => Err((e, completed)),
            None => Ok(completed),
        }
    }
}

type ItemOutcome = (usize, InferenceStatus, u64);

/// A task that died without reporting leaves its item unaccounted for,
/// which the run cannot recover from.
fn settle(joined: std::result::Result<Result<ItemOutcome>, JoinError>) -> Result<ItemOutcome> {
    joined.unwrap_or_else(|e| {
        Err(EngineError::InvalidState(format!(
            "item task did not complete: {}",
            e
        )))
    })
}
