use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::judge::Judge;
use crate::metrics::Metrics;
use crate::model::{InferenceStatus, Item, Validation, Verdict, VerdictSource};
use crate::store::RunStore;

pub const EMPTY_RESPONSE_REASON: &str = "empty response";

/// Outcome of [`ValidationEngine::validate_batch`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchValidation {
    pub start: usize,
    pub requested: usize,
    pub validated: usize,
    pub pass: usize,
    pub fail: usize,
    pub skipped: usize,
    pub errored: usize,
    pub success_rate: f64,
}

impl BatchValidation {
    fn tally(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Pass => self.pass += 1,
            Verdict::Fail => self.fail += 1,
            Verdict::Skipped => self.skipped += 1,
            Verdict::Unvalidated => return,
        }
        self.validated += 1;
    }
}

#[derive(Clone)]
pub struct ValidationEngine {
    store: Arc<RunStore>,
    judge: Judge,
    gate: Arc<Semaphore>,
    metrics: Arc<Metrics>,
}

impl ValidationEngine {
    pub fn new(store: Arc<RunStore>, judge: Judge, gate: Arc<Semaphore>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            judge,
            gate,
            metrics,
        }
    }

    /// Set a human verdict. Writing again overwrites the earlier one.
    pub async fn record_manual_verdict(
        &self,
        run_id: &str,
        index: usize,
        verdict: Verdict,
        reason: Option<String>,
    ) -> Result<Item> {
        if verdict == Verdict::Unvalidated {
            return Err(EngineError::InvalidState(
                "a manual verdict must be pass, fail or skipped".into(),
            ));
        }
        let item = self
            .store
            .record_verdict(run_id, index, Validation::manual(verdict, reason))
            .await?;
        self.metrics.record_verdict();
        info!(run_id, index, ?verdict, "Recorded manual verdict");
        Ok(item)
    }

    pub async fn skip(&self, run_id: &str, index: usize, reason: Option<String>) -> Result<Item> {
        self.record_manual_verdict(run_id, index, Verdict::Skipped, reason)
            .await
    }

    /// Grade one item with the judge model and store the verdict.
    pub async fn validate_automated(&self, run_id: &str, index: usize) -> Result<Item> {
        let run = self.store.load(run_id).await?;
        let item = run
            .item(index)
            .ok_or_else(|| EngineError::item_not_found(run_id, index))?;
        if item.status != InferenceStatus::Succeeded {
            return Err(EngineError::InvalidState(format!(
                "item {} of run {} is {:?}; only succeeded items can be validated",
                index, run_id, item.status
            )));
        }
        let response = item.response.clone().unwrap_or_default();

        let validation = {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| EngineError::InvalidState("admission gate is closed".into()))?;
            self.metrics.record_judge_call();
            debug!(run_id, index, model = %self.judge.model(), "Calling judge");
            self.judge
                .grade(&run.header.prompt, &item.context, &response)
                .await?
        };

        let verdict = validation.verdict;
        let item = self.store.record_verdict(run_id, index, validation).await?;
        self.metrics.record_verdict();
        info!(run_id, index, ?verdict, "Recorded automated verdict");
        Ok(item)
    }

    /// Validate up to `count` succeeded items that have no automated verdict
    /// yet, lowest index first, beginning at item `start`.
    pub async fn validate_batch(
        &self,
        run_id: &str,
        start: usize,
        count: usize,
    ) -> Result<BatchValidation> {
        self.validate_batch_with_progress(run_id, start, count, |_, _| {})
            .await
    }

    /// Like [`validate_batch`](Self::validate_batch), calling `on_progress`
    /// with `(done, total)` each time one picked item is settled.
    pub async fn validate_batch_with_progress<F>(
        &self,
        run_id: &str,
        start: usize,
        count: usize,
        on_progress: F,
    ) -> Result<BatchValidation>
    where
        F: Fn(usize, usize),
    {
        let run = self.store.load(run_id).await?;
        let candidates: Vec<&Item> = run
            .items
            .iter()
            .skip(start)
            .filter(|i| {
                i.status == InferenceStatus::Succeeded
                    && i.validation().source != VerdictSource::Automated
            })
            .take(count)
            .collect();

        let total = candidates.len();
        let mut done = 0;
        let mut summary = BatchValidation {
            start,
            requested: count,
            ..Default::default()
        };
        let mut tasks = JoinSet::new();

        for item in candidates {
            let blank = item
                .response
                .as_deref()
                .map_or(true, |r| r.trim().is_empty());
            if blank {
                let validation =
                    Validation::automated(Verdict::Skipped, EMPTY_RESPONSE_REASON, None, None);
                match self.store.record_verdict(run_id, item.index, validation).await {
                    Ok(_) => {
                        self.metrics.record_verdict();
                        summary.tally(Verdict::Skipped);
                    }
                    Err(e) => {
                        warn!(run_id, index = item.index, "Could not skip empty response: {}", e);
                        summary.errored += 1;
                    }
                }
                done += 1;
                on_progress(done, total);
                continue;
            }

            let engine = self.clone();
            let run_id = run_id.to_string();
            let index = item.index;
            tasks.spawn(async move { (index, engine.validate_automated(&run_id, index).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(item))) => summary.tally(item.verdict()),
                Ok((index, Err(e))) => {
                    warn!(run_id, index, "Automated validation failed: {}", e);
                    summary.errored += 1;
                }
                Err(e) => {
                    warn!(run_id, "Validation task panicked: {}", e);
                    summary.errored += 1;
                }
            }
            done += 1;
            debug!(run_id, done, total, "Batch validation progress");
            on_progress(done, total);
        }

        let decided = summary.pass + summary.fail;
        summary.success_rate = if decided == 0 {
            0.0
        } else {
            summary.pass as f64 / decided as f64
        };
        info!(
            run_id,
            validated = summary.validated,
            pass = summary.pass,
            fail = summary.fail,
            skipped = summary.skipped,
            errored = summary.errored,
            "Batch validation finished"
        );
        Ok(summary)
    }
}
