use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{InferenceStatus, Run, Verdict, VerdictSource};

/// Point-in-time aggregate of a run. Ratios are fractions in `0..=1`
/// except `percent_complete`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    pub total: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub errored: usize,
    pub validated: usize,
    pub pass: usize,
    pub fail: usize,
    pub skipped: usize,
    pub manual: usize,
    pub automated: usize,
    pub percent_complete: f64,
    pub validation_ratio: f64,
    pub success_rate: f64,
    /// Verdict reasons of failed and skipped items.
    pub reasons: BTreeMap<String, usize>,
    /// Error details of errored items.
    pub errors: BTreeMap<String, usize>,
}

pub fn compute_stats(run: &Run) -> StatsSnapshot {
    let mut s = StatsSnapshot {
        total: run.items.len(),
        ..Default::default()
    };

    for item in &run.items {
        match item.status {
            InferenceStatus::Queued => s.queued += 1,
            InferenceStatus::InFlight => s.in_flight += 1,
            InferenceStatus::Succeeded => s.succeeded += 1,
            InferenceStatus::Errored => {
                s.errored += 1;
                let detail = item.error.as_deref().unwrap_or("").trim();
                *s.errors.entry(detail.to_string()).or_default() += 1;
            }
        }

        let validation = item.validation();
        if !validation.is_validated() {
            continue;
        }
        s.validated += 1;
        match validation.source {
            VerdictSource::Manual => s.manual += 1,
            VerdictSource::Automated => s.automated += 1,
            VerdictSource::None => {}
        }
        match validation.verdict {
            Verdict::Pass => s.pass += 1,
            Verdict::Fail => s.fail += 1,
            Verdict::Skipped => s.skipped += 1,
            Verdict::Unvalidated => {}
        }
        if matches!(validation.verdict, Verdict::Fail | Verdict::Skipped) {
            let reason = validation.reason.as_deref().unwrap_or("").trim();
            *s.reasons.entry(reason.to_string()).or_default() += 1;
        }
    }

    s.percent_complete = if s.total == 0 {
        100.0
    } else {
        (s.succeeded + s.errored) as f64 * 100.0 / s.total as f64
    };
    s.validation_ratio = ratio(s.validated, s.succeeded);
    s.success_rate = ratio(s.pass, s.pass + s.fail);
    s
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}
