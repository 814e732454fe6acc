use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::model::{InferenceStatus, RunStatus};

#[derive(Debug, Default)]
pub struct Metrics {
    pub runs_started: AtomicU64,
    pub runs_active: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_cancelled: AtomicU64,
    pub runs_failed: AtomicU64,
    pub items_succeeded: AtomicU64,
    pub items_errored: AtomicU64,
    pub inference_duration_sum_ms: AtomicU64,
    pub verdicts_recorded: AtomicU64,
    pub judge_calls: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn start_run(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        self.runs_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_run(&self, status: RunStatus) {
        self.runs_active.fetch_sub(1, Ordering::Relaxed);
        let counter = match status {
            RunStatus::Completed => &self.runs_completed,
            RunStatus::Cancelled => &self.runs_cancelled,
            _ => &self.runs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item(&self, status: InferenceStatus, duration_ms: u64) {
        match status {
            InferenceStatus::Succeeded => self.items_succeeded.fetch_add(1, Ordering::Relaxed),
            _ => self.items_errored.fetch_add(1, Ordering::Relaxed),
        };
        self.inference_duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn record_verdict(&self) {
        self.verdicts_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_judge_call(&self) {
        self.judge_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let series: [(&str, &str, &str, &AtomicU64); 10] = [
            ("runs_started_total", "counter", "Runs started or resumed.", &self.runs_started),
            ("runs_active", "gauge", "Runs currently executing.", &self.runs_active),
            ("runs_completed_total", "counter", "Runs that finished every item.", &self.runs_completed),
            ("runs_cancelled_total", "counter", "Runs stopped by cancellation.", &self.runs_cancelled),
            ("runs_failed_total", "counter", "Runs stopped by a storage failure.", &self.runs_failed),
            ("items_succeeded_total", "counter", "Items whose inference succeeded.", &self.items_succeeded),
            ("items_errored_total", "counter", "Items whose inference errored.", &self.items_errored),
            ("inference_duration_ms_sum", "counter", "Sum of item inference durations in ms.", &self.inference_duration_sum_ms),
            ("verdicts_recorded_total", "counter", "Verdicts written, manual or automated.", &self.verdicts_recorded),
            ("judge_calls_total", "counter", "Calls made to the judge model.", &self.judge_calls),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in series {
            out.push_str(&format!(
                "# HELP promptbench_{name} {help}\n\
                 # TYPE promptbench_{name} {kind}\n\
                 promptbench_{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_lifecycle() {
        let m = Metrics::new();
        m.start_run();
        m.start_run();
        assert_eq!(m.runs_active.load(Ordering::Relaxed), 2);

        m.finish_run(RunStatus::Completed);
        m.finish_run(RunStatus::Cancelled);
        assert_eq!(m.runs_active.load(Ordering::Relaxed), 0);
        assert_eq!(m.runs_completed.load(Ordering::Relaxed), 1);
        assert_eq!(m.runs_cancelled.load(Ordering::Relaxed), 1);
        assert_eq!(m.runs_failed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_prometheus_output() {
        let m = Metrics::new();
        m.record_item(InferenceStatus::Succeeded, 40);
        m.record_item(InferenceStatus::Errored, 2);
        m.record_verdict();
        let out = m.render_prometheus();
        assert!(out.contains("promptbench_items_succeeded_total 1"));
        assert!(out.contains("promptbench_items_errored_total 1"));
        assert!(out.contains("promptbench_inference_duration_ms_sum 42"));
        assert!(out.contains("# TYPE promptbench_runs_active gauge"));
        assert!(out.contains("promptbench_verdicts_recorded_total 1"));
    }
}
