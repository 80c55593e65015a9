//! DDL引擎的指标采集
//!
//! 通过 `metrics` 门面记录，由宿主进程决定是否安装导出器。

use metrics::{counter, gauge, histogram, Counter, Gauge};
use tracing::debug;

pub struct DdlMetrics {
    jobs_submitted_total: Counter,
    running_jobs: Gauge,
    sync_unreachable_total: Counter,
    cdc_marks_total: Counter,
}

impl Default for DdlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DdlMetrics {
    pub fn new() -> Self {
        Self {
            jobs_submitted_total: counter!("ddl_jobs_submitted_total"),
            running_jobs: gauge!("ddl_running_jobs"),
            sync_unreachable_total: counter!("ddl_sync_unreachable_nodes_total"),
            cdc_marks_total: counter!("ddl_cdc_marks_total"),
        }
    }

    pub fn record_job_submitted(&self, ddl_type: &str) {
        self.jobs_submitted_total.increment(1);
        counter!("ddl_jobs_submitted_by_type_total", "ddl_type" => ddl_type.to_string())
            .increment(1);
    }

    pub fn job_started(&self) {
        self.running_jobs.increment(1.0);
    }

    pub fn record_job_finished(&self, state: &str, duration_seconds: f64) {
        self.running_jobs.decrement(1.0);
        counter!("ddl_jobs_finished_total", "state" => state.to_string()).increment(1);
        histogram!("ddl_job_duration_seconds", "state" => state.to_string())
            .record(duration_seconds);
        debug!(state, duration_seconds, "记录DDL任务结束指标");
    }

    pub fn record_task_attempt(&self, task_type: &str, outcome: &str, duration_seconds: f64) {
        counter!(
            "ddl_task_attempts_total",
            "task_type" => task_type.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
        histogram!("ddl_task_duration_seconds", "task_type" => task_type.to_string())
            .record(duration_seconds);
    }

    pub fn record_task_retry(&self, task_type: &str) {
        counter!("ddl_task_retries_total", "task_type" => task_type.to_string()).increment(1);
    }

    pub fn record_rollback(&self, task_type: &str, succeeded: bool) {
        let outcome = if succeeded { "success" } else { "failed" };
        counter!(
            "ddl_task_rollbacks_total",
            "task_type" => task_type.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn record_sync_unreachable(&self, nodes: usize) {
        self.sync_unreachable_total.increment(nodes as u64);
    }

    pub fn record_cdc_mark(&self) {
        self.cdc_marks_total.increment(1);
    }
}
