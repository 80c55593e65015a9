//! 日志初始化与DDL结构化事件

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogConfig, LogFormat};

pub fn init_logging(config: &LogConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        LogFormat::Pretty => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
    }

    Ok(())
}

/// DDL引擎的结构化事件日志
pub struct DdlEventLogger;

impl DdlEventLogger {
    pub fn log_job_submitted(job_id: i64, schema_name: &str, ddl_type: &str, task_count: usize) {
        info!(
            event = "ddl_job_submitted",
            job.id = job_id,
            job.schema = schema_name,
            job.ddl_type = ddl_type,
            job.task_count = task_count,
            "DDL任务已提交"
        );
    }

    pub fn log_job_finished(job_id: i64, state: &str, duration_ms: u64) {
        info!(
            event = "ddl_job_finished",
            job.id = job_id,
            job.state = state,
            job.duration_ms = duration_ms,
            "DDL任务结束"
        );
    }

    pub fn log_task_state_changed(
        job_id: i64,
        task_id: i64,
        task_type: &str,
        from: &str,
        to: &str,
    ) {
        info!(
            event = "ddl_task_state_changed",
            job.id = job_id,
            task.id = task_id,
            task.type = task_type,
            task.from = from,
            task.to = to,
            "子任务状态变更"
        );
    }

    /// 回滚中止必须显式暴露给运维人员
    pub fn log_rollback_halted(job_id: i64, task_id: i64, task_type: &str, reason: &str) {
        error!(
            event = "ddl_rollback_halted",
            job.id = job_id,
            task.id = task_id,
            task.type = task_type,
            reason = reason,
            "回滚无法继续，任务进入ROLLBACK_FAILED，需要人工介入"
        );
    }

    pub fn log_sync_node_unreachable(node_id: &str, action: &str, attempts: u32, reason: &str) {
        warn!(
            event = "ddl_sync_node_unreachable",
            node.id = node_id,
            sync.action = action,
            sync.attempts = attempts,
            reason = reason,
            "同步节点不可达，跳过该节点"
        );
    }
}
