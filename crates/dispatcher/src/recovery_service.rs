use ddl_core::logging::DdlEventLogger;
use ddl_domain::{reduce_job_state, DdlResult, Job, TaskState};
use tracing::{info, warn};

use crate::context::EngineContext;

/// 一次恢复扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub jobs_scanned: usize,
    pub jobs_resumed: usize,
    /// 从RUNNING重置为READY的子任务数
    pub tasks_reset: usize,
    /// 由其他节点持有或本节点正在驱动的任务
    pub skipped: usize,
    pub errors: Vec<(i64, String)>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// 接管任务后、重新驱动前的状态整理
///
/// 被中断的RUNNING子任务重置为READY（重新执行是安全的空操作），
/// 然后按子任务状态重新归约任务状态。返回重置的子任务数。
pub async fn prepare_for_resume(engine: &EngineContext, mut job: Job) -> DdlResult<usize> {
    let mut reset = Vec::new();
    for task in job.tasks.iter_mut() {
        if task.state == TaskState::Running {
            task.set_state(TaskState::Ready)?;
            DdlEventLogger::log_task_state_changed(
                task.job_id,
                task.task_id,
                &task.task_type,
                TaskState::Running.as_str(),
                TaskState::Ready.as_str(),
            );
            reset.push(task.clone());
        }
    }
    if !reset.is_empty() {
        engine.repository.update_tasks(&reset).await?;
    }

    let reconciled = reduce_job_state(job.state, &job.task_states());
    if reconciled != job.state {
        if job.state.can_transition_to(reconciled) {
            info!(
                "DDL任务 {} 的状态按子任务归约为 {} (原状态 {})",
                job.job_id, reconciled, job.state
            );
            engine
                .repository
                .update_job_state(job.job_id, reconciled, None)
                .await?;
        } else {
            warn!(
                "DDL任务 {} 的状态 {} 无法直接归约为 {}，保持不变",
                job.job_id, job.state, reconciled
            );
        }
    }
    Ok(reset.len())
}
