//! DDL任务仓储抽象
//!
//! 持久化的任务存储是唯一的事实来源，只有持有任务所有权的调度器会修改它

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ddl_errors::DdlResult;

use crate::dag::ExecutableJob;
use crate::entities::{Job, JobFilter, JobState, TaskRecord};

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 持久化新任务（QUEUED，子任务全部READY），job_id由存储单调分配
    async fn create_job(&self, job: &ExecutableJob) -> DdlResult<Job>;
    async fn get_job(&self, job_id: i64) -> DdlResult<Option<Job>>;
    /// 所有非终态的任务，按job_id升序
    async fn list_unfinished_jobs(&self) -> DdlResult<Vec<Job>>;
    async fn list_jobs(&self, filter: &JobFilter) -> DdlResult<Vec<Job>>;
    async fn update_job_state(
        &self,
        job_id: i64,
        state: JobState,
        error_message: Option<&str>,
    ) -> DdlResult<()>;
    async fn update_task(&self, task: &TaskRecord) -> DdlResult<()>;
    /// 原子地更新一组子任务（事务组一起提交）
    async fn update_tasks(&self, tasks: &[TaskRecord]) -> DdlResult<()>;
    /// 设置取消标记，任务不存在或已是终态时返回false
    async fn request_cancel(&self, job_id: i64) -> DdlResult<bool>;
    /// 删除更新时间早于 `before` 的终态任务，返回删除数量
    async fn purge_terminal_jobs(&self, before: DateTime<Utc>) -> DdlResult<u64>;
}
