use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ddl_domain::{ExecutableJob, Job, JobFilter, JobRepository, JobState, TaskRecord};
use ddl_errors::{DdlError, DdlResult};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct JobTable {
    last_job_id: i64,
    jobs: BTreeMap<i64, Job>,
}

/// 内存中的DDL任务存储，适用于测试和嵌入式部署场景
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    table: RwLock<JobTable>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job_count(&self) -> usize {
        self.table.read().await.jobs.len()
    }
}

fn apply_task_update(job: &mut Job, task: &TaskRecord) -> DdlResult<()> {
    let stored = job
        .task_mut(task.task_id)
        .ok_or_else(|| DdlError::task_not_found(task.job_id, task.task_id))?;
    stored.state = task.state;
    stored.params = task.params.clone();
    stored.remark = task.remark.clone();
    stored.retry_count = task.retry_count;
    stored.error_message = task.error_message.clone();
    stored.update_time = task.update_time;
    job.update_time = Utc::now();
    Ok(())
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create_job(&self, job: &ExecutableJob) -> DdlResult<Job> {
        let mut table = self.table.write().await;
        table.last_job_id += 1;
        let job_id = table.last_job_id;
        let created = job.to_queued_job(job_id, Utc::now());
        table.jobs.insert(job_id, created.clone());
        debug!("DDL任务已写入内存存储: {}", job_id);
        Ok(created)
    }

    async fn get_job(&self, job_id: i64) -> DdlResult<Option<Job>> {
        Ok(self.table.read().await.jobs.get(&job_id).cloned())
    }

    async fn list_unfinished_jobs(&self) -> DdlResult<Vec<Job>> {
        let table = self.table.read().await;
        Ok(table
            .jobs
            .values()
            .filter(|job| !job.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> DdlResult<Vec<Job>> {
        let table = self.table.read().await;
        let limit = filter
            .limit
            .and_then(|limit| usize::try_from(limit).ok())
            .unwrap_or(usize::MAX);
        Ok(table
            .jobs
            .values()
            .rev()
            .filter(|job| filter.matches(job))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_job_state(
        &self,
        job_id: i64,
        state: JobState,
        error_message: Option<&str>,
    ) -> DdlResult<()> {
        let mut table = self.table.write().await;
        let job = table
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| DdlError::job_not_found(job_id))?;
        job.state = state;
        if let Some(message) = error_message {
            job.error_message = Some(message.to_string());
        }
        job.update_time = Utc::now();
        Ok(())
    }

    async fn update_task(&self, task: &TaskRecord) -> DdlResult<()> {
        self.update_tasks(std::slice::from_ref(task)).await
    }

    async fn update_tasks(&self, tasks: &[TaskRecord]) -> DdlResult<()> {
        let mut table = self.table.write().await;
        // 先在副本上应用，全部成功后再替换，保证批量更新的原子性
        let mut staged: BTreeMap<i64, Job> = BTreeMap::new();
        for task in tasks {
            if !staged.contains_key(&task.job_id) {
                let job = table
                    .jobs
                    .get(&task.job_id)
                    .ok_or_else(|| DdlError::job_not_found(task.job_id))?;
                staged.insert(task.job_id, job.clone());
            }
            if let Some(job) = staged.get_mut(&task.job_id) {
                apply_task_update(job, task)?;
            }
        }
        table.jobs.extend(staged);
        Ok(())
    }

    async fn request_cancel(&self, job_id: i64) -> DdlResult<bool> {
        let mut table = self.table.write().await;
        let job = table
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| DdlError::job_not_found(job_id))?;
        if job.state.is_terminal() {
            return Ok(false);
        }
        job.cancel_requested = true;
        job.update_time = Utc::now();
        Ok(true)
    }

    async fn purge_terminal_jobs(&self, before: DateTime<Utc>) -> DdlResult<u64> {
        let mut table = self.table.write().await;
        let before_count = table.jobs.len();
        table
            .jobs
            .retain(|_, job| !(job.state.is_terminal() && job.update_time < before));
        Ok((before_count - table.jobs.len()) as u64)
    }
}
