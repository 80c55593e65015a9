use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ddl_core::logging::DdlEventLogger;
use ddl_domain::{DdlError, DdlResult, ExecutableJob, Job, JobFilter, JobState};
use futures::FutureExt;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::EngineContext;
use crate::driver::{DriveExit, JobDriver};
use crate::lease::LeaseGuard;
use crate::recovery_service::{prepare_for_resume, RecoveryReport};

/// DDL任务调度器
///
/// 每个DDL任务由一个独立的驱动流程执行，驱动流程持有该任务的租约，
/// 并受 `max_concurrent_jobs` 限制。
pub struct DdlJobScheduler {
    engine: EngineContext,
    driver: Arc<JobDriver>,
    job_slots: Arc<Semaphore>,
    active: Arc<Mutex<HashSet<i64>>>,
    drivers: Mutex<JoinSet<()>>,
}

/// 驱动流程退出时把任务从本节点的活跃集合中移除
struct ActiveJob {
    job_id: i64,
    active: Arc<Mutex<HashSet<i64>>>,
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

impl DdlJobScheduler {
    pub fn new(engine: EngineContext) -> Self {
        let slots = engine.scheduler_config.max_concurrent_jobs.max(1);
        Self {
            driver: Arc::new(JobDriver::new(engine.clone())),
            job_slots: Arc::new(Semaphore::new(slots)),
            active: Arc::new(Mutex::new(HashSet::new())),
            drivers: Mutex::new(JoinSet::new()),
            engine,
        }
    }

    pub fn engine(&self) -> &EngineContext {
        &self.engine
    }

    /// 持久化为QUEUED并立即开始驱动，结果通过 `job_status` 查询
    pub async fn submit(&self, job: ExecutableJob) -> DdlResult<i64> {
        self.engine.registry.validate_job(&job)?;
        let created = self.engine.repository.create_job(&job).await?;
        let job_id = created.job_id;

        DdlEventLogger::log_job_submitted(
            job_id,
            &created.schema_name,
            created.ddl_type.as_str(),
            created.tasks.len(),
        );
        self.engine
            .metrics
            .record_job_submitted(created.ddl_type.as_str());

        match self.acquire_lease(job_id).await {
            Ok(Some(lease)) => {
                self.start_driver(job_id, lease);
            }
            Ok(None) => debug!("DDL任务 {} 的租约已被占用，等待扫描接管", job_id),
            Err(e) => warn!("获取DDL任务 {} 的租约失败，等待扫描接管: {}", job_id, e),
        }
        Ok(job_id)
    }

    /// 取消任务
    ///
    /// 未开始的任务立即置为FAILED并回滚（无需撤销），执行中的任务只设置取消标记，
    /// 由驱动流程在在途子任务结束后回滚。已结束的任务返回false。
    pub async fn cancel(&self, job_id: i64) -> DdlResult<bool> {
        if !self.engine.repository.request_cancel(job_id).await? {
            info!("DDL任务 {} 已结束，忽略取消请求", job_id);
            return Ok(false);
        }

        let job = self.job_status(job_id).await?;
        if job.state == JobState::Queued && !self.is_active(job_id) {
            if let Some(lease) = self.acquire_lease(job_id).await? {
                self.engine
                    .repository
                    .update_job_state(job_id, JobState::Failed, Some("DDL任务已被取消"))
                    .await?;
                self.start_driver(job_id, lease);
            }
        }
        info!("DDL任务 {} 已请求取消", job_id);
        Ok(true)
    }

    pub async fn job_status(&self, job_id: i64) -> DdlResult<Job> {
        self.engine
            .repository
            .get_job(job_id)
            .await?
            .ok_or_else(|| DdlError::job_not_found(job_id))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> DdlResult<Vec<Job>> {
        self.engine.repository.list_jobs(filter).await
    }

    /// 清理更新时间早于 `before` 的已结束任务
    pub async fn purge(&self, before: DateTime<Utc>) -> DdlResult<u64> {
        let purged = self.engine.repository.purge_terminal_jobs(before).await?;
        info!("清理了 {} 个已结束的DDL任务", purged);
        Ok(purged)
    }

    /// 接管所有未结束且没有被其他节点持有的任务
    pub async fn recover(&self) -> DdlResult<RecoveryReport> {
        self.reap_finished_drivers();
        let jobs = self.engine.repository.list_unfinished_jobs().await?;
        let mut report = RecoveryReport {
            jobs_scanned: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            let job_id = job.job_id;
            if self.is_active(job_id) {
                report.skipped += 1;
                continue;
            }
            let lease = match self.acquire_lease(job_id).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    report.errors.push((job_id, e.to_string()));
                    continue;
                }
            };

            match prepare_for_resume(&self.engine, job).await {
                Ok(reset) => {
                    report.tasks_reset += reset;
                    if self.start_driver(job_id, lease) {
                        report.jobs_resumed += 1;
                    }
                }
                Err(e) => {
                    error!("恢复DDL任务 {} 失败: {}", job_id, e);
                    report.errors.push((job_id, e.to_string()));
                    lease.release().await;
                }
            }
        }

        if report.jobs_resumed > 0 || !report.is_clean() {
            info!(
                scanned = report.jobs_scanned,
                resumed = report.jobs_resumed,
                tasks_reset = report.tasks_reset,
                skipped = report.skipped,
                errors = report.errors.len(),
                "恢复扫描完成"
            );
        }
        Ok(report)
    }

    /// 周期性扫描，接管其他节点提交的任务和租约过期的任务
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.engine.scheduler_config.scan_interval());
        info!(
            node_id = %self.engine.node_id,
            "DDL调度器启动，扫描间隔 {:?}",
            self.engine.scheduler_config.scan_interval()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.recover().await {
                        error!("扫描未完成的DDL任务失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，DDL调度器停止扫描");
                    break;
                }
            }
        }
    }

    /// 轮询直到任务进入终态
    pub async fn await_terminal(&self, job_id: i64, timeout: Duration) -> DdlResult<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.job_status(job_id).await?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DdlError::Timeout(format!(
                    "等待DDL任务 {job_id} 结束超时，当前状态 {}",
                    job.state
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn is_active(&self, job_id: i64) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&job_id)
    }

    pub fn active_jobs(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 等待本节点所有驱动流程退出
    pub async fn shutdown(&self) {
        let mut drivers = std::mem::take(&mut *self.lock_drivers());
        info!("等待 {} 个DDL任务驱动流程退出", drivers.len());
        while let Some(result) = drivers.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!("DDL任务驱动流程异常退出: {}", e);
                }
            }
        }
    }

    /// 立即终止所有驱动流程，不释放租约
    pub async fn abort(&self) {
        let mut drivers = std::mem::take(&mut *self.lock_drivers());
        drivers.shutdown().await;
    }

    async fn acquire_lease(&self, job_id: i64) -> DdlResult<Option<LeaseGuard>> {
        LeaseGuard::acquire(
            self.engine.lease.clone(),
            job_id,
            &self.engine.node_id,
            self.engine.scheduler_config.lease_ttl(),
        )
        .await
    }

    /// 本节点已在驱动该任务时返回false
    fn start_driver(&self, job_id: i64, lease: LeaseGuard) -> bool {
        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if !active.insert(job_id) {
                return false;
            }
        }
        let active = ActiveJob {
            job_id,
            active: self.active.clone(),
        };
        let driver = self.driver.clone();
        let slots = self.job_slots.clone();

        self.lock_drivers().spawn(async move {
            let _active = active;
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };
            match driver.drive(job_id, &lease).await {
                DriveExit::Crashed => drop(lease),
                exit => {
                    debug!("DDL任务 {} 驱动流程退出: {:?}", job_id, exit);
                    lease.release().await;
                }
            }
        });
        true
    }

    fn reap_finished_drivers(&self) {
        let mut drivers = self.lock_drivers();
        while let Some(Some(_)) = drivers.join_next().now_or_never() {}
    }

    fn lock_drivers(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.drivers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
