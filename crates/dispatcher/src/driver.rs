//! 单个DDL任务的驱动流程
//!
//! 开始之前先按键的顺序获取任务涉及对象的分布式锁，同一对象上的DDL任务因此串行执行，
//! 锁在任务到达终态时释放。正向阶段按DAG分发就绪的执行单元，失败或取消后等待在途单元结束，
//! 再按拓扑逆序撤销已产生副作用的子任务。

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ddl_core::logging::DdlEventLogger;
use ddl_domain::{DdlError, DdlResult, Job, JobState, MdlKey, TaskRecord, TaskState};
use ddl_infrastructure::MdlContext;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::context::{EngineContext, JobScope};
use crate::executor::{TaskExecutor, UnitOutcome};
use crate::lease::LeaseGuard;

const CANCELLED_MESSAGE: &str = "DDL任务已被取消";
const OBJECT_LOCK_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveExit {
    Finished(JobState),
    /// 模拟崩溃，没有持久化任何后续状态，也没有释放租约
    Crashed,
    /// 存储不可用或失去所有权，任务留给恢复流程
    Interrupted(String),
    Missing,
}

enum ForwardOutcome {
    Completed,
    Failed(String),
}

type UnitResult = (Vec<i64>, DdlResult<UnitOutcome>);

pub struct JobDriver {
    engine: EngineContext,
    executor: Arc<TaskExecutor>,
}

impl JobDriver {
    pub fn new(engine: EngineContext) -> Self {
        let executor = Arc::new(TaskExecutor::new(engine.clone()));
        Self { engine, executor }
    }

    #[instrument(skip(self, lease))]
    pub async fn drive(&self, job_id: i64, lease: &LeaseGuard) -> DriveExit {
        match self.try_drive(job_id, lease).await {
            Ok(exit) => exit,
            Err(e) if e.is_crash() => {
                warn!("DDL任务 {} 的驱动流程模拟崩溃退出: {}", job_id, e);
                DriveExit::Crashed
            }
            Err(e) => {
                error!("DDL任务 {} 的驱动流程中断，等待恢复: {}", job_id, e);
                DriveExit::Interrupted(e.to_string())
            }
        }
    }

    async fn try_drive(&self, job_id: i64, lease: &LeaseGuard) -> DdlResult<DriveExit> {
        let Some(job) = self.engine.repository.get_job(job_id).await? else {
            warn!("DDL任务 {} 不存在", job_id);
            return Ok(DriveExit::Missing);
        };
        if job.state.is_terminal() {
            return Ok(DriveExit::Finished(job.state));
        }

        let started = Instant::now();
        let scope = JobScope {
            job_id,
            schema_name: job.schema_name.clone(),
            ddl_type: job.ddl_type,
            ddl_stmt: job.ddl_stmt.clone(),
            trace_id: job.trace_id.clone(),
            job_mdl: Arc::new(MdlContext::new(
                self.engine.mdl.clone(),
                EngineContext::job_mdl_owner(job_id),
            )),
        };
        info!("开始驱动 {}", job.entity_description());

        let rolling_back = job.state.is_rolling_back();
        let held_objects = if rolling_back && !job.tasks.iter().any(|t| t.state.needs_undo()) {
            Vec::new()
        } else {
            self.lock_ddl_objects(&scope, &job, lease, !rolling_back)
                .await?
        };

        let state = if rolling_back {
            self.reacquire_instance_locks(&scope, &job).await?;
            self.rollback(&scope, lease).await?
        } else {
            let job = self.reload(job_id).await?;
            match self.run_forward(&scope, job, lease).await? {
                ForwardOutcome::Completed => {
                    self.engine
                        .repository
                        .update_job_state(job_id, JobState::Success, None)
                        .await?;
                    JobState::Success
                }
                ForwardOutcome::Failed(reason) => {
                    self.fail_and_rollback(&scope, &reason, lease).await?
                }
            }
        };

        let released = scope.job_mdl.release_all();
        debug!("DDL任务 {} 结束，释放 {} 个元数据锁", job_id, released);
        self.release_ddl_objects(&scope, lease, &held_objects).await;
        let elapsed = started.elapsed();
        self.engine
            .metrics
            .record_job_finished(state.as_str(), elapsed.as_secs_f64());
        DdlEventLogger::log_job_finished(
            job_id,
            state.as_str(),
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        );
        Ok(DriveExit::Finished(state))
    }

    async fn reload(&self, job_id: i64) -> DdlResult<Job> {
        self.engine
            .repository
            .get_job(job_id)
            .await?
            .ok_or_else(|| DdlError::job_not_found(job_id))
    }

    /// 按键的顺序逐个获取对象锁，对象被其他DDL任务持有时等待
    ///
    /// 可取消的等待在收到取消请求后停止，返回已获取的部分。
    /// 锁的持有者是DDL任务本身，接管或恢复后的驱动流程可以直接重新获取。
    async fn lock_ddl_objects(
        &self,
        scope: &JobScope,
        job: &Job,
        lease: &LeaseGuard,
        cancellable: bool,
    ) -> DdlResult<Vec<String>> {
        let keys: BTreeSet<MdlKey> = job
            .tasks
            .iter()
            .flat_map(|record| self.ddl_objects(scope, record))
            .collect();
        let owner = scope.owner();
        let ttl = self.engine.scheduler_config.lease_ttl();
        let mut held = Vec::with_capacity(keys.len());

        for key in keys {
            let name = EngineContext::ddl_object_lock_name(&key);
            let mut waiting = false;
            while !self.engine.lease.try_acquire(&name, &owner, ttl).await? {
                if lease.is_lost() {
                    return Err(DdlError::OwnershipLost {
                        job_id: scope.job_id,
                    });
                }
                if !waiting {
                    info!(
                        "DDL任务 {} 等待其他DDL任务释放对象 {}",
                        scope.job_id, key
                    );
                    waiting = true;
                }
                if cancellable && self.reload(scope.job_id).await?.cancel_requested {
                    info!("DDL任务 {} 在等待对象锁时被取消", scope.job_id);
                    return Ok(held);
                }
                tokio::time::sleep(OBJECT_LOCK_POLL).await;
            }
            lease.renew_along(&name, &owner);
            debug!("DDL任务 {} 持有对象锁 {}", scope.job_id, name);
            held.push(name);
        }
        Ok(held)
    }

    /// 无法创建的子任务不声明对象，由执行器在执行时报告错误
    fn ddl_objects(&self, scope: &JobScope, record: &TaskRecord) -> Vec<MdlKey> {
        match self
            .engine
            .registry
            .create(&record.task_type, &record.params)
        {
            Ok(task) => task.ddl_objects(&scope.task_context(&self.engine, record)),
            Err(e) => {
                warn!(
                    "DDL任务 {} 的子任务 {} 无法创建: {}",
                    scope.job_id, record.task_id, e
                );
                Vec::new()
            }
        }
    }

    async fn release_ddl_objects(&self, scope: &JobScope, lease: &LeaseGuard, held: &[String]) {
        let owner = scope.owner();
        for name in held {
            lease.stop_renewing(name);
            if let Err(e) = self.engine.lease.release(name, &owner).await {
                warn!("释放对象锁 {} 失败，等待其过期: {}", name, e);
            }
        }
    }

    async fn run_forward(
        &self,
        scope: &JobScope,
        job: Job,
        lease: &LeaseGuard,
    ) -> DdlResult<ForwardOutcome> {
        let job_id = scope.job_id;
        if job.cancel_requested {
            return Ok(ForwardOutcome::Failed(CANCELLED_MESSAGE.to_string()));
        }

        self.reacquire_instance_locks(scope, &job).await?;
        if job.state == JobState::Queued {
            self.engine
                .repository
                .update_job_state(job_id, JobState::Running, None)
                .await?;
            self.engine.metrics.job_started();
        }

        let parallelism = self.engine.scheduler_config.task_parallelism.max(1);
        let mut units: JoinSet<UnitResult> = JoinSet::new();
        let mut in_flight: HashSet<i64> = HashSet::new();
        let mut failure: Option<String> = None;

        loop {
            if lease.is_lost() {
                return Err(DdlError::OwnershipLost { job_id });
            }

            let job = self.reload(job_id).await?;
            if failure.is_none() && !job.cancel_requested {
                for unit in next_units(&job, &in_flight)? {
                    if units.len() >= parallelism {
                        break;
                    }
                    let ids: Vec<i64> = unit.iter().map(|t| t.task_id).collect();
                    in_flight.extend(ids.iter().copied());
                    let executor = self.executor.clone();
                    let scope = scope.clone();
                    units.spawn(async move {
                        let outcome = executor.run_unit(&scope, unit).await;
                        (ids, outcome)
                    });
                }
            }

            if units.is_empty() {
                if let Some(reason) = failure.take() {
                    return Ok(ForwardOutcome::Failed(reason));
                }
                if job.cancel_requested {
                    info!("DDL任务 {} 收到取消请求，开始回滚", job_id);
                    return Ok(ForwardOutcome::Failed(CANCELLED_MESSAGE.to_string()));
                }
                if job.all_tasks_succeeded() {
                    return Ok(ForwardOutcome::Completed);
                }
                return Err(DdlError::Internal(format!(
                    "DDL任务 {job_id} 没有可调度的子任务"
                )));
            }

            match units.join_next().await {
                Some(Ok((ids, result))) => {
                    for id in &ids {
                        in_flight.remove(id);
                    }
                    match result? {
                        UnitOutcome::Succeeded(_) => {}
                        UnitOutcome::Failed { error, .. } => {
                            failure.get_or_insert(error);
                        }
                    }
                }
                Some(Err(join_error)) => {
                    return Err(DdlError::Internal(format!(
                        "执行单元异常退出: {join_error}"
                    )));
                }
                None => {}
            }
        }
    }

    /// 恢复后重新持有已成功子任务声明的INSTANCE锁
    async fn reacquire_instance_locks(&self, scope: &JobScope, job: &Job) -> DdlResult<()> {
        for record in job.tasks.iter().filter(|t| t.is_success()) {
            let task = self
                .engine
                .registry
                .create(&record.task_type, &record.params)?;
            let ctx = scope.task_context(&self.engine, record);
            for request in task.instance_locks(&ctx) {
                scope
                    .job_mdl
                    .acquire(&request, self.engine.lock_timeout())
                    .await?;
                debug!("DDL任务 {} 重新持有元数据锁 {}", scope.job_id, request.key);
            }
        }
        Ok(())
    }

    async fn fail_and_rollback(
        &self,
        scope: &JobScope,
        reason: &str,
        lease: &LeaseGuard,
    ) -> DdlResult<JobState> {
        let job = self.reload(scope.job_id).await?;
        if matches!(job.state, JobState::Queued | JobState::Running) {
            warn!("DDL任务 {} 失败: {}", scope.job_id, reason);
            self.engine
                .repository
                .update_job_state(scope.job_id, JobState::Failed, Some(reason))
                .await?;
        }
        self.rollback(scope, lease).await
    }

    /// 每撤销一个子任务前检查租约，失去所有权后把剩余的回滚留给新的持有者
    async fn rollback(&self, scope: &JobScope, lease: &LeaseGuard) -> DdlResult<JobState> {
        let job_id = scope.job_id;
        let job = self.reload(job_id).await?;
        if job.state == JobState::Failed {
            self.engine
                .repository
                .update_job_state(job_id, JobState::RollbackRunning, None)
                .await?;
        }

        for task_id in job.topological_order()?.into_iter().rev() {
            let Some(record) = job.task(task_id) else {
                continue;
            };
            if !record.state.needs_undo() {
                continue;
            }
            if lease.is_lost() {
                return Err(DdlError::OwnershipLost { job_id });
            }
            let mut record = record.clone();
            let from = record.state;

            match self.executor.rollback_task(scope, &record).await {
                Ok(()) => {
                    record.set_state(TaskState::RollbackSuccess)?;
                    self.engine.repository.update_task(&record).await?;
                    self.engine
                        .metrics
                        .record_rollback(&record.task_type, true);
                    log_transition(&record, from);
                }
                Err(e) if e.is_crash() => return Err(e),
                Err(e) => return self.halt_rollback(record, from, &e.to_string()).await,
            }
        }

        self.engine
            .repository
            .update_job_state(job_id, JobState::RollbackSuccess, None)
            .await?;
        info!("DDL任务 {} 回滚完成", job_id);
        Ok(JobState::RollbackSuccess)
    }

    /// 撤销失败时停止回滚，任务停在ROLLBACK_FAILED等待人工处理
    async fn halt_rollback(
        &self,
        mut record: TaskRecord,
        from: TaskState,
        reason: &str,
    ) -> DdlResult<JobState> {
        record.set_state(TaskState::RollbackFailed)?;
        record.error_message = Some(reason.to_string());
        self.engine.repository.update_task(&record).await?;
        self.engine
            .metrics
            .record_rollback(&record.task_type, false);
        log_transition(&record, from);

        DdlEventLogger::log_rollback_halted(
            record.job_id,
            record.task_id,
            &record.task_type,
            reason,
        );
        self.engine
            .repository
            .update_job_state(record.job_id, JobState::RollbackFailed, Some(reason))
            .await?;
        Ok(JobState::RollbackFailed)
    }
}

/// 可以分发的执行单元：未在执行中的就绪子任务，事务组成员按拓扑顺序合并为一个单元
fn next_units(job: &Job, in_flight: &HashSet<i64>) -> DdlResult<Vec<Vec<TaskRecord>>> {
    let order = job.topological_order()?;
    let mut units = Vec::new();
    for task in job.ready_tasks() {
        if in_flight.contains(&task.task_id) {
            continue;
        }
        let unit = match task.transaction_group.as_deref() {
            None => vec![task.clone()],
            Some(group) => order
                .iter()
                .filter_map(|id| job.task(*id))
                .filter(|t| t.transaction_group.as_deref() == Some(group) && t.is_ready())
                .cloned()
                .collect(),
        };
        units.push(unit);
    }
    Ok(units)
}

fn log_transition(record: &TaskRecord, from: TaskState) {
    DdlEventLogger::log_task_state_changed(
        record.job_id,
        record.task_id,
        &record.task_type,
        from.as_str(),
        record.state.as_str(),
    );
}
