//! 子任务的执行包装
//!
//! 一个执行单元是单个子任务，或者同一事务组内按拓扑顺序排列的一串子任务。
//! 单元内的子任务共享一个元数据事务，并一起持久化为SUCCESS。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use ddl_core::logging::DdlEventLogger;
use ddl_domain::{DdlError, DdlResult, MetaTransaction, TaskRecord, TaskState};
use ddl_infrastructure::MdlContext;
use futures::FutureExt;
use tracing::{debug, instrument, warn};

use crate::context::{EngineContext, JobScope, TaskContext};
use crate::retry_service::RetryPolicy;
use crate::task::DdlTask;

/// 执行单元的最终结果，持久化失败或模拟崩溃以错误形式返回
#[derive(Debug)]
pub enum UnitOutcome {
    Succeeded(Vec<TaskRecord>),
    Failed {
        records: Vec<TaskRecord>,
        error: String,
    },
}

pub struct TaskExecutor {
    engine: EngineContext,
    retry: RetryPolicy,
}

impl TaskExecutor {
    pub fn new(engine: EngineContext) -> Self {
        let retry = RetryPolicy::new(engine.retry_config.clone());
        Self { engine, retry }
    }

    pub fn engine(&self) -> &EngineContext {
        &self.engine
    }

    /// 执行一个单元直到成功、失败或重试耗尽，每次状态变化都会持久化
    #[instrument(skip_all, fields(
        job_id = scope.job_id,
        task_id = records.first().map(|r| r.task_id).unwrap_or_default(),
    ))]
    pub async fn run_unit(
        &self,
        scope: &JobScope,
        mut records: Vec<TaskRecord>,
    ) -> DdlResult<UnitOutcome> {
        let unit_type = records
            .iter()
            .map(|r| r.task_type.as_str())
            .collect::<Vec<_>>()
            .join("+");

        loop {
            transition(&mut records, TaskState::Running, None)?;
            self.engine.repository.update_tasks(&records).await?;

            let started = Instant::now();
            let result = AssertUnwindSafe(self.execute_unit(scope, &records))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(DdlError::task_fatal(format!(
                        "子任务panic: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            let elapsed = started.elapsed().as_secs_f64();

            let error = match result {
                Ok(()) => {
                    self.engine
                        .metrics
                        .record_task_attempt(&unit_type, "success", elapsed);
                    transition(&mut records, TaskState::Success, None)?;
                    self.engine.repository.update_tasks(&records).await?;
                    return Ok(UnitOutcome::Succeeded(records));
                }
                Err(e) if e.is_crash() => return Err(e),
                Err(e) => e,
            };

            let retry_count = records.iter().map(|r| r.retry_count).max().unwrap_or(0);
            let message = error.to_string();
            if self.retry.should_retry(&error, retry_count) {
                self.engine
                    .metrics
                    .record_task_attempt(&unit_type, "retry", elapsed);
                self.engine.metrics.record_task_retry(&unit_type);
                let delay = self.retry.backoff(retry_count);
                warn!(
                    "子任务 {} 第 {} 次执行失败，{:?} 后重试: {}",
                    unit_type,
                    retry_count + 1,
                    delay,
                    message
                );
                transition(&mut records, TaskState::Ready, Some(&message))?;
                for record in &mut records {
                    record.retry_count += 1;
                }
                self.engine.repository.update_tasks(&records).await?;
                tokio::time::sleep(delay).await;
                continue;
            }

            self.engine
                .metrics
                .record_task_attempt(&unit_type, "failed", elapsed);
            warn!("子任务 {} 执行失败，不再重试: {}", unit_type, message);
            transition(&mut records, TaskState::Failed, Some(&message))?;
            self.engine.repository.update_tasks(&records).await?;
            return Ok(UnitOutcome::Failed {
                records,
                error: message,
            });
        }
    }

    /// 执行一次：物理变更 -> 获取元数据锁 -> 元数据事务 -> 提交 -> 提交后通知
    pub async fn execute_unit(&self, scope: &JobScope, records: &[TaskRecord]) -> DdlResult<()> {
        let failpoints = &self.engine.failpoints;
        let tasks = records
            .iter()
            .map(|record| {
                let task = self.engine.registry.create(&record.task_type, &record.params)?;
                Ok((scope.task_context(&self.engine, record), task))
            })
            .collect::<DdlResult<Vec<(TaskContext, Box<dyn DdlTask>)>>>()?;

        for (ctx, task) in &tasks {
            failpoints
                .inject(&format!("before_execute:{}", task.task_type()))
                .await?;
            debug!(job_id = ctx.job_id, task_id = ctx.task_id, "{}", task.describe());
            task.before_transaction(ctx).await?;
        }

        let mdl = MdlContext::new(self.engine.mdl.clone(), scope.owner());
        let mut txn = self.engine.meta_store.begin().await?;
        let trx_id = txn.trx_id();

        let staged = self.run_in_transaction(&mdl, &tasks, txn.as_mut()).await;
        if let Err(e) = staged {
            if let Err(rollback_err) = txn.rollback().await {
                warn!("回滚元数据事务 {} 失败: {}", trx_id, rollback_err);
            }
            return Err(e);
        }
        txn.commit().await?;
        mdl.release_transactional_locks(trx_id);
        drop(mdl);

        for (ctx, task) in &tasks {
            task.after_commit(ctx).await?;
            failpoints
                .inject(&format!("after_commit:{}", task.task_type()))
                .await?;
        }
        Ok(())
    }

    async fn run_in_transaction(
        &self,
        mdl: &MdlContext,
        tasks: &[(TaskContext, Box<dyn DdlTask>)],
        txn: &mut dyn MetaTransaction,
    ) -> DdlResult<()> {
        let trx_id = txn.trx_id();
        for (ctx, task) in tasks {
            for request in task.mdl_requests(ctx, trx_id) {
                mdl.acquire(&request, self.engine.lock_timeout()).await?;
            }
            task.execute(ctx, txn).await?;
        }
        for (_, task) in tasks {
            self.engine
                .failpoints
                .inject(&format!("before_commit:{}", task.task_type()))
                .await?;
        }
        Ok(())
    }

    /// 撤销一个已产生副作用的子任务，瞬时错误按重试策略重试
    #[instrument(skip_all, fields(job_id = scope.job_id, task_id = record.task_id))]
    pub async fn rollback_task(&self, scope: &JobScope, record: &TaskRecord) -> DdlResult<()> {
        let task = self.engine.registry.create(&record.task_type, &record.params)?;
        if !task.supports_rollback() {
            return Err(DdlError::RollbackUnsupported(task.describe()));
        }
        let ctx = scope.task_context(&self.engine, record);

        let mut attempt = 0;
        loop {
            let result = AssertUnwindSafe(self.rollback_once(&ctx, task.as_ref()))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(DdlError::RollbackFailed(format!(
                        "撤销时panic: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            match result {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_crash() && self.retry.should_retry(&e, attempt) => {
                    let delay = self.retry.backoff(attempt);
                    warn!("撤销子任务 {} 失败，{:?} 后重试: {}", record.task_type, delay, e);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn rollback_once(&self, ctx: &TaskContext, task: &dyn DdlTask) -> DdlResult<()> {
        self.engine
            .failpoints
            .inject(&format!("before_rollback:{}", task.task_type()))
            .await?;

        let mdl = MdlContext::new(self.engine.mdl.clone(), ctx.job_mdl.owner());
        let mut txn = self.engine.meta_store.begin().await?;
        let trx_id = txn.trx_id();

        let result = self
            .undo_in_transaction(&mdl, ctx, task, txn.as_mut())
            .await;

        match result {
            Ok(()) => {
                txn.commit().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!("回滚元数据事务 {} 失败: {}", trx_id, rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn undo_in_transaction(
        &self,
        mdl: &MdlContext,
        ctx: &TaskContext,
        task: &dyn DdlTask,
        txn: &mut dyn MetaTransaction,
    ) -> DdlResult<()> {
        for request in task.mdl_requests(ctx, txn.trx_id()) {
            mdl.acquire(&request, self.engine.lock_timeout()).await?;
        }
        task.rollback(ctx, txn).await
    }
}

fn transition(
    records: &mut [TaskRecord],
    next: TaskState,
    error_message: Option<&str>,
) -> DdlResult<()> {
    for record in records.iter_mut() {
        let from = record.state;
        record.set_state(next)?;
        if let Some(message) = error_message {
            record.error_message = Some(message.to_string());
        }
        DdlEventLogger::log_task_state_changed(
            record.job_id,
            record.task_id,
            &record.task_type,
            from.as_str(),
            next.as_str(),
        );
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "未知错误".to_string())
}
