mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ddl_core::FailPoints;
use ddl_dispatcher::tasks::table_meta_key;
use ddl_dispatcher::{
    DdlJobFactory, DdlJobScheduler, DdlRequest, DdlTask, TaskContext, TaskRegistry,
};
use ddl_domain::{
    DdlResult, DdlType, Job, JobBuilder, JobFilter, JobState, MdlKey, MetaStore, MetaTransaction,
    TaskSpec, TaskState, TABLE_NEW_NAME, TABLE_NEW_PATTERN,
};
use ddl_infrastructure::MdlManager;
use ddl_testing_utils::{TestEnv, TestStores};
use serde_json::json;

use common::{alter_sql, alter_table, create_sql, create_table, drop_sql, drop_table, engine};

const WAIT: Duration = Duration::from_secs(5);

async fn run_to_end(scheduler: &DdlJobScheduler, ddl_type: DdlType, request: &DdlRequest) -> Job {
    let job = DdlJobFactory::new().create_job(ddl_type, request).unwrap();
    let job_id = scheduler.submit(job).await.unwrap();
    scheduler.await_terminal(job_id, WAIT).await.unwrap()
}

async fn wait_for_hit(failpoints: &FailPoints, name: &str) -> bool {
    TestEnv::wait_for(
        || {
            let failpoints = failpoints.clone();
            let name = name.to_string();
            async move { failpoints.hits(&name) > 0 }
        },
        WAIT,
    )
    .await
}

#[tokio::test]
async fn test_create_table_succeeds() {
    let stores = TestStores::new();
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));

    let job = run_to_end(&scheduler, DdlType::CreateTable, &create_table("t1")).await;

    assert_eq!(job.state, JobState::Success);
    assert!(job.tasks.iter().all(|t| t.state == TaskState::Success));
    assert_eq!(stores.physical.count(&create_sql("t1", 0)), 1);
    assert_eq!(stores.physical.count(&create_sql("t1", 1)), 1);
    assert!(stores
        .meta_store
        .get(&table_meta_key("db1", "t1"))
        .await
        .unwrap()
        .is_some());

    let events = stores.cdc_sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].ddl_kind, "CREATE_TABLE");
    assert_eq!(events[0].job_id, job.job_id);
    // 下游收到逻辑语句，分片上的物理语句不进入CDC
    assert_eq!(events[0].ddl_stmt, "CREATE TABLE t1 (id INT)");

    assert_eq!(stores.schema_cache.stats().invalidations, 1);
    assert!(!stores.mdl.is_locked(&MdlKey::new("db1", "t1")));
}

#[tokio::test]
async fn test_fatal_failure_rolls_back_and_allows_resubmission() {
    let stores = TestStores::new();
    let failpoints = TestEnv::failpoints(&[("before_execute:CreatePhysicalTablesTask", "fatal*1")]);
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", failpoints));

    let failed = run_to_end(&scheduler, DdlType::CreateTable, &create_table("t1")).await;

    assert_eq!(failed.state, JobState::RollbackSuccess);
    assert_eq!(
        failed.task_states(),
        vec![
            TaskState::RollbackSuccess,
            TaskState::RollbackSuccess,
            TaskState::RollbackSuccess,
            TaskState::Ready,
            TaskState::Ready,
            TaskState::Ready,
        ]
    );
    assert_eq!(stores.physical.count(&create_sql("t1", 0)), 0);
    assert_eq!(stores.physical.count(&drop_sql("t1", 0)), 1);
    assert_eq!(stores.cdc_sink.event_count(), 0);
    assert!(!stores.mdl.is_locked(&MdlKey::new("db1", "t1")));

    let retried = run_to_end(&scheduler, DdlType::CreateTable, &create_table("t1")).await;
    assert_ne!(retried.job_id, failed.job_id);
    assert_eq!(retried.state, JobState::Success);
    assert_eq!(stores.cdc_sink.event_count(), 1);
}

#[tokio::test]
async fn test_validation_failure_is_not_retried() {
    let stores = TestStores::new();
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));

    run_to_end(&scheduler, DdlType::CreateTable, &create_table("t1")).await;
    let duplicate = run_to_end(&scheduler, DdlType::CreateTable, &create_table("t1")).await;

    assert_eq!(duplicate.state, JobState::RollbackSuccess);
    let validate = &duplicate.tasks[0];
    assert_eq!(validate.retry_count, 0);
    assert!(validate
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("已存在"));
    // 失败的校验之后没有任何子任务执行
    assert_eq!(stores.physical.count(&create_sql("t1", 0)), 1);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let stores = TestStores::new();
    stores.physical.fail_next(2);
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));

    let job = run_to_end(&scheduler, DdlType::CreateTable, &create_table("t1")).await;

    assert_eq!(job.state, JobState::Success);
    let physical = job
        .tasks
        .iter()
        .find(|t| t.task_type == "CreatePhysicalTablesTask")
        .unwrap();
    assert_eq!(physical.retry_count, 2);
    assert_eq!(stores.physical.count(&create_sql("t1", 0)), 1);
}

#[tokio::test]
async fn test_retries_exhausted_fail_the_job() {
    let stores = TestStores::new();
    let failpoints = TestEnv::failpoints(&[("before_execute:CdcMarkTask", "exception")]);
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", failpoints.clone()));

    let job = run_to_end(&scheduler, DdlType::CreateTable, &create_table("t1")).await;

    assert_eq!(job.state, JobState::RollbackSuccess);
    assert_eq!(failpoints.hits("before_execute:CdcMarkTask"), 4);
    // 已注册的元数据被撤销
    assert!(stores
        .meta_store
        .get(&table_meta_key("db1", "t1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_drop_table_rollback_fails_on_unsupported_task() {
    let stores = TestStores::new();
    let failpoints = TestEnv::failpoints(&[("before_execute:SyncSchemaTask", "fatal")]);
    let setup = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));
    run_to_end(&setup, DdlType::CreateTable, &create_table("t1")).await;

    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", failpoints));
    let job = run_to_end(&scheduler, DdlType::DropTable, &drop_table("t1")).await;

    assert_eq!(job.state, JobState::RollbackFailed);
    let by_type = |task_type: &str| {
        job.tasks
            .iter()
            .find(|t| t.task_type == task_type)
            .map(|t| t.state)
            .unwrap()
    };
    assert_eq!(by_type("SyncSchemaTask"), TaskState::RollbackSuccess);
    assert_eq!(by_type("DropPhysicalTablesTask"), TaskState::RollbackFailed);
    // 回滚在不可撤销的子任务处停止，之前的子任务保持原状
    assert_eq!(by_type("UpdateTableMetaTask"), TaskState::Success);
    assert!(!stores.mdl.is_locked(&MdlKey::new("db1", "t1")));
}

#[tokio::test]
async fn test_rename_commits_meta_and_cdc_together() {
    let stores = TestStores::new();
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));
    run_to_end(&scheduler, DdlType::CreateTable, &create_table("t1")).await;

    let request = DdlRequest::new("db1", "t1", "RENAME TABLE t1 TO t2")
        .with_new_table_name("t2");
    let job = run_to_end(&scheduler, DdlType::RenameTable, &request).await;

    assert_eq!(job.state, JobState::Success);
    assert!(stores
        .meta_store
        .get(&table_meta_key("db1", "t1"))
        .await
        .unwrap()
        .is_none());
    assert!(stores
        .meta_store
        .get(&table_meta_key("db1", "t2"))
        .await
        .unwrap()
        .is_some());

    let events = stores.cdc_sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].extra_params[TABLE_NEW_NAME], json!("t2"));
    assert_eq!(events[1].extra_params[TABLE_NEW_PATTERN], json!("t2"));
}

#[tokio::test]
async fn test_rename_group_failure_leaves_no_partial_state() {
    let stores = TestStores::new();
    let setup = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));
    run_to_end(&setup, DdlType::CreateTable, &create_table("t1")).await;

    let failpoints = TestEnv::failpoints(&[("before_commit:CdcMarkTask", "fatal")]);
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", failpoints));
    let request = DdlRequest::new("db1", "t1", "RENAME TABLE t1 TO t2")
        .with_new_table_name("t2");
    let job = run_to_end(&scheduler, DdlType::RenameTable, &request).await;

    assert_eq!(job.state, JobState::RollbackSuccess);
    let grouped: Vec<TaskState> = job
        .tasks
        .iter()
        .filter(|t| t.transaction_group.is_some())
        .map(|t| t.state)
        .collect();
    assert_eq!(
        grouped,
        vec![TaskState::RollbackSuccess, TaskState::RollbackSuccess]
    );
    assert!(stores
        .meta_store
        .get(&table_meta_key("db1", "t1"))
        .await
        .unwrap()
        .is_some());
    assert!(stores
        .meta_store
        .get(&table_meta_key("db1", "t2"))
        .await
        .unwrap()
        .is_none());
    assert_eq!(stores.cdc_sink.event_count(), 1);
}

#[tokio::test]
async fn test_cancel_running_job_rolls_back_after_in_flight_task() {
    let stores = TestStores::new();
    let failpoints =
        TestEnv::failpoints(&[("before_execute:CreatePhysicalTablesTask", "suspend:300")]);
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", failpoints.clone()));

    let job = DdlJobFactory::new()
        .create_job(DdlType::CreateTable, &create_table("t1"))
        .unwrap();
    let job_id = scheduler.submit(job).await.unwrap();

    let suspended = TestEnv::wait_for(
        || {
            let failpoints = failpoints.clone();
            async move { failpoints.hits("before_execute:CreatePhysicalTablesTask") > 0 }
        },
        WAIT,
    )
    .await;
    assert!(suspended);
    assert!(scheduler.cancel(job_id).await.unwrap());

    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::RollbackSuccess);
    assert!(job.cancel_requested);
    // 在途的物理建表完成后才被撤销
    assert_eq!(stores.physical.count(&create_sql("t1", 0)), 1);
    assert_eq!(stores.physical.count(&drop_sql("t1", 0)), 1);
    assert_eq!(stores.cdc_sink.event_count(), 0);

    assert!(!scheduler.cancel(job_id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_queued_job_needs_no_undo() {
    let stores = TestStores::new();
    let failpoints =
        TestEnv::failpoints(&[("before_execute:CreatePhysicalTablesTask", "suspend:200*1")]);
    let mut config = TestEnv::scheduler_config("node-1");
    config.max_concurrent_jobs = 1;
    let scheduler = DdlJobScheduler::new(
        common::builder(&stores, "node-1", failpoints.clone())
            .scheduler_config(config)
            .build(),
    );

    let factory = DdlJobFactory::new();
    let first = scheduler
        .submit(factory.create_job(DdlType::CreateTable, &create_table("t1")).unwrap())
        .await
        .unwrap();
    // 第一个任务占住唯一的槽位
    assert!(
        TestEnv::wait_for(
            || {
                let failpoints = failpoints.clone();
                async move { failpoints.hits("before_execute:CreatePhysicalTablesTask") > 0 }
            },
            WAIT,
        )
        .await
    );
    let second = scheduler
        .submit(factory.create_job(DdlType::CreateTable, &create_table("t2")).unwrap())
        .await
        .unwrap();

    assert_eq!(
        scheduler.job_status(second).await.unwrap().state,
        JobState::Queued
    );
    assert!(scheduler.cancel(second).await.unwrap());

    let second = scheduler.await_terminal(second, WAIT).await.unwrap();
    assert_eq!(second.state, JobState::RollbackSuccess);
    assert!(second.tasks.iter().all(|t| t.state == TaskState::Ready));
    assert_eq!(stores.physical.count(&create_sql("t2", 0)), 0);

    let first = scheduler.await_terminal(first, WAIT).await.unwrap();
    assert_eq!(first.state, JobState::Success);
}

#[tokio::test]
async fn test_same_table_jobs_run_one_after_another() {
    let stores = TestStores::new();
    let setup = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));
    run_to_end(&setup, DdlType::CreateTable, &create_table("t1")).await;

    let failpoints =
        TestEnv::failpoints(&[("before_execute:AlterPhysicalTablesTask", "suspend:300*1")]);
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", failpoints.clone()));
    let factory = DdlJobFactory::new();
    let first = scheduler
        .submit(factory.create_job(DdlType::AlterTable, &alter_table("t1", "c1")).unwrap())
        .await
        .unwrap();
    assert!(wait_for_hit(&failpoints, "before_execute:AlterPhysicalTablesTask").await);

    let second = scheduler
        .submit(factory.create_job(DdlType::AlterTable, &alter_table("t1", "c2")).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    // 第二个任务在对象锁上等待，没有开始执行任何子任务
    let waiting = scheduler.job_status(second).await.unwrap();
    assert_eq!(waiting.state, JobState::Queued);
    assert!(waiting.tasks.iter().all(|t| t.state == TaskState::Ready));
    assert_eq!(
        stores.lease.holder("ddl_object:db1.t1"),
        Some(format!("ddl_job:{first}"))
    );

    let first = scheduler.await_terminal(first, WAIT).await.unwrap();
    let second = scheduler.await_terminal(second, WAIT).await.unwrap();
    assert_eq!(first.state, JobState::Success);
    assert_eq!(second.state, JobState::Success);

    let executed: Vec<String> = stores
        .physical
        .executed()
        .into_iter()
        .map(|statement| statement.sql)
        .collect();
    let position = |sql: String| executed.iter().position(|s| *s == sql).unwrap();
    assert!(position(alter_sql("t1", 1, "c1")) < position(alter_sql("t1", 0, "c2")));
    assert!(stores.lease.holder("ddl_object:db1.t1").is_none());
    assert!(!stores.mdl.is_locked(&MdlKey::new("db1", "t1")));
}

#[tokio::test]
async fn test_jobs_on_different_nodes_are_serialized_per_table() {
    let stores = TestStores::new();
    let setup = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));
    run_to_end(&setup, DdlType::CreateTable, &create_table("t1")).await;

    let failpoints =
        TestEnv::failpoints(&[("before_execute:AlterPhysicalTablesTask", "suspend:300*1")]);
    let node1 = DdlJobScheduler::new(engine(&stores, "node-1", failpoints.clone()));
    // 元数据锁只在进程内有效，第二个节点使用自己的管理器
    let node2 = DdlJobScheduler::new(
        common::builder(&stores, "node-2", FailPoints::disabled())
            .mdl_manager(Arc::new(MdlManager::new()))
            .build(),
    );
    let factory = DdlJobFactory::new();

    let first = node1
        .submit(factory.create_job(DdlType::AlterTable, &alter_table("t1", "c1")).unwrap())
        .await
        .unwrap();
    assert!(wait_for_hit(&failpoints, "before_execute:AlterPhysicalTablesTask").await);
    let second = node2
        .submit(factory.create_job(DdlType::AlterTable, &alter_table("t1", "c2")).unwrap())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        node2.job_status(second).await.unwrap().state,
        JobState::Queued
    );
    assert_eq!(stores.physical.count(&alter_sql("t1", 0, "c2")), 0);

    assert_eq!(
        node1.await_terminal(first, WAIT).await.unwrap().state,
        JobState::Success
    );
    assert_eq!(
        node2.await_terminal(second, WAIT).await.unwrap().state,
        JobState::Success
    );
    assert_eq!(stores.physical.count(&alter_sql("t1", 0, "c2")), 1);
}

#[tokio::test]
async fn test_jobs_on_different_tables_do_not_wait() {
    let stores = TestStores::new();
    let setup = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));
    run_to_end(&setup, DdlType::CreateTable, &create_table("t1")).await;
    run_to_end(&setup, DdlType::CreateTable, &create_table("t2")).await;

    let failpoints =
        TestEnv::failpoints(&[("before_execute:AlterPhysicalTablesTask", "suspend:500*1")]);
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", failpoints.clone()));
    let factory = DdlJobFactory::new();
    let first = scheduler
        .submit(factory.create_job(DdlType::AlterTable, &alter_table("t1", "c1")).unwrap())
        .await
        .unwrap();
    assert!(wait_for_hit(&failpoints, "before_execute:AlterPhysicalTablesTask").await);

    let other = scheduler
        .submit(factory.create_job(DdlType::AlterTable, &alter_table("t2", "c1")).unwrap())
        .await
        .unwrap();
    let other = scheduler.await_terminal(other, WAIT).await.unwrap();
    assert_eq!(other.state, JobState::Success);
    // 另一张表上的任务不受第一个任务影响
    assert_eq!(
        scheduler.job_status(first).await.unwrap().state,
        JobState::Running
    );
    assert_eq!(
        scheduler.await_terminal(first, WAIT).await.unwrap().state,
        JobState::Success
    );
}

#[tokio::test]
async fn test_cancel_job_waiting_for_table() {
    let stores = TestStores::new();
    let setup = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));
    run_to_end(&setup, DdlType::CreateTable, &create_table("t1")).await;

    let failpoints =
        TestEnv::failpoints(&[("before_execute:AlterPhysicalTablesTask", "suspend:500*1")]);
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", failpoints.clone()));
    let factory = DdlJobFactory::new();
    let first = scheduler
        .submit(factory.create_job(DdlType::AlterTable, &alter_table("t1", "c1")).unwrap())
        .await
        .unwrap();
    assert!(wait_for_hit(&failpoints, "before_execute:AlterPhysicalTablesTask").await);
    let second = scheduler
        .submit(factory.create_job(DdlType::AlterTable, &alter_table("t1", "c2")).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(scheduler.cancel(second).await.unwrap());
    let second = scheduler.await_terminal(second, WAIT).await.unwrap();
    assert_eq!(second.state, JobState::RollbackSuccess);
    assert!(second.tasks.iter().all(|t| t.state == TaskState::Ready));
    assert_eq!(stores.physical.count(&alter_sql("t1", 0, "c2")), 0);

    let first = scheduler.await_terminal(first, WAIT).await.unwrap();
    assert_eq!(first.state, JobState::Success);
    assert!(stores.lease.holder("ddl_object:db1.t1").is_none());
}

/// 记录同时执行的子任务数量
struct GaugeTask {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl DdlTask for GaugeTask {
    fn task_type(&self) -> &'static str {
        "GaugeTask"
    }

    fn describe(&self) -> String {
        "gauge".to_string()
    }

    async fn before_transaction(&self, _ctx: &TaskContext) -> DdlResult<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, _ctx: &TaskContext, _txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        Ok(())
    }

    async fn rollback(&self, _ctx: &TaskContext, _txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_independent_tasks_run_up_to_parallelism() {
    let stores = TestStores::new();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut registry = TaskRegistry::with_builtin_tasks();
    {
        let active = active.clone();
        let peak = peak.clone();
        registry.register("GaugeTask", move |_params| {
            Ok(Box::new(GaugeTask {
                active: active.clone(),
                peak: peak.clone(),
            }))
        });
    }
    let mut config = TestEnv::scheduler_config("node-1");
    config.task_parallelism = 2;
    let scheduler = DdlJobScheduler::new(
        common::builder(&stores, "node-1", FailPoints::disabled())
            .task_registry(Arc::new(registry))
            .scheduler_config(config)
            .build(),
    );

    let mut builder = JobBuilder::new("db1", DdlType::AlterTable, "ALTER TABLE t1 ADD c INT");
    for _ in 0..4 {
        builder.add_task(TaskSpec::new("GaugeTask", json!({})));
    }
    let job_id = scheduler.submit(builder.build().unwrap()).await.unwrap();
    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();

    assert_eq!(job.state, JobState::Success);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unknown_task_type_is_rejected_at_submit() {
    let stores = TestStores::new();
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));

    let mut builder = JobBuilder::new("db1", DdlType::AlterTable, "ALTER TABLE t1 ADD c INT");
    builder.add_task(TaskSpec::new("NoSuchTask", json!({})));

    assert!(scheduler.submit(builder.build().unwrap()).await.is_err());
    assert!(scheduler
        .list_jobs(&JobFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_list_and_purge_terminal_jobs() {
    let stores = TestStores::new();
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));
    run_to_end(&scheduler, DdlType::CreateTable, &create_table("t1")).await;
    run_to_end(&scheduler, DdlType::CreateTable, &create_table("t2")).await;

    let filter = JobFilter {
        state: Some(JobState::Success),
        ..Default::default()
    };
    assert_eq!(scheduler.list_jobs(&filter).await.unwrap().len(), 2);

    let purged = scheduler
        .purge(chrono::Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(purged, 2);
    assert!(scheduler
        .list_jobs(&JobFilter::default())
        .await
        .unwrap()
        .is_empty());
}
