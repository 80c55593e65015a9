mod common;

use std::sync::Arc;
use std::time::Duration;

use ddl_core::FailPoints;
use ddl_dispatcher::{DdlJobFactory, DdlJobScheduler, DdlRequest};
use ddl_domain::{DdlType, DistributedLock, JobRepository, JobState, MdlKey, TaskState};
use ddl_infrastructure::MdlManager;
use ddl_testing_utils::{TestEnv, TestStores};
use tokio::sync::broadcast;

use common::{create_sql, create_table, engine};

const WAIT: Duration = Duration::from_secs(5);

/// 在注入崩溃的调度器上提交任务，等待驱动流程退出
async fn submit_and_crash(stores: &TestStores, failpoint: &str, request: &DdlRequest) -> i64 {
    let failpoints = TestEnv::failpoints(&[(failpoint, "crash*1")]);
    let scheduler = DdlJobScheduler::new(engine(stores, "node-1", failpoints));
    let job = DdlJobFactory::new()
        .create_job(DdlType::CreateTable, request)
        .unwrap();
    let job_id = scheduler.submit(job).await.unwrap();
    scheduler.shutdown().await;
    job_id
}

/// 同一组存储上重启：元数据锁属于进程，换成新的管理器
fn restart(stores: &mut TestStores, node_id: &str) -> DdlJobScheduler {
    stores.mdl = Arc::new(MdlManager::new());
    DdlJobScheduler::new(engine(stores, node_id, FailPoints::disabled()))
}

#[tokio::test]
async fn test_crash_after_cdc_mark_is_recovered_exactly_once() {
    let mut stores = TestStores::new();
    let job_id = submit_and_crash(&stores, "after_commit:CdcMarkTask", &create_table("t1")).await;

    let crashed = stores.repository.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(crashed.state, JobState::Running);
    let cdc = crashed
        .tasks
        .iter()
        .find(|t| t.task_type == "CdcMarkTask")
        .unwrap();
    assert_eq!(cdc.state, TaskState::Running);
    assert_eq!(stores.cdc_sink.event_count(), 1);

    let scheduler = restart(&mut stores, "node-1");
    let report = scheduler.recover().await.unwrap();
    assert_eq!(report.jobs_resumed, 1);
    assert_eq!(report.tasks_reset, 1);

    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Success);
    assert_eq!(stores.cdc_sink.event_count(), 1);
    // 投递标记已提交，恢复后不再调用下游
    assert_eq!(stores.cdc_sink.delivery_attempts(), 1);
    assert_eq!(stores.physical.count(&create_sql("t1", 0)), 1);
}

#[tokio::test]
async fn test_crash_before_physical_commit_does_not_repeat_statements() {
    let mut stores = TestStores::new();
    let job_id = submit_and_crash(
        &stores,
        "before_commit:CreatePhysicalTablesTask",
        &create_table("t1"),
    )
    .await;

    // 物理语句已执行，但子任务的元数据事务没有提交
    let crashed = stores.repository.get_job(job_id).await.unwrap().unwrap();
    let physical = crashed
        .tasks
        .iter()
        .find(|t| t.task_type == "CreatePhysicalTablesTask")
        .unwrap();
    assert_eq!(physical.state, TaskState::Running);
    assert_eq!(stores.physical.count(&create_sql("t1", 0)), 1);

    let scheduler = restart(&mut stores, "node-1");
    scheduler.recover().await.unwrap();
    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();

    assert_eq!(job.state, JobState::Success);
    assert_eq!(stores.physical.count(&create_sql("t1", 0)), 1);
    assert_eq!(stores.physical.count(&create_sql("t1", 1)), 1);
}

#[tokio::test]
async fn test_crash_after_physical_change_does_not_repeat_it() {
    let mut stores = TestStores::new();
    let job_id = submit_and_crash(
        &stores,
        "after_commit:CreatePhysicalTablesTask",
        &create_table("t1"),
    )
    .await;
    assert_eq!(stores.physical.count(&create_sql("t1", 0)), 1);
    assert_eq!(stores.cdc_sink.event_count(), 0);

    let scheduler = restart(&mut stores, "node-1");
    scheduler.recover().await.unwrap();
    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();

    assert_eq!(job.state, JobState::Success);
    assert_eq!(stores.physical.count(&create_sql("t1", 0)), 1);
    assert_eq!(stores.physical.count(&create_sql("t1", 1)), 1);
    assert_eq!(stores.cdc_sink.event_count(), 1);
}

#[tokio::test]
async fn test_crash_between_commit_and_delivery_redelivers_event() {
    let mut stores = TestStores::new();
    let setup = DdlJobScheduler::new(engine(&stores, "node-1", FailPoints::disabled()));
    let created = setup
        .submit(
            DdlJobFactory::new()
                .create_job(DdlType::CreateTable, &create_table("t1"))
                .unwrap(),
        )
        .await
        .unwrap();
    setup.await_terminal(created, WAIT).await.unwrap();

    // 改名和打标在同一个事务中提交，事务提交后、投递前崩溃
    let failpoints = TestEnv::failpoints(&[("after_commit:UpdateTableMetaTask", "crash*1")]);
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", failpoints));
    let request = DdlRequest::new("db1", "t1", "RENAME TABLE t1 TO t2").with_new_table_name("t2");
    let job_id = scheduler
        .submit(
            DdlJobFactory::new()
                .create_job(DdlType::RenameTable, &request)
                .unwrap(),
        )
        .await
        .unwrap();
    scheduler.shutdown().await;
    assert_eq!(stores.cdc_sink.event_count(), 1);

    let scheduler = restart(&mut stores, "node-1");
    scheduler.recover().await.unwrap();
    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();

    assert_eq!(job.state, JobState::Success);
    let events = stores.cdc_sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].ddl_kind, "RENAME_TABLE");
}

#[tokio::test]
async fn test_crash_during_rollback_resumes_rollback() {
    let mut stores = TestStores::new();
    let failpoints = TestEnv::failpoints(&[
        ("before_execute:UpdateTableMetaTask", "fatal"),
        ("before_rollback:CreatePhysicalTablesTask", "crash*1"),
    ]);
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", failpoints));
    let job_id = scheduler
        .submit(
            DdlJobFactory::new()
                .create_job(DdlType::CreateTable, &create_table("t1"))
                .unwrap(),
        )
        .await
        .unwrap();
    scheduler.shutdown().await;

    let crashed = stores.repository.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(crashed.state, JobState::RollbackRunning);

    let scheduler = restart(&mut stores, "node-1");
    scheduler.recover().await.unwrap();
    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();

    assert_eq!(job.state, JobState::RollbackSuccess);
    assert_eq!(stores.physical.count(&common::drop_sql("t1", 0)), 1);
    assert!(!stores.mdl.is_locked(&MdlKey::new("db1", "t1")));
}

#[tokio::test]
async fn test_other_node_takes_over_after_lease_expiry() {
    let mut stores = TestStores::new();
    let job_id = submit_and_crash(&stores, "before_execute:CdcMarkTask", &create_table("t1")).await;

    let other = restart(&mut stores, "node-2");
    let report = other.recover().await.unwrap();
    assert_eq!(report.jobs_resumed, 0);
    assert_eq!(report.skipped, 1);

    // 崩溃节点的租约在TTL之后过期
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let report = other.recover().await.unwrap();
    assert_eq!(report.jobs_resumed, 1);

    let job = other.await_terminal(job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Success);
    assert_eq!(stores.cdc_sink.event_count(), 1);
}

#[tokio::test]
async fn test_scan_loop_picks_up_unfinished_jobs() {
    let mut stores = TestStores::new();
    let job_id = submit_and_crash(&stores, "before_execute:SyncSchemaTask", &create_table("t1")).await;

    let scheduler = Arc::new(restart(&mut stores, "node-1"));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Success);

    shutdown_tx.send(()).unwrap();
    runner.await.unwrap();
    scheduler.shutdown().await;
    assert_eq!(scheduler.active_jobs(), 0);
}

#[tokio::test]
async fn test_recover_skips_jobs_driven_locally() {
    let stores = TestStores::new();
    let failpoints =
        TestEnv::failpoints(&[("before_execute:CreatePhysicalTablesTask", "suspend:200*1")]);
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", failpoints));
    let job_id = scheduler
        .submit(
            DdlJobFactory::new()
                .create_job(DdlType::CreateTable, &create_table("t1"))
                .unwrap(),
        )
        .await
        .unwrap();

    let report = scheduler.recover().await.unwrap();
    assert_eq!(report.jobs_resumed, 0);
    assert_eq!(report.skipped, 1);
    assert!(report.is_clean());

    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Success);
    assert_eq!(stores.physical.count(&create_sql("t1", 0)), 1);
}

#[tokio::test]
async fn test_rollback_stops_after_lease_is_lost() {
    let stores = TestStores::new();
    let failpoints = TestEnv::failpoints(&[
        ("before_execute:UpdateTableMetaTask", "fatal"),
        ("before_rollback:CreatePhysicalTablesTask", "suspend:800*1"),
    ]);
    let scheduler = DdlJobScheduler::new(engine(&stores, "node-1", failpoints.clone()));
    let job_id = scheduler
        .submit(
            DdlJobFactory::new()
                .create_job(DdlType::CreateTable, &create_table("t1"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(
        TestEnv::wait_for(
            || {
                let failpoints = failpoints.clone();
                async move { failpoints.hits("before_rollback:CreatePhysicalTablesTask") > 0 }
            },
            WAIT,
        )
        .await
    );

    // 回滚进行中租约被其他节点拿走
    let lease = format!("ddl_job:{job_id}");
    assert!(stores.lease.release(&lease, "node-1").await.unwrap());
    assert!(stores
        .lease
        .try_acquire(&lease, "node-2", Duration::from_secs(30))
        .await
        .unwrap());
    scheduler.shutdown().await;

    let job = stores.repository.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::RollbackRunning);
    // 在途的撤销完成，之后的子任务留给新的持有者
    let state_of = |task_type: &str| {
        job.tasks
            .iter()
            .find(|t| t.task_type == task_type)
            .map(|t| t.state)
            .unwrap()
    };
    assert_eq!(state_of("CreatePhysicalTablesTask"), TaskState::RollbackSuccess);
    assert_eq!(job.tasks[0].state, TaskState::Success);
}
