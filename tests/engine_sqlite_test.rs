use std::time::Duration;

use anyhow::Result;
use ddl_core::{AppConfig, DatabaseConfig};
use ddl_dispatcher::DdlRequest;
use ddl_domain::{DdlType, JobState, PhysicalStatement, TaskState};
use ddl_engine::{Application, ShutdownManager};
use ddl_infrastructure::DatabaseManager;
use ddl_testing_utils::TestEnv;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn engine_config(dir: &TempDir, failpoints: &[(&str, &str)]) -> AppConfig {
    let mut config = AppConfig::default();
    config.database = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("ddl.db").display()),
        ..Default::default()
    };
    config.scheduler = TestEnv::scheduler_config("node-1");
    config.retry = TestEnv::retry_config(3);
    config.mdl = TestEnv::mdl_config();
    config.failpoint.enabled = !failpoints.is_empty();
    config.failpoint.points = failpoints
        .iter()
        .map(|(name, spec)| (name.to_string(), spec.to_string()))
        .collect();
    config
}

fn create_table(table: &str) -> DdlRequest {
    let shards = ["g0", "g1"];
    let statements = shards
        .iter()
        .enumerate()
        .map(|(i, shard)| {
            PhysicalStatement::new(*shard, format!("CREATE TABLE {table}_{i} (id INTEGER)"))
        })
        .collect();
    let rollback = shards
        .iter()
        .enumerate()
        .map(|(i, shard)| PhysicalStatement::new(*shard, format!("DROP TABLE IF EXISTS {table}_{i}")))
        .collect();
    DdlRequest::new("db1", table, format!("CREATE TABLE {table} (id INTEGER)"))
        .with_physical(statements, rollback)
}

async fn physical_table_exists(config: &AppConfig, name: &str) -> Result<bool> {
    let database = DatabaseManager::new(&config.database).await?;
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(database.pool())
            .await?;
    database.close().await;
    Ok(count > 0)
}

/// 物理建表提交后崩溃，重启后从CDC打标继续，物理语句不重复执行
#[tokio::test]
async fn test_create_table_survives_crash_after_physical_change() -> Result<()> {
    let dir = TempDir::new()?;

    let crashing = engine_config(&dir, &[("after_commit:CreatePhysicalTablesTask", "crash*1")]);
    let job_id = {
        let app = Application::new(crashing).await?;
        let job = app
            .job_factory()
            .create_job(DdlType::CreateTable, &create_table("t1"))?;
        let scheduler = app.scheduler();
        let job_id = scheduler.submit(job).await?;
        scheduler.shutdown().await;

        let crashed = scheduler.job_status(job_id).await?;
        assert_eq!(crashed.state, JobState::Running);
        assert!(app.cdc_sink().records_for_table("db1", "t1").await?.is_empty());
        job_id
    };

    let config = engine_config(&dir, &[]);
    assert!(physical_table_exists(&config, "t1_0").await?);

    let app = std::sync::Arc::new(Application::new(config.clone()).await?);
    let shutdown_manager = ShutdownManager::new(WAIT);
    let runner = {
        let app = app.clone();
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    let job = app.scheduler().await_terminal(job_id, WAIT).await?;
    assert_eq!(job.state, JobState::Success);
    assert!(job.tasks.iter().all(|t| t.state == TaskState::Success));

    let records = app.cdc_sink().records_for_table("db1", "t1").await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job_id, job_id);

    assert!(
        shutdown_manager
            .graceful_shutdown(async {
                let _ = runner.await;
            })
            .await
    );
    Ok(())
}

/// 物理语句执行后、子任务事务提交前崩溃，恢复时跳过已执行的语句，任务仍然成功
#[tokio::test]
async fn test_crash_before_physical_commit_resumes_to_success() -> Result<()> {
    let dir = TempDir::new()?;

    let crashing = engine_config(&dir, &[("before_commit:CreatePhysicalTablesTask", "crash*1")]);
    let job_id = {
        let app = Application::new(crashing).await?;
        let job = app
            .job_factory()
            .create_job(DdlType::CreateTable, &create_table("t1"))?;
        let scheduler = app.scheduler();
        let job_id = scheduler.submit(job).await?;
        scheduler.shutdown().await;
        assert_eq!(scheduler.job_status(job_id).await?.state, JobState::Running);
        job_id
    };

    let config = engine_config(&dir, &[]);
    assert!(physical_table_exists(&config, "t1_0").await?);
    assert!(physical_table_exists(&config, "t1_1").await?);

    // 重复执行 CREATE TABLE 会在SQLite上失败，任务成功说明语句没有重复执行
    let app = Application::new(config).await?;
    let report = app.scheduler().recover().await?;
    assert_eq!(report.jobs_resumed, 1);
    let job = app.scheduler().await_terminal(job_id, WAIT).await?;
    assert_eq!(job.state, JobState::Success);
    assert_eq!(app.cdc_sink().records_for_table("db1", "t1").await?.len(), 1);
    app.scheduler().shutdown().await;
    Ok(())
}

/// 物理建表前的致命错误回滚整个任务，重新提交得到新的任务并成功
#[tokio::test]
async fn test_fatal_error_rolls_back_and_resubmission_succeeds() -> Result<()> {
    let dir = TempDir::new()?;
    let config = engine_config(&dir, &[("before_execute:CreatePhysicalTablesTask", "fatal*1")]);
    let app = Application::new(config.clone()).await?;
    let scheduler = app.scheduler();

    let job = app
        .job_factory()
        .create_job(DdlType::CreateTable, &create_table("t1"))?;
    let failed_id = scheduler.submit(job).await?;
    let failed = scheduler.await_terminal(failed_id, WAIT).await?;
    assert_eq!(failed.state, JobState::RollbackSuccess);
    assert!(failed
        .tasks
        .iter()
        .all(|t| matches!(t.state, TaskState::RollbackSuccess | TaskState::Ready)));

    let job = app
        .job_factory()
        .create_job(DdlType::CreateTable, &create_table("t1"))?;
    let retried_id = scheduler.submit(job).await?;
    assert_ne!(retried_id, failed_id);
    let retried = scheduler.await_terminal(retried_id, WAIT).await?;
    assert_eq!(retried.state, JobState::Success);
    scheduler.shutdown().await;

    assert!(physical_table_exists(&config, "t1_1").await?);
    assert_eq!(app.cdc_sink().records_for_table("db1", "t1").await?.len(), 1);
    Ok(())
}

/// 已结束的任务可以被清理，未结束的任务保留
#[tokio::test]
async fn test_purge_removes_finished_jobs() -> Result<()> {
    let dir = TempDir::new()?;
    let app = Application::new(engine_config(&dir, &[])).await?;
    let scheduler = app.scheduler();

    let job = app
        .job_factory()
        .create_job(DdlType::CreateTable, &create_table("t1"))?;
    let job_id = scheduler.submit(job).await?;
    scheduler.await_terminal(job_id, WAIT).await?;

    let purged = scheduler
        .purge(chrono::Utc::now() + chrono::Duration::seconds(1))
        .await?;
    assert_eq!(purged, 1);
    assert!(scheduler.job_status(job_id).await.is_err());
    scheduler.shutdown().await;
    Ok(())
}
