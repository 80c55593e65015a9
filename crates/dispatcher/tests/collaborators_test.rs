mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ddl_core::{FailPoints, SyncConfig};
use ddl_dispatcher::{DdlJobFactory, DdlJobScheduler, DdlRequest, DdlTask, TaskContext, TaskRegistry};
use ddl_domain::{
    CdcSink, DdlResult, DdlType, JobState, MetaTransaction, PhysicalStatement, SyncNode,
};
use ddl_infrastructure::{CdcNotifier, LocalSyncNode, SchemaSyncHandler, StaticNodeRegistry};
use ddl_testing_utils::{
    chain_job, FlakyCdcSink, RecordingSchemaCache, TestEnv, TestStores, UnreachableNode,
};
use serde_json::json;

use common::{builder, create_table};

const WAIT: Duration = Duration::from_secs(5);

/// 本节点使用记录型缓存，另加一个总是不可达的远端节点
fn cluster(
    stores: &TestStores,
    cache: Arc<RecordingSchemaCache>,
    remote: Arc<UnreachableNode>,
) -> StaticNodeRegistry {
    let local: Arc<dyn SyncNode> = Arc::new(LocalSyncNode::new(SchemaSyncHandler::new(
        "node-1",
        cache,
        stores.mdl.clone(),
        TestEnv::mdl_config().lock_timeout(),
    )));
    let remote: Arc<dyn SyncNode> = remote;
    StaticNodeRegistry::new(vec![local, remote])
}

fn sync_config() -> SyncConfig {
    SyncConfig {
        node_timeout_ms: 100,
        max_attempts: 2,
    }
}

#[tokio::test]
async fn test_unreachable_node_does_not_fail_the_job() {
    let stores = TestStores::new();
    let cache = Arc::new(RecordingSchemaCache::new());
    let remote = UnreachableNode::new("node-2");
    let scheduler = DdlJobScheduler::new(
        builder(&stores, "node-1", FailPoints::disabled())
            .node_registry(Arc::new(cluster(&stores, cache.clone(), remote.clone())))
            .sync_config(sync_config())
            .build(),
    );

    let job = DdlJobFactory::new()
        .create_job(DdlType::CreateTable, &create_table("t1"))
        .unwrap();
    let job_id = scheduler.submit(job).await.unwrap();
    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();

    assert_eq!(job.state, JobState::Success);
    assert_eq!(remote.calls(), 2);
    assert_eq!(cache.calls(), vec!["invalidate:db1.t1".to_string()]);
}

#[tokio::test]
async fn test_repartition_drains_and_reloads_gsi_before_primary() {
    let stores = TestStores::new();
    let cache = Arc::new(RecordingSchemaCache::new());
    let remote = UnreachableNode::new("node-2");
    let scheduler = DdlJobScheduler::new(
        builder(&stores, "node-1", FailPoints::disabled())
            .node_registry(Arc::new(cluster(&stores, cache.clone(), remote)))
            .sync_config(sync_config())
            .build(),
    );
    let factory = DdlJobFactory::new();

    let created = scheduler
        .submit(factory.create_job(DdlType::CreateTable, &create_table("t1")).unwrap())
        .await
        .unwrap();
    scheduler.await_terminal(created, WAIT).await.unwrap();

    let request = DdlRequest::new("db1", "t1", "ALTER TABLE t1 PARTITION BY HASH(id) PARTITIONS 4")
        .with_physical(
            vec![PhysicalStatement::new("g0", "CREATE TABLE t1_p0 (id INT)")],
            vec![PhysicalStatement::new("g0", "DROP TABLE IF EXISTS t1_p0")],
        )
        .with_gsi_table("g_t1")
        .with_trace_id("trace-repartition");
    let job_id = scheduler
        .submit(factory.create_job(DdlType::Repartition, &request).unwrap())
        .await
        .unwrap();
    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();

    assert_eq!(job.state, JobState::Success);
    assert_eq!(job.trace_id, "trace-repartition");
    assert_eq!(
        cache.calls()[1..],
        [
            "to_new_version:db1.t1".to_string(),
            "reload:db1.g_t1".to_string(),
            "reload:db1.t1".to_string(),
            "invalidate_plan_cache:db1".to_string(),
        ]
    );
    assert_eq!(cache.count("invalidate"), 1);
}

#[tokio::test]
async fn test_failed_cdc_delivery_is_retried_without_duplicates() {
    let stores = TestStores::new();
    let sink = Arc::new(FlakyCdcSink::new(1));
    let notifier_sink: Arc<dyn CdcSink> = sink.clone();
    let scheduler = DdlJobScheduler::new(
        builder(&stores, "node-1", FailPoints::disabled())
            .cdc_notifier(Arc::new(CdcNotifier::new(notifier_sink)))
            .build(),
    );

    let job = DdlJobFactory::new()
        .create_job(DdlType::CreateTable, &create_table("t1"))
        .unwrap();
    let job_id = scheduler.submit(job).await.unwrap();
    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();

    assert_eq!(job.state, JobState::Success);
    let cdc = job
        .tasks
        .iter()
        .find(|t| t.task_type == "CdcMarkTask")
        .unwrap();
    assert_eq!(cdc.retry_count, 1);
    assert_eq!(sink.event_count(), 1);
    assert_eq!(sink.events()[0].job_id, job_id);
}

/// 按执行顺序记录自己的名字
struct OrderTask {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl DdlTask for OrderTask {
    fn task_type(&self) -> &'static str {
        "OrderTask"
    }

    fn describe(&self) -> String {
        format!("order {}", self.name)
    }

    async fn execute(&self, _ctx: &TaskContext, _txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        self.log.lock().unwrap().push(self.name.clone());
        Ok(())
    }

    async fn rollback(&self, _ctx: &TaskContext, _txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_chained_tasks_run_in_dependency_order() {
    let stores = TestStores::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut registry = TaskRegistry::with_builtin_tasks();
    {
        let log = log.clone();
        registry.register("OrderTask", move |params| {
            Ok(Box::new(OrderTask {
                name: params["name"].as_str().unwrap_or_default().to_string(),
                log: log.clone(),
            }))
        });
    }
    let scheduler = DdlJobScheduler::new(
        builder(&stores, "node-1", FailPoints::disabled())
            .task_registry(Arc::new(registry))
            .build(),
    );

    let job = chain_job(
        DdlType::AlterTable,
        vec![
            ("OrderTask", json!({"name": "first"})),
            ("OrderTask", json!({"name": "second"})),
            ("OrderTask", json!({"name": "third"})),
        ],
    );
    let job_id = scheduler.submit(job).await.unwrap();
    let job = scheduler.await_terminal(job_id, WAIT).await.unwrap();

    assert_eq!(job.state, JobState::Success);
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
}
