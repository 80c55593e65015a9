//! 可观测的协作方替身
//!
//! 与基础设施层的内存实现不同，这些替身会记录每一次调用并支持注入失败，
//! 用来断言“物理语句只执行一次”“节点不可达时任务仍然完成”之类的性质。

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ddl_domain::{CdcEvent, CdcSink, PhysicalExecutor, PhysicalStatement, SchemaCache, SyncAction, SyncNode};
use ddl_errors::{DdlError, DdlResult};
use ddl_infrastructure::InMemoryCdcSink;

/// 记录所有执行过的物理语句
#[derive(Debug, Default)]
pub struct CountingPhysicalExecutor {
    executed: Mutex<Vec<PhysicalStatement>>,
    transient_failures: AtomicU32,
    failing_sql: Mutex<HashSet<String>>,
}

impl CountingPhysicalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来的 `n` 次执行返回可重试的网络错误
    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// 执行到该语句时总是返回不可重试的错误
    pub fn fail_on(&self, sql: &str) {
        self.failing_sql.lock().unwrap().insert(sql.to_string());
    }

    pub fn clear_failures(&self) {
        self.transient_failures.store(0, Ordering::SeqCst);
        self.failing_sql.lock().unwrap().clear();
    }

    pub fn executed(&self) -> Vec<PhysicalStatement> {
        self.executed.lock().unwrap().clone()
    }

    pub fn total(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    pub fn count(&self, sql: &str) -> usize {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.sql == sql)
            .count()
    }
}

#[async_trait]
impl PhysicalExecutor for CountingPhysicalExecutor {
    async fn execute(&self, statement: &PhysicalStatement) -> DdlResult<()> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DdlError::Network(format!(
                "分片 {} 暂时不可用",
                statement.shard
            )));
        }
        if self.failing_sql.lock().unwrap().contains(&statement.sql) {
            return Err(DdlError::task_fatal(format!(
                "分片 {} 拒绝执行: {}",
                statement.shard, statement.sql
            )));
        }
        self.executed.lock().unwrap().push(statement.clone());
        Ok(())
    }
}

/// 记录每一次缓存操作，格式为 `操作:schema.table`
#[derive(Debug, Default)]
pub struct RecordingSchemaCache {
    calls: Mutex<Vec<String>>,
}

impl RecordingSchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    fn record(&self, operation: &str, target: String) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{operation}:{target}"));
    }
}

#[async_trait]
impl SchemaCache for RecordingSchemaCache {
    async fn invalidate(&self, schema_name: &str, table_name: &str) -> DdlResult<()> {
        self.record("invalidate", format!("{schema_name}.{table_name}"));
        Ok(())
    }

    async fn reload(&self, schema_name: &str, table_name: &str) -> DdlResult<()> {
        self.record("reload", format!("{schema_name}.{table_name}"));
        Ok(())
    }

    async fn to_new_version(&self, schema_name: &str, table_name: &str) -> DdlResult<()> {
        self.record("to_new_version", format!("{schema_name}.{table_name}"));
        Ok(())
    }

    async fn invalidate_plan_cache(&self, schema_name: &str) -> DdlResult<()> {
        self.record("invalidate_plan_cache", schema_name.to_string());
        Ok(())
    }
}

/// 总是不可达的计算节点
#[derive(Debug)]
pub struct UnreachableNode {
    node_id: String,
    calls: AtomicUsize,
}

impl UnreachableNode {
    pub fn new(node_id: &str) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncNode for UnreachableNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn apply(&self, action: &SyncAction) -> DdlResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DdlError::Network(format!(
            "节点 {} 不可达，无法执行 {}",
            self.node_id, action
        )))
    }
}

/// 前几次投递失败的CDC下游，之后委托给去重的内存下游
#[derive(Debug, Default)]
pub struct FlakyCdcSink {
    inner: InMemoryCdcSink,
    failures_left: AtomicU32,
}

impl FlakyCdcSink {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryCdcSink::new(),
            failures_left: AtomicU32::new(failures),
        }
    }

    pub fn events(&self) -> Vec<CdcEvent> {
        self.inner.events()
    }

    pub fn event_count(&self) -> usize {
        self.inner.event_count()
    }
}

#[async_trait]
impl CdcSink for FlakyCdcSink {
    async fn notify(&self, event: &CdcEvent) -> DdlResult<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(DdlError::Network("CDC下游暂时不可用".to_string()));
        }
        self.inner.notify(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counting_executor_injects_failures() {
        let executor = CountingPhysicalExecutor::new();
        let stmt = PhysicalStatement::new("g0", "CREATE TABLE t1_0 (id INT)");

        executor.fail_next(1);
        assert!(matches!(
            executor.execute(&stmt).await,
            Err(DdlError::Network(_))
        ));
        executor.execute(&stmt).await.unwrap();
        assert_eq!(executor.count("CREATE TABLE t1_0 (id INT)"), 1);

        executor.fail_on("DROP TABLE t1_0");
        let err = executor
            .execute(&PhysicalStatement::new("g0", "DROP TABLE t1_0"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(executor.total(), 1);
    }

    #[tokio::test]
    async fn test_recording_cache_counts_by_operation() {
        let cache = RecordingSchemaCache::new();
        cache.invalidate("db1", "t1").await.unwrap();
        cache.reload("db1", "t1").await.unwrap();
        cache.invalidate("db1", "t2").await.unwrap();

        assert_eq!(cache.count("invalidate"), 2);
        assert_eq!(cache.calls()[1], "reload:db1.t1");
    }
}
