//! 测试环境辅助
//!
//! `TestStores` 保存跨“进程重启”共享的存储：同一组存储上新建的调度器
//! 就像另一个节点或重启后的同一节点。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ddl_core::{FailPointAction, FailPoints, MdlConfig, RetryConfig, SchedulerConfig};
use ddl_domain::{CdcSink, DistributedLock, JobRepository, MetaStore};
use ddl_infrastructure::{
    CdcNotifier, InMemoryCdcSink, InMemoryDistributedLock, InMemoryJobRepository,
    InMemoryMetaStore, InMemorySchemaCache, MdlManager,
};
use tokio::time::sleep;

use crate::mocks::CountingPhysicalExecutor;

/// 持久化存储和外部副作用的观察点
#[derive(Clone)]
pub struct TestStores {
    pub repository: Arc<InMemoryJobRepository>,
    pub meta_store: Arc<InMemoryMetaStore>,
    pub lease: Arc<InMemoryDistributedLock>,
    pub cdc_sink: Arc<InMemoryCdcSink>,
    pub physical: Arc<CountingPhysicalExecutor>,
    pub schema_cache: Arc<InMemorySchemaCache>,
    /// 元数据锁在进程内，重启后应换成新的管理器
    pub mdl: Arc<MdlManager>,
}

impl TestStores {
    pub fn new() -> Self {
        Self {
            repository: Arc::new(InMemoryJobRepository::new()),
            meta_store: Arc::new(InMemoryMetaStore::new()),
            lease: Arc::new(InMemoryDistributedLock::new()),
            cdc_sink: Arc::new(InMemoryCdcSink::new()),
            physical: Arc::new(CountingPhysicalExecutor::new()),
            schema_cache: Arc::new(InMemorySchemaCache::new()),
            mdl: Arc::new(MdlManager::new()),
        }
    }

    pub fn repository(&self) -> Arc<dyn JobRepository> {
        self.repository.clone()
    }

    pub fn meta_store(&self) -> Arc<dyn MetaStore> {
        self.meta_store.clone()
    }

    pub fn lease(&self) -> Arc<dyn DistributedLock> {
        self.lease.clone()
    }

    pub fn cdc_notifier(&self) -> Arc<CdcNotifier> {
        let sink: Arc<dyn CdcSink> = self.cdc_sink.clone();
        Arc::new(CdcNotifier::new(sink))
    }
}

impl Default for TestStores {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TestEnv;

impl TestEnv {
    /// 轮询直到条件成立或超时
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// 测试用的短间隔配置
    pub fn scheduler_config(node_id: &str) -> SchedulerConfig {
        SchedulerConfig {
            node_id: node_id.to_string(),
            max_concurrent_jobs: 4,
            task_parallelism: 4,
            scan_interval_seconds: 1,
            job_lease_ttl_seconds: 1,
        }
    }

    pub fn retry_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_interval_ms: 1,
            max_interval_ms: 5,
            jitter_factor: 0.0,
            ..RetryConfig::default()
        }
    }

    pub fn mdl_config() -> MdlConfig {
        MdlConfig {
            lock_timeout_ms: 200,
        }
    }

    /// 按 `(注入点, 动作描述)` 启用故障点，动作描述与配置文件格式相同
    pub fn failpoints(specs: &[(&str, &str)]) -> FailPoints {
        let failpoints = FailPoints::enabled();
        for (name, spec) in specs {
            let (action, times) = FailPointAction::parse(spec).unwrap();
            failpoints.arm_times(name, action, times);
        }
        failpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_for_polls_until_true() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ok = TestEnv::wait_for(
            || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 3 }
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let ok = TestEnv::wait_for(|| async { false }, Duration::from_millis(30)).await;
        assert!(!ok);
    }
}
