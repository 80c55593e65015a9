//! 引擎运行所需的协作方集合，以及单个子任务执行时可见的上下文

use std::sync::Arc;
use std::time::Duration;

use ddl_core::{AppConfig, FailPoints, MdlConfig, RetryConfig, SchedulerConfig, SyncConfig};
use ddl_domain::{
    DdlType, DistributedLock, JobRepository, MetaStore, NodeRegistry, PhysicalExecutor,
    MdlKey, SchemaCache, SyncNode, TaskRecord,
};
use ddl_infrastructure::{
    CdcNotifier, DdlMetrics, InMemoryCdcSink, InMemoryDistributedLock, InMemoryJobRepository,
    InMemoryMetaStore, InMemorySchemaCache, LocalSyncNode, MdlContext, MdlManager,
    SchemaSyncHandler, StaticNodeRegistry, SyncBroadcaster,
};

use crate::registry::TaskRegistry;

/// 调度器、执行器和各个子任务共享的协作方，克隆只复制引用
#[derive(Clone)]
pub struct EngineContext {
    pub node_id: String,
    pub repository: Arc<dyn JobRepository>,
    pub meta_store: Arc<dyn MetaStore>,
    pub physical: Arc<dyn PhysicalExecutor>,
    pub cdc: Arc<CdcNotifier>,
    pub sync: Arc<SyncBroadcaster>,
    pub mdl: Arc<MdlManager>,
    pub lease: Arc<dyn DistributedLock>,
    pub registry: Arc<TaskRegistry>,
    pub failpoints: FailPoints,
    pub metrics: Arc<DdlMetrics>,
    pub scheduler_config: SchedulerConfig,
    pub retry_config: RetryConfig,
    pub mdl_config: MdlConfig,
}

impl EngineContext {
    pub fn builder(node_id: impl Into<String>) -> EngineContextBuilder {
        EngineContextBuilder::new(node_id)
    }

    pub fn lock_timeout(&self) -> Duration {
        self.mdl_config.lock_timeout()
    }

    /// 分布式租约锁的名字
    pub fn job_lease_name(job_id: i64) -> String {
        format!("ddl_job:{job_id}")
    }

    /// 跨节点串行化同一对象上DDL任务的分布式锁名字
    pub fn ddl_object_lock_name(key: &MdlKey) -> String {
        format!("ddl_object:{key}")
    }

    /// 同一个DDL任务的所有元数据锁使用同一个持有者，因此互相可重入
    pub fn job_mdl_owner(job_id: i64) -> String {
        format!("ddl_job:{job_id}")
    }
}

/// 未显式指定的协作方使用内存实现
pub struct EngineContextBuilder {
    node_id: String,
    repository: Option<Arc<dyn JobRepository>>,
    meta_store: Option<Arc<dyn MetaStore>>,
    physical: Option<Arc<dyn PhysicalExecutor>>,
    cdc_notifier: Option<Arc<CdcNotifier>>,
    schema_cache: Option<Arc<dyn SchemaCache>>,
    node_registry: Option<Arc<dyn NodeRegistry>>,
    mdl: Option<Arc<MdlManager>>,
    lease: Option<Arc<dyn DistributedLock>>,
    registry: Option<Arc<TaskRegistry>>,
    failpoints: FailPoints,
    scheduler_config: SchedulerConfig,
    retry_config: RetryConfig,
    mdl_config: MdlConfig,
    sync_config: SyncConfig,
}

impl EngineContextBuilder {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            repository: None,
            meta_store: None,
            physical: None,
            cdc_notifier: None,
            schema_cache: None,
            node_registry: None,
            mdl: None,
            lease: None,
            registry: None,
            failpoints: FailPoints::disabled(),
            scheduler_config: SchedulerConfig::default(),
            retry_config: RetryConfig::default(),
            mdl_config: MdlConfig::default(),
            sync_config: SyncConfig::default(),
        }
    }

    /// 使用配置文件中的调度、重试、MDL和同步参数
    pub fn with_app_config(mut self, config: &AppConfig) -> Self {
        self.scheduler_config = config.scheduler.clone();
        self.retry_config = config.retry.clone();
        self.mdl_config = config.mdl.clone();
        self.sync_config = config.sync.clone();
        self
    }

    pub fn repository(mut self, repository: Arc<dyn JobRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn meta_store(mut self, meta_store: Arc<dyn MetaStore>) -> Self {
        self.meta_store = Some(meta_store);
        self
    }

    pub fn physical_executor(mut self, physical: Arc<dyn PhysicalExecutor>) -> Self {
        self.physical = Some(physical);
        self
    }

    pub fn cdc_notifier(mut self, notifier: Arc<CdcNotifier>) -> Self {
        self.cdc_notifier = Some(notifier);
        self
    }

    /// 本节点的表元数据缓存，未指定节点注册表时只同步到本节点
    pub fn schema_cache(mut self, cache: Arc<dyn SchemaCache>) -> Self {
        self.schema_cache = Some(cache);
        self
    }

    pub fn node_registry(mut self, registry: Arc<dyn NodeRegistry>) -> Self {
        self.node_registry = Some(registry);
        self
    }

    pub fn mdl_manager(mut self, mdl: Arc<MdlManager>) -> Self {
        self.mdl = Some(mdl);
        self
    }

    pub fn lease(mut self, lease: Arc<dyn DistributedLock>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn task_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn failpoints(mut self, failpoints: FailPoints) -> Self {
        self.failpoints = failpoints;
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn mdl_config(mut self, config: MdlConfig) -> Self {
        self.mdl_config = config;
        self
    }

    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = config;
        self
    }

    pub fn build(self) -> EngineContext {
        let mdl = self.mdl.unwrap_or_else(|| Arc::new(MdlManager::new()));
        let node_registry: Arc<dyn NodeRegistry> = match self.node_registry {
            Some(registry) => registry,
            None => {
                let cache = self
                    .schema_cache
                    .unwrap_or_else(|| Arc::new(InMemorySchemaCache::new()));
                let local: Arc<dyn SyncNode> = Arc::new(LocalSyncNode::new(SchemaSyncHandler::new(
                    self.node_id.clone(),
                    cache,
                    mdl.clone(),
                    self.mdl_config.lock_timeout(),
                )));
                Arc::new(StaticNodeRegistry::new(vec![local]))
            }
        };

        EngineContext {
            repository: self
                .repository
                .unwrap_or_else(|| Arc::new(InMemoryJobRepository::new())),
            meta_store: self
                .meta_store
                .unwrap_or_else(|| Arc::new(InMemoryMetaStore::new())),
            physical: self
                .physical
                .unwrap_or_else(|| Arc::new(crate::tasks::NoopPhysicalExecutor)),
            cdc: self
                .cdc_notifier
                .unwrap_or_else(|| Arc::new(CdcNotifier::new(Arc::new(InMemoryCdcSink::new())))),
            sync: Arc::new(SyncBroadcaster::new(node_registry, &self.sync_config)),
            mdl,
            lease: self
                .lease
                .unwrap_or_else(|| Arc::new(InMemoryDistributedLock::new())),
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(TaskRegistry::with_builtin_tasks())),
            failpoints: self.failpoints,
            metrics: Arc::new(DdlMetrics::new()),
            node_id: self.node_id,
            scheduler_config: self.scheduler_config,
            retry_config: self.retry_config,
            mdl_config: self.mdl_config,
        }
    }
}

/// 驱动中的DDL任务的标识信息和任务级别的元数据锁
#[derive(Clone)]
pub struct JobScope {
    pub job_id: i64,
    pub schema_name: String,
    pub ddl_type: DdlType,
    pub ddl_stmt: String,
    pub trace_id: String,
    /// INSTANCE级别的锁，任务结束或回滚时释放
    pub job_mdl: Arc<MdlContext>,
}

impl JobScope {
    pub fn owner(&self) -> String {
        EngineContext::job_mdl_owner(self.job_id)
    }

    pub fn task_context(&self, engine: &EngineContext, task: &TaskRecord) -> TaskContext {
        TaskContext {
            job_id: self.job_id,
            task_id: task.task_id,
            task_type: task.task_type.clone(),
            schema_name: self.schema_name.clone(),
            ddl_type: self.ddl_type,
            ddl_stmt: self.ddl_stmt.clone(),
            trace_id: self.trace_id.clone(),
            engine: engine.clone(),
            job_mdl: self.job_mdl.clone(),
        }
    }
}

/// 子任务执行时可见的上下文
#[derive(Clone)]
pub struct TaskContext {
    pub job_id: i64,
    pub task_id: i64,
    pub task_type: String,
    pub schema_name: String,
    pub ddl_type: DdlType,
    pub ddl_stmt: String,
    pub trace_id: String,
    pub engine: EngineContext,
    pub job_mdl: Arc<MdlContext>,
}
