use std::sync::Arc;

use anyhow::{Context, Result};
use ddl_core::{AppConfig, FailPoints};
use ddl_dispatcher::{DdlJobFactory, DdlJobScheduler, EngineContext};
use ddl_domain::{CdcSink, DistributedLock, JobRepository, MetaStore, PhysicalExecutor};
use ddl_infrastructure::{
    CdcNotifier, DatabaseManager, InMemorySchemaCache, SqliteCdcSink, SqliteDistributedLock,
    SqliteJobRepository, SqliteMetaStore, SqlitePhysicalExecutor,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// 单节点部署：任务存储、元数据、租约和CDC记录都落在同一个SQLite库
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    scheduler: Arc<DdlJobScheduler>,
    factory: DdlJobFactory,
    cdc_sink: Arc<SqliteCdcSink>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!(
            node_id = %config.scheduler.node_id,
            database = %config.database.url,
            "初始化DDL引擎"
        );

        let database = DatabaseManager::new(&config.database)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
        let pool = database.pool().clone();

        let failpoints =
            FailPoints::from_config(&config.failpoint).context("加载故障注入配置失败")?;
        if failpoints.is_enabled() {
            warn!("故障注入已启用，不要在生产环境使用");
        }

        let cdc_sink = Arc::new(SqliteCdcSink::new(pool.clone()));
        let sink: Arc<dyn CdcSink> = cdc_sink.clone();
        let repository: Arc<dyn JobRepository> = Arc::new(SqliteJobRepository::new(pool.clone()));
        let meta_store: Arc<dyn MetaStore> = Arc::new(SqliteMetaStore::new(pool.clone()));
        let lease: Arc<dyn DistributedLock> = Arc::new(SqliteDistributedLock::new(pool.clone()));
        let physical: Arc<dyn PhysicalExecutor> = Arc::new(SqlitePhysicalExecutor::new(pool));

        let engine = EngineContext::builder(config.scheduler.node_id.clone())
            .with_app_config(&config)
            .repository(repository)
            .meta_store(meta_store)
            .physical_executor(physical)
            .cdc_notifier(Arc::new(CdcNotifier::new(sink)))
            .schema_cache(Arc::new(InMemorySchemaCache::new()))
            .lease(lease)
            .failpoints(failpoints)
            .build();

        Ok(Self {
            config,
            database,
            scheduler: Arc::new(DdlJobScheduler::new(engine)),
            factory: DdlJobFactory::new(),
            cdc_sink,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn scheduler(&self) -> Arc<DdlJobScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn job_factory(&self) -> &DdlJobFactory {
        &self.factory
    }

    pub fn cdc_sink(&self) -> Arc<SqliteCdcSink> {
        Arc::clone(&self.cdc_sink)
    }

    /// 恢复未完成的任务后进入扫描循环，收到关闭信号后等待驱动中的任务退出
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.database
            .health_check()
            .await
            .context("数据库健康检查失败")?;

        let report = self.scheduler.recover().await.context("启动恢复失败")?;
        info!(
            resumed = report.jobs_resumed,
            reset = report.tasks_reset,
            skipped = report.skipped,
            "启动恢复完成"
        );

        self.scheduler.run(shutdown_rx).await;

        info!(active = self.scheduler.active_jobs(), "等待驱动中的DDL任务退出");
        self.scheduler.shutdown().await;
        self.database.close().await;
        info!("DDL引擎已停止");
        Ok(())
    }
}
