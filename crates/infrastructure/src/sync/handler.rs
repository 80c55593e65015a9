use std::sync::Arc;
use std::time::Duration;

use ddl_domain::{MdlRequest, SchemaCache, SyncAction};
use ddl_errors::DdlResult;
use tracing::{debug, instrument, warn};

use crate::mdl::MdlManager;

/// 在单个节点上执行同步命令
pub struct SchemaSyncHandler {
    node_id: String,
    cache: Arc<dyn SchemaCache>,
    mdl: Arc<MdlManager>,
    lock_timeout: Duration,
}

impl SchemaSyncHandler {
    pub fn new(
        node_id: impl Into<String>,
        cache: Arc<dyn SchemaCache>,
        mdl: Arc<MdlManager>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            cache,
            mdl,
            lock_timeout,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[instrument(skip(self), fields(node_id = %self.node_id, action = %action))]
    pub async fn handle(&self, action: &SyncAction) -> DdlResult<()> {
        match action {
            SyncAction::InvalidateTable {
                schema_name,
                table_name,
            } => self.cache.invalidate(schema_name, table_name).await,
            SyncAction::ReloadTable {
                schema_name,
                table_name,
            } => self.reload_or_invalidate(schema_name, table_name).await,
            SyncAction::DropTable {
                schema_name,
                table_name,
            } => self.cache.to_new_version(schema_name, table_name).await,
            SyncAction::Repartition {
                schema_name,
                primary_table,
                gsi_table,
                trace_id,
            } => {
                self.repartition(schema_name, primary_table, gsi_table.as_deref(), trace_id)
                    .await
            }
        }
    }

    async fn repartition(
        &self,
        schema_name: &str,
        primary_table: &str,
        gsi_table: Option<&str>,
        trace_id: &str,
    ) -> DdlResult<()> {
        // 获取并立即释放主表的排他锁，等待跨新旧分区状态的事务结束
        let owner = format!("sync:{}:{}", self.node_id, trace_id);
        let ticket = self
            .mdl
            .acquire(
                &owner,
                &MdlRequest::exclusive(0, schema_name, primary_table),
                self.lock_timeout,
            )
            .await?;
        self.mdl.release(&ticket);

        self.cache.to_new_version(schema_name, primary_table).await?;
        if let Some(gsi_table) = gsi_table {
            self.reload_or_invalidate(schema_name, gsi_table).await?;
        }
        self.reload_or_invalidate(schema_name, primary_table).await?;
        self.cache.invalidate_plan_cache(schema_name).await
    }

    async fn reload_or_invalidate(&self, schema_name: &str, table_name: &str) -> DdlResult<()> {
        match self.cache.reload(schema_name, table_name).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "重新加载表 {}.{} 失败，改为使缓存失效: {}",
                    schema_name, table_name, e
                );
                self.cache.invalidate(schema_name, table_name).await?;
                debug!("表 {}.{} 已回退为缓存失效", schema_name, table_name);
                Ok(())
            }
        }
    }
}
