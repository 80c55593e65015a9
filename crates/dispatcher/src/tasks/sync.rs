use async_trait::async_trait;
use ddl_domain::{DdlResult, MdlKey, MetaTransaction, SyncAction};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::TaskContext;
use crate::task::DdlTask;

/// 把同步命令广播到所有存活节点，不可达的节点不影响任务结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSchemaTask {
    pub action: SyncAction,
}

impl SyncSchemaTask {
    pub const TYPE: &'static str = "SyncSchemaTask";

    async fn broadcast(&self, ctx: &TaskContext, action: &SyncAction) -> DdlResult<()> {
        let report = ctx.engine.sync.broadcast(action).await?;
        if !report.is_complete() {
            ctx.engine
                .metrics
                .record_sync_unreachable(report.unreachable.len());
            warn!(
                job_id = ctx.job_id,
                task_id = ctx.task_id,
                "同步命令 {} 有 {} 个节点未送达",
                report.action,
                report.unreachable.len()
            );
        }
        Ok(())
    }

    /// 回滚时让所有节点丢弃缓存，重新加载恢复后的元数据
    fn invalidate_action(&self) -> SyncAction {
        match &self.action {
            SyncAction::InvalidateTable {
                schema_name,
                table_name,
            }
            | SyncAction::ReloadTable {
                schema_name,
                table_name,
            }
            | SyncAction::DropTable {
                schema_name,
                table_name,
            } => SyncAction::InvalidateTable {
                schema_name: schema_name.clone(),
                table_name: table_name.clone(),
            },
            SyncAction::Repartition {
                schema_name,
                primary_table,
                ..
            } => SyncAction::InvalidateTable {
                schema_name: schema_name.clone(),
                table_name: primary_table.clone(),
            },
        }
    }
}

#[async_trait]
impl DdlTask for SyncSchemaTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn describe(&self) -> String {
        format!("同步元数据 {}", self.action)
    }

    fn ddl_objects(&self, _ctx: &TaskContext) -> Vec<MdlKey> {
        match &self.action {
            SyncAction::InvalidateTable {
                schema_name,
                table_name,
            }
            | SyncAction::ReloadTable {
                schema_name,
                table_name,
            }
            | SyncAction::DropTable {
                schema_name,
                table_name,
            } => vec![MdlKey::new(schema_name, table_name)],
            SyncAction::Repartition {
                schema_name,
                primary_table,
                gsi_table,
                ..
            } => std::iter::once(primary_table)
                .chain(gsi_table)
                .map(|table| MdlKey::new(schema_name, table))
                .collect(),
        }
    }

    async fn execute(&self, ctx: &TaskContext, _txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        self.broadcast(ctx, &self.action).await
    }

    async fn rollback(&self, ctx: &TaskContext, _txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        self.broadcast(ctx, &self.invalidate_action()).await
    }
}
