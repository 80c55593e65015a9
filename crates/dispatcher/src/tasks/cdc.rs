use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use ddl_domain::{CdcEvent, DdlResult, DdlVisibility, MetaTransaction};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::TaskContext;
use crate::task::DdlTask;

/// 向复制下游发送DDL事件，打标记录随元数据事务提交，提交后投递
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcMarkTask {
    pub table_name: String,
    /// 未指定时使用DDL类型
    #[serde(default)]
    pub ddl_kind: Option<String>,
    #[serde(default)]
    pub visibility: DdlVisibility,
    #[serde(default)]
    pub extra_params: BTreeMap<String, serde_json::Value>,
}

impl CdcMarkTask {
    pub const TYPE: &'static str = "CdcMarkTask";

    pub fn event(&self, ctx: &TaskContext) -> CdcEvent {
        CdcEvent {
            schema_name: ctx.schema_name.clone(),
            table_name: self.table_name.clone(),
            ddl_kind: self
                .ddl_kind
                .clone()
                .unwrap_or_else(|| ctx.ddl_type.as_str().to_string()),
            ddl_stmt: ctx.ddl_stmt.clone(),
            ddl_type: ctx.ddl_type.as_str().to_string(),
            job_id: ctx.job_id,
            task_id: ctx.task_id,
            visibility: self.visibility,
            extra_params: self.extra_params.clone(),
            trace_id: ctx.trace_id.clone(),
            mark_time: Utc::now(),
        }
    }
}

#[async_trait]
impl DdlTask for CdcMarkTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn describe(&self) -> String {
        format!("CDC打标 {} ({})", self.table_name, self.visibility.as_str())
    }

    async fn execute(&self, ctx: &TaskContext, txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        let event = self.event(ctx);
        if ctx.engine.cdc.mark(txn, &event).await? {
            ctx.engine.metrics.record_cdc_mark();
        }
        Ok(())
    }

    async fn after_commit(&self, ctx: &TaskContext) -> DdlResult<()> {
        ctx.engine
            .cdc
            .deliver(ctx.engine.meta_store.as_ref(), ctx.job_id, ctx.task_id)
            .await?;
        Ok(())
    }

    /// 已发出的事件无法撤回
    async fn rollback(&self, ctx: &TaskContext, _txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        debug!(job_id = ctx.job_id, task_id = ctx.task_id, "CDC打标无需撤销");
        Ok(())
    }
}
