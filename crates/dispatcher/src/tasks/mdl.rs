use async_trait::async_trait;
use ddl_domain::{DdlResult, MdlDuration, MdlKey, MdlRequest, MetaTransaction};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::TaskContext;
use crate::task::DdlTask;

/// DDL任务期间持有表上的共享INSTANCE锁，任务结束或回滚时释放
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireMdlTask {
    pub table_name: String,
}

impl AcquireMdlTask {
    pub const TYPE: &'static str = "AcquireMdlTask";

    fn request(&self, ctx: &TaskContext) -> MdlRequest {
        MdlRequest::shared(0, &ctx.schema_name, &self.table_name)
            .with_duration(MdlDuration::Instance)
    }
}

#[async_trait]
impl DdlTask for AcquireMdlTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn describe(&self) -> String {
        format!("获取表 {} 的元数据锁", self.table_name)
    }

    fn instance_locks(&self, ctx: &TaskContext) -> Vec<MdlRequest> {
        vec![self.request(ctx)]
    }

    async fn execute(&self, ctx: &TaskContext, _txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        let ticket = ctx
            .job_mdl
            .acquire(&self.request(ctx), ctx.engine.lock_timeout())
            .await?;
        debug!(
            job_id = ctx.job_id,
            task_id = ctx.task_id,
            "已持有元数据锁 {} (ticket {})",
            ticket.key,
            ticket.ticket_id
        );
        Ok(())
    }

    async fn rollback(&self, ctx: &TaskContext, _txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        let key = MdlKey::new(&ctx.schema_name, &self.table_name);
        let released = ctx.job_mdl.release_instance_locks(&key);
        debug!(job_id = ctx.job_id, "释放表 {} 的 {} 个元数据锁", key, released);
        Ok(())
    }
}
