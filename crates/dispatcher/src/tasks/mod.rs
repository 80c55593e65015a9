//! 内置子任务

mod cdc;
mod meta;
mod mdl;
mod physical;
mod sync;
mod validate;

use async_trait::async_trait;
use ddl_domain::{DdlResult, MdlKey, PhysicalExecutor, PhysicalStatement};
use tracing::debug;

pub use cdc::CdcMarkTask;
pub use mdl::AcquireMdlTask;
pub use meta::{MetaAction, UpdateTableMetaTask};
pub use physical::{
    AlterPhysicalTablesTask, CreatePhysicalTablesTask, DropPhysicalTablesTask, PhysicalStatements,
};
pub use sync::SyncSchemaTask;
pub use validate::ValidateTableTask;

/// 表元数据在元数据存储中的键
pub fn table_meta_key(schema_name: &str, table_name: &str) -> String {
    format!("table:{}", MdlKey::new(schema_name, table_name))
}

/// 元数据变更的撤销记录
pub fn undo_key(job_id: i64, task_id: i64) -> String {
    format!("undo:{job_id}:{task_id}")
}

/// 不连接任何分片，只记录日志
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPhysicalExecutor;

#[async_trait]
impl PhysicalExecutor for NoopPhysicalExecutor {
    async fn execute(&self, statement: &PhysicalStatement) -> DdlResult<()> {
        debug!("跳过物理语句 [{}]: {}", statement.shard, statement.sql);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use ddl_domain::{DdlType, MetaStore, TaskRecord, TaskState};
    use ddl_infrastructure::MdlContext;

    use crate::context::{EngineContext, JobScope, TaskContext};

    pub fn context(engine: &EngineContext, task_id: i64, task_type: &str) -> TaskContext {
        let scope = JobScope {
            job_id: 1,
            schema_name: "db1".to_string(),
            ddl_type: DdlType::CreateTable,
            ddl_stmt: "CREATE TABLE t1 (id INT)".to_string(),
            trace_id: "trace-1".to_string(),
            job_mdl: Arc::new(MdlContext::new(
                engine.mdl.clone(),
                EngineContext::job_mdl_owner(1),
            )),
        };
        let record = TaskRecord {
            task_id,
            job_id: 1,
            task_type: task_type.to_string(),
            state: TaskState::Running,
            params: serde_json::Value::Null,
            predecessor_ids: Vec::new(),
            remark: None,
            transaction_group: None,
            retry_count: 0,
            error_message: None,
            update_time: chrono::Utc::now(),
        };
        scope.task_context(engine, &record)
    }

    pub async fn committed(
        engine: &EngineContext,
        key: &str,
    ) -> Option<serde_json::Value> {
        engine.meta_store.get(key).await.ok().flatten()
    }
}
