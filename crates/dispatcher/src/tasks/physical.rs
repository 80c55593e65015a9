//! 在各分片上执行预先生成的物理语句
//!
//! 物理语句在元数据事务之外执行。每条语句成功后立即提交 `applied:{job}:{task}:{n}` 标记，
//! 事务内再写入整个子任务的 `applied:{job}:{task}` 标记。重新执行时跳过已标记的语句，
//! 因此元数据事务提交前崩溃也不会重复执行物理变更。

use async_trait::async_trait;
use ddl_domain::{
    applied_marker_key, applied_statement_key, DdlError, DdlResult, MetaTransaction,
    PhysicalStatement,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::context::TaskContext;
use crate::task::DdlTask;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhysicalStatements {
    pub table_name: String,
    #[serde(default)]
    pub statements: Vec<PhysicalStatement>,
    #[serde(default)]
    pub rollback_statements: Vec<PhysicalStatement>,
}

impl PhysicalStatements {
    async fn apply(&self, ctx: &TaskContext) -> DdlResult<()> {
        let marker = applied_marker_key(ctx.job_id, ctx.task_id);
        if ctx.engine.meta_store.get(&marker).await?.is_some() {
            debug!(
                job_id = ctx.job_id,
                task_id = ctx.task_id,
                "物理变更已执行，跳过 {} 条语句",
                self.statements.len()
            );
            return Ok(());
        }

        let store = ctx.engine.meta_store.as_ref();
        let mut executed = 0;
        for (index, statement) in self.statements.iter().enumerate() {
            let key = applied_statement_key(ctx.job_id, ctx.task_id, index);
            if store.get(&key).await?.is_some() {
                debug!(
                    job_id = ctx.job_id,
                    task_id = ctx.task_id,
                    "语句已执行，跳过: {}",
                    statement.sql
                );
                continue;
            }
            ctx.engine.physical.execute(statement).await?;
            store
                .put_committed(&key, json!({ "shard": statement.shard }))
                .await?;
            executed += 1;
        }
        info!(
            job_id = ctx.job_id,
            task_id = ctx.task_id,
            table = %self.table_name,
            "已在 {} 个分片上执行物理语句，跳过 {} 条已执行的语句",
            executed,
            self.statements.len() - executed
        );
        Ok(())
    }

    async fn mark_applied(
        &self,
        ctx: &TaskContext,
        txn: &mut dyn MetaTransaction,
    ) -> DdlResult<()> {
        txn.put(
            &applied_marker_key(ctx.job_id, ctx.task_id),
            json!({ "statements": self.statements.len() }),
        )
        .await
    }

    /// 撤销语句需要能重复执行，例如 `DROP TABLE IF EXISTS`
    async fn undo(&self, ctx: &TaskContext, txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        for statement in &self.rollback_statements {
            ctx.engine
                .physical
                .execute(statement)
                .await
                .map_err(|e| DdlError::RollbackFailed(format!("{}: {e}", statement.sql)))?;
        }
        for index in 0..self.statements.len() {
            txn.delete(&applied_statement_key(ctx.job_id, ctx.task_id, index))
                .await?;
        }
        txn.delete(&applied_marker_key(ctx.job_id, ctx.task_id))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePhysicalTablesTask {
    #[serde(flatten)]
    pub physical: PhysicalStatements,
}

impl CreatePhysicalTablesTask {
    pub const TYPE: &'static str = "CreatePhysicalTablesTask";
}

#[async_trait]
impl DdlTask for CreatePhysicalTablesTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn describe(&self) -> String {
        format!("创建表 {} 的物理表", self.physical.table_name)
    }

    async fn before_transaction(&self, ctx: &TaskContext) -> DdlResult<()> {
        self.physical.apply(ctx).await
    }

    async fn execute(&self, ctx: &TaskContext, txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        self.physical.mark_applied(ctx, txn).await
    }

    async fn rollback(&self, ctx: &TaskContext, txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        self.physical.undo(ctx, txn).await
    }
}

/// 没有撤销语句的变更（例如TRUNCATE）不支持回滚
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlterPhysicalTablesTask {
    #[serde(flatten)]
    pub physical: PhysicalStatements,
}

impl AlterPhysicalTablesTask {
    pub const TYPE: &'static str = "AlterPhysicalTablesTask";
}

#[async_trait]
impl DdlTask for AlterPhysicalTablesTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn describe(&self) -> String {
        format!("修改表 {} 的物理表", self.physical.table_name)
    }

    async fn before_transaction(&self, ctx: &TaskContext) -> DdlResult<()> {
        self.physical.apply(ctx).await
    }

    async fn execute(&self, ctx: &TaskContext, txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        self.physical.mark_applied(ctx, txn).await
    }

    async fn rollback(&self, ctx: &TaskContext, txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        self.physical.undo(ctx, txn).await
    }

    fn supports_rollback(&self) -> bool {
        !self.physical.rollback_statements.is_empty()
    }
}

/// 删除物理表，数据无法恢复，回滚在此中止
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropPhysicalTablesTask {
    #[serde(flatten)]
    pub physical: PhysicalStatements,
}

impl DropPhysicalTablesTask {
    pub const TYPE: &'static str = "DropPhysicalTablesTask";
}

#[async_trait]
impl DdlTask for DropPhysicalTablesTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn describe(&self) -> String {
        format!("删除表 {} 的物理表", self.physical.table_name)
    }

    async fn before_transaction(&self, ctx: &TaskContext) -> DdlResult<()> {
        self.physical.apply(ctx).await
    }

    async fn execute(&self, ctx: &TaskContext, txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        self.physical.mark_applied(ctx, txn).await
    }

    async fn rollback(&self, _ctx: &TaskContext, _txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        Err(DdlError::RollbackUnsupported(format!(
            "表 {} 的物理表已删除",
            self.physical.table_name
        )))
    }

    fn supports_rollback(&self) -> bool {
        false
    }
}
