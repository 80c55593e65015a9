use async_trait::async_trait;
use ddl_domain::{DdlError, DdlResult, MdlRequest, MetaTransaction};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{table_meta_key, undo_key};
use crate::context::TaskContext;
use crate::task::DdlTask;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetaAction {
    Register,
    Unregister,
    Rename { new_name: String },
    BumpVersion,
}

/// 元数据变更前各个键的值，回滚时按原样恢复
#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaUndo {
    entries: Vec<(String, Option<Value>)>,
}

/// 在元数据事务中修改表的元数据，执行期间持有表上的排他锁
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTableMetaTask {
    pub table_name: String,
    pub action: MetaAction,
}

impl UpdateTableMetaTask {
    pub const TYPE: &'static str = "UpdateTableMetaTask";

    fn version_of(value: &Value) -> u64 {
        value.get("version").and_then(Value::as_u64).unwrap_or(0)
    }

    fn missing(ctx: &TaskContext, table_name: &str) -> DdlError {
        DdlError::task_fatal(format!("表 {}.{} 的元数据不存在", ctx.schema_name, table_name))
    }
}

#[async_trait]
impl DdlTask for UpdateTableMetaTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn describe(&self) -> String {
        match &self.action {
            MetaAction::Register => format!("注册表 {} 的元数据", self.table_name),
            MetaAction::Unregister => format!("删除表 {} 的元数据", self.table_name),
            MetaAction::Rename { new_name } => {
                format!("将表 {} 的元数据重命名为 {}", self.table_name, new_name)
            }
            MetaAction::BumpVersion => format!("升级表 {} 的元数据版本", self.table_name),
        }
    }

    fn mdl_requests(&self, ctx: &TaskContext, trx_id: u64) -> Vec<MdlRequest> {
        let mut requests = vec![MdlRequest::exclusive(
            trx_id,
            &ctx.schema_name,
            &self.table_name,
        )];
        if let MetaAction::Rename { new_name } = &self.action {
            requests.push(MdlRequest::exclusive(trx_id, &ctx.schema_name, new_name));
        }
        requests
    }

    async fn execute(&self, ctx: &TaskContext, txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        let undo = undo_key(ctx.job_id, ctx.task_id);
        if txn.get(&undo).await?.is_some() {
            debug!(job_id = ctx.job_id, task_id = ctx.task_id, "元数据变更已提交，跳过");
            return Ok(());
        }

        let key = table_meta_key(&ctx.schema_name, &self.table_name);
        let current = txn.get(&key).await?;
        let mut record = MetaUndo::default();
        record.entries.push((key.clone(), current.clone()));

        match &self.action {
            MetaAction::Register => {
                if current.is_some() {
                    return Err(DdlError::task_fatal(format!(
                        "表 {}.{} 的元数据已存在",
                        ctx.schema_name, self.table_name
                    )));
                }
                txn.put(&key, json!({"table_name": self.table_name, "version": 1}))
                    .await?;
            }
            MetaAction::Unregister => {
                if current.is_none() {
                    return Err(Self::missing(ctx, &self.table_name));
                }
                txn.delete(&key).await?;
            }
            MetaAction::Rename { new_name } => {
                let current = current.ok_or_else(|| Self::missing(ctx, &self.table_name))?;
                let new_key = table_meta_key(&ctx.schema_name, new_name);
                let existing = txn.get(&new_key).await?;
                if existing.is_some() {
                    return Err(DdlError::task_fatal(format!(
                        "表 {}.{} 已存在",
                        ctx.schema_name, new_name
                    )));
                }
                record.entries.push((new_key.clone(), None));
                txn.delete(&key).await?;
                txn.put(
                    &new_key,
                    json!({"table_name": new_name, "version": Self::version_of(&current) + 1}),
                )
                .await?;
            }
            MetaAction::BumpVersion => {
                let current = current.ok_or_else(|| Self::missing(ctx, &self.table_name))?;
                let mut next = current.clone();
                next["version"] = json!(Self::version_of(&current) + 1);
                txn.put(&key, next).await?;
            }
        }

        txn.put(&undo, serde_json::to_value(&record)?).await?;
        info!(
            job_id = ctx.job_id,
            task_id = ctx.task_id,
            "{}",
            self.describe()
        );
        Ok(())
    }

    async fn rollback(&self, ctx: &TaskContext, txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        let undo = undo_key(ctx.job_id, ctx.task_id);
        let Some(value) = txn.get(&undo).await? else {
            debug!(job_id = ctx.job_id, task_id = ctx.task_id, "元数据未修改，无需撤销");
            return Ok(());
        };

        let record: MetaUndo = serde_json::from_value(value)?;
        for (key, prior) in record.entries {
            match prior {
                Some(prior) => txn.put(&key, prior).await?,
                None => {
                    txn.delete(&key).await?;
                }
            }
        }
        txn.delete(&undo).await?;
        Ok(())
    }
}
