use async_trait::async_trait;
use ddl_domain::{DdlError, DdlResult, MetaTransaction};
use serde::{Deserialize, Serialize};

use super::table_meta_key;
use crate::context::TaskContext;
use crate::task::DdlTask;

/// 校验表是否存在，结果与预期不符时任务失败且不重试
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateTableTask {
    pub table_name: String,
    pub should_exist: bool,
}

impl ValidateTableTask {
    pub const TYPE: &'static str = "ValidateTableTask";
}

#[async_trait]
impl DdlTask for ValidateTableTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn describe(&self) -> String {
        if self.should_exist {
            format!("校验表 {} 存在", self.table_name)
        } else {
            format!("校验表 {} 不存在", self.table_name)
        }
    }

    async fn execute(&self, ctx: &TaskContext, txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        let key = table_meta_key(&ctx.schema_name, &self.table_name);
        let exists = txn.get(&key).await?.is_some();
        match (exists, self.should_exist) {
            (true, false) => Err(DdlError::validation_error(format!(
                "表 {}.{} 已存在",
                ctx.schema_name, self.table_name
            ))),
            (false, true) => Err(DdlError::validation_error(format!(
                "表 {}.{} 不存在",
                ctx.schema_name, self.table_name
            ))),
            _ => Ok(()),
        }
    }

    async fn rollback(&self, _ctx: &TaskContext, _txn: &mut dyn MetaTransaction) -> DdlResult<()> {
        Ok(())
    }
}
