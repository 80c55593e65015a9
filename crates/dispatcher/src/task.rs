use async_trait::async_trait;
use ddl_domain::{DdlResult, MdlKey, MdlRequest, MetaTransaction};

use crate::context::TaskContext;

/// DDL任务中的一个步骤
///
/// 子任务按 `before_transaction` -> 获取元数据锁 -> `execute` -> 提交 -> `after_commit` 的顺序执行。
/// 崩溃后子任务可能被重新执行，实现必须保证重复执行是安全的空操作。
#[async_trait]
pub trait DdlTask: Send + Sync {
    /// 注册表中的类型标签
    fn task_type(&self) -> &'static str;

    fn describe(&self) -> String;

    /// 执行元数据变更前需要持有的锁，随元数据事务结束释放
    fn mdl_requests(&self, _ctx: &TaskContext, _trx_id: u64) -> Vec<MdlRequest> {
        Vec::new()
    }

    /// 子任务成功后由DDL任务持有、跨事务保留的锁，恢复时据此重新获取
    fn instance_locks(&self, _ctx: &TaskContext) -> Vec<MdlRequest> {
        Vec::new()
    }

    /// 整个DDL任务期间需要独占的对象，冲突的DDL任务在这些对象上按提交顺序串行执行
    fn ddl_objects(&self, ctx: &TaskContext) -> Vec<MdlKey> {
        self.instance_locks(ctx)
            .into_iter()
            .chain(self.mdl_requests(ctx, 0))
            .map(|request| request.key)
            .collect()
    }

    /// 元数据事务之外的物理变更
    async fn before_transaction(&self, _ctx: &TaskContext) -> DdlResult<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext, txn: &mut dyn MetaTransaction) -> DdlResult<()>;

    /// 元数据事务提交之后的通知，崩溃恢复后可能被重复调用
    async fn after_commit(&self, _ctx: &TaskContext) -> DdlResult<()> {
        Ok(())
    }

    async fn rollback(&self, ctx: &TaskContext, txn: &mut dyn MetaTransaction) -> DdlResult<()>;

    fn supports_rollback(&self) -> bool {
        true
    }
}
