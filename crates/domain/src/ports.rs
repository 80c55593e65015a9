//! 外部协作方的抽象接口

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ddl_errors::DdlResult;
use serde::{Deserialize, Serialize};

use crate::events::{CdcEvent, SyncAction};

/// 命名的租约锁，用于保证每个job_id同一时刻只有一个调度器驱动
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// 获取锁；同一持有者重复获取视为续约
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> DdlResult<bool>;
    async fn renew(&self, name: &str, owner: &str, ttl: Duration) -> DdlResult<bool>;
    async fn release(&self, name: &str, owner: &str) -> DdlResult<bool>;
}

/// 元数据存储
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn begin(&self) -> DdlResult<Box<dyn MetaTransaction>>;
    async fn get(&self, key: &str) -> DdlResult<Option<serde_json::Value>>;
    async fn keys_with_prefix(&self, prefix: &str) -> DdlResult<Vec<String>>;

    /// 在独立的事务中写入单个键并立即提交
    async fn put_committed(&self, key: &str, value: serde_json::Value) -> DdlResult<()> {
        let mut txn = self.begin().await?;
        txn.put(key, value).await?;
        txn.commit().await
    }
}

/// 元数据事务，提交前的写入对其他事务不可见
#[async_trait]
pub trait MetaTransaction: Send {
    /// 事务ID，TRANSACTION级别的元数据锁以此为单位释放
    fn trx_id(&self) -> u64;
    async fn get(&mut self, key: &str) -> DdlResult<Option<serde_json::Value>>;
    async fn put(&mut self, key: &str, value: serde_json::Value) -> DdlResult<()>;
    async fn delete(&mut self, key: &str) -> DdlResult<bool>;
    async fn commit(self: Box<Self>) -> DdlResult<()>;
    async fn rollback(self: Box<Self>) -> DdlResult<()>;
}

/// 计算节点上的表元数据缓存
#[async_trait]
pub trait SchemaCache: Send + Sync {
    async fn invalidate(&self, schema_name: &str, table_name: &str) -> DdlResult<()>;
    async fn reload(&self, schema_name: &str, table_name: &str) -> DdlResult<()>;
    /// 切换到新的元数据版本
    async fn to_new_version(&self, schema_name: &str, table_name: &str) -> DdlResult<()>;
    async fn invalidate_plan_cache(&self, schema_name: &str) -> DdlResult<()>;
}

#[async_trait]
pub trait CdcSink: Send + Sync {
    /// 以(job_id, task_id)去重，重复投递同一事件不产生新记录
    async fn notify(&self, event: &CdcEvent) -> DdlResult<()>;
}

/// 预先生成的物理语句
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalStatement {
    pub shard: String,
    pub sql: String,
}

impl PhysicalStatement {
    pub fn new(shard: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            shard: shard.into(),
            sql: sql.into(),
        }
    }
}

#[async_trait]
pub trait PhysicalExecutor: Send + Sync {
    async fn execute(&self, statement: &PhysicalStatement) -> DdlResult<()>;
}

#[async_trait]
pub trait SyncNode: Send + Sync {
    fn node_id(&self) -> &str;
    async fn apply(&self, action: &SyncAction) -> DdlResult<()>;
}

#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// 当前存活的节点，包括本节点
    async fn live_nodes(&self) -> DdlResult<Vec<Arc<dyn SyncNode>>>;
}
