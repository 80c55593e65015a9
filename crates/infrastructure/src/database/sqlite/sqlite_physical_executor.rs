use async_trait::async_trait;
use ddl_domain::{PhysicalExecutor, PhysicalStatement};
use ddl_errors::{DdlError, DdlResult};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

/// 单机模式下的物理执行器：所有分片都落在引擎自身的库上，shard 只作为日志标签
pub struct SqlitePhysicalExecutor {
    pool: SqlitePool,
}

impl SqlitePhysicalExecutor {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PhysicalExecutor for SqlitePhysicalExecutor {
    #[instrument(skip_all, fields(shard = %statement.shard))]
    async fn execute(&self, statement: &PhysicalStatement) -> DdlResult<()> {
        debug!(sql = %statement.sql, "执行物理语句");
        sqlx::query(&statement.sql)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                // 语法或对象冲突类错误重试无意义
                sqlx::Error::Database(db_error) => DdlError::task_fatal(format!(
                    "分片 {} 执行物理语句失败: {}",
                    statement.shard, db_error
                )),
                other => DdlError::task_execution(format!(
                    "分片 {} 执行物理语句失败: {}",
                    statement.shard, other
                )),
            })?;
        Ok(())
    }
}
