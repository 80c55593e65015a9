use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ddl_domain::{MetaStore, MetaTransaction};
use ddl_errors::{DdlError, DdlResult};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation};
use crate::job_context;

/// 基于 `ddl_meta` 表的元数据存储
///
/// 事务内的写入先暂存在内存中，提交时在一个数据库事务里整体落盘，
/// 因此事务存续期间不占用连接，也不会阻塞物理执行器对同一个库的写入。
pub struct SqliteMetaStore {
    pool: SqlitePool,
    next_trx_id: Arc<AtomicU64>,
}

impl SqliteMetaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            next_trx_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn read(pool: &SqlitePool, key: &str) -> DdlResult<Option<Value>> {
        let row = sqlx::query("SELECT meta_value FROM ddl_meta WHERE meta_key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await
            .map_err(|e| {
                RepositoryErrorHelpers::job_database_error(
                    job_context!(RepositoryOperation::Read)
                        .with_additional_info(format!("读取元数据 {key}")),
                    e,
                )
            })?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("meta_value")?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| DdlError::Serialization(format!("解析元数据{key}失败: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MetaStore for SqliteMetaStore {
    async fn begin(&self) -> DdlResult<Box<dyn MetaTransaction>> {
        let trx_id = self.next_trx_id.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SqliteMetaTransaction {
            pool: self.pool.clone(),
            trx_id,
            staged: HashMap::new(),
        }))
    }

    async fn get(&self, key: &str) -> DdlResult<Option<Value>> {
        Self::read(&self.pool, key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> DdlResult<Vec<String>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query(
            "SELECT meta_key FROM ddl_meta WHERE meta_key LIKE ? ESCAPE '\\' ORDER BY meta_key",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::job_database_error(job_context!(RepositoryOperation::Query), e)
        })?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("meta_key").map_err(DdlError::from))
            .collect()
    }
}

pub struct SqliteMetaTransaction {
    pool: SqlitePool,
    trx_id: u64,
    /// None 表示删除
    staged: HashMap<String, Option<Value>>,
}

#[async_trait]
impl MetaTransaction for SqliteMetaTransaction {
    fn trx_id(&self) -> u64 {
        self.trx_id
    }

    async fn get(&mut self, key: &str) -> DdlResult<Option<Value>> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        SqliteMetaStore::read(&self.pool, key).await
    }

    async fn put(&mut self, key: &str, value: Value) -> DdlResult<()> {
        self.staged.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> DdlResult<bool> {
        let existed = self.get(key).await?.is_some();
        self.staged.insert(key.to_string(), None);
        Ok(existed)
    }

    async fn commit(self: Box<Self>) -> DdlResult<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let context = job_context!(RepositoryOperation::BatchUpdate)
            .with_additional_info(format!("提交元数据事务 {}", self.trx_id));
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepositoryErrorHelpers::job_database_error(context.clone(), e))?;

        let now = Utc::now();
        for (key, value) in &self.staged {
            match value {
                Some(value) => {
                    let raw = serde_json::to_string(value).map_err(|e| {
                        RepositoryErrorHelpers::serialization_error(context.clone(), e)
                    })?;
                    sqlx::query(
                        r#"
                        INSERT INTO ddl_meta (meta_key, meta_value, update_time) VALUES (?, ?, ?)
                        ON CONFLICT(meta_key) DO UPDATE SET meta_value = excluded.meta_value, update_time = excluded.update_time
                        "#,
                    )
                    .bind(key)
                    .bind(raw)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| RepositoryErrorHelpers::job_database_error(context.clone(), e))?;
                }
                None => {
                    sqlx::query("DELETE FROM ddl_meta WHERE meta_key = ?")
                        .bind(key)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| {
                            RepositoryErrorHelpers::job_database_error(context.clone(), e)
                        })?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryErrorHelpers::job_database_error(context, e))?;
        debug!(trx_id = self.trx_id, writes = self.staged.len(), "元数据事务已提交");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DdlResult<()> {
        debug!(trx_id = self.trx_id, discarded = self.staged.len(), "元数据事务已回滚");
        Ok(())
    }
}
