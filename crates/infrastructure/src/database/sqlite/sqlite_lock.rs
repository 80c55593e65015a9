use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ddl_domain::DistributedLock;
use ddl_errors::{DdlError, DdlResult};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation};
use crate::job_context;

/// 基于 `ddl_locks` 表的租约锁，过期的租约可以被其他持有者抢占
pub struct SqliteDistributedLock {
    pool: SqlitePool,
}

impl SqliteDistributedLock {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn expires_at(ttl: Duration) -> DdlResult<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| DdlError::validation_error(format!("无效的租约时长: {e}")))?;
        Ok(Utc::now() + ttl)
    }
}

#[async_trait]
impl DistributedLock for SqliteDistributedLock {
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> DdlResult<bool> {
        let expires_at = Self::expires_at(ttl)?;
        let result = sqlx::query(
            r#"
            INSERT INTO ddl_locks (name, owner, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
            WHERE ddl_locks.owner = excluded.owner OR ddl_locks.expires_at < ?
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::job_database_error(
                job_context!(RepositoryOperation::Update)
                    .with_additional_info(format!("获取租约锁 {name}")),
                e,
            )
        })?;

        let acquired = result.rows_affected() > 0;
        debug!(lock = %name, owner = %owner, acquired, "尝试获取租约锁");
        Ok(acquired)
    }

    async fn renew(&self, name: &str, owner: &str, ttl: Duration) -> DdlResult<bool> {
        let expires_at = Self::expires_at(ttl)?;
        let result =
            sqlx::query("UPDATE ddl_locks SET expires_at = ? WHERE name = ? AND owner = ?")
                .bind(expires_at)
                .bind(name)
                .bind(owner)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    RepositoryErrorHelpers::job_database_error(
                        job_context!(RepositoryOperation::Update)
                            .with_additional_info(format!("续约租约锁 {name}")),
                        e,
                    )
                })?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, name: &str, owner: &str) -> DdlResult<bool> {
        let result = sqlx::query("DELETE FROM ddl_locks WHERE name = ? AND owner = ?")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                RepositoryErrorHelpers::job_database_error(
                    job_context!(RepositoryOperation::Delete)
                        .with_additional_info(format!("释放租约锁 {name}")),
                    e,
                )
            })?;
        Ok(result.rows_affected() > 0)
    }
}
