use std::str::FromStr;
use std::time::Duration;

use ddl_core::DatabaseConfig;
use ddl_errors::DdlResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqlitePool};
use tracing::debug;

use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation};
use crate::job_context;

pub type DbPool = Pool<Sqlite>;

/// SQLite连接池与建表迁移
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> DdlResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        // 内存数据库的每个连接都是独立的库，只能使用单连接
        let in_memory = config.url.contains(":memory:");
        let (max_connections, min_connections) = if in_memory {
            (1, 1)
        } else {
            (config.max_connections, config.min_connections)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(connect_options)
            .await?;

        let manager = Self { pool };
        manager.migrate().await?;
        Ok(manager)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> DdlResult<()> {
        debug!("运行SQLite数据库迁移");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS ddl_jobs (
                job_id INTEGER PRIMARY KEY AUTOINCREMENT,
                schema_name TEXT NOT NULL,
                ddl_type TEXT NOT NULL,
                ddl_stmt TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'QUEUED',
                trace_id TEXT NOT NULL,
                error_message TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                create_time DATETIME NOT NULL,
                update_time DATETIME NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ddl_tasks (
                job_id INTEGER NOT NULL,
                task_id INTEGER NOT NULL,
                task_type TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'READY',
                params TEXT NOT NULL DEFAULT '{}',
                predecessor_ids TEXT NOT NULL DEFAULT '[]',
                remark TEXT,
                transaction_group TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                update_time DATETIME NOT NULL,
                PRIMARY KEY (job_id, task_id),
                FOREIGN KEY (job_id) REFERENCES ddl_jobs(job_id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ddl_locks (
                name TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at DATETIME NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ddl_cdc_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL,
                task_id INTEGER NOT NULL,
                schema_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                ddl_kind TEXT NOT NULL,
                ddl_type TEXT NOT NULL,
                ddl_stmt TEXT NOT NULL,
                visibility TEXT NOT NULL,
                extra_params TEXT NOT NULL DEFAULT '{}',
                trace_id TEXT NOT NULL,
                mark_time DATETIME NOT NULL,
                UNIQUE (job_id, task_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ddl_meta (
                meta_key TEXT PRIMARY KEY,
                meta_value TEXT NOT NULL,
                update_time DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_ddl_jobs_state ON ddl_jobs(state)",
            "CREATE INDEX IF NOT EXISTS idx_ddl_jobs_schema ON ddl_jobs(schema_name)",
            "CREATE INDEX IF NOT EXISTS idx_ddl_cdc_records_schema ON ddl_cdc_records(schema_name, table_name)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(|e| {
                RepositoryErrorHelpers::job_database_error(
                    job_context!(RepositoryOperation::Migrate),
                    e,
                )
            })?;
        }

        debug!("SQLite数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> DdlResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
