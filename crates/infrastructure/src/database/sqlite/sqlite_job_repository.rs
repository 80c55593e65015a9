use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ddl_domain::job_query_builder::{JobQueryBuilder, JobQueryParam, JOB_COLUMNS};
use ddl_domain::{
    DdlType, ExecutableJob, Job, JobFilter, JobRepository, JobState, TaskRecord, TaskState,
};
use ddl_errors::{DdlError, DdlResult};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;
use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation};
use crate::job_context;

const TASK_COLUMNS: &str = "job_id, task_id, task_type, state, params, predecessor_ids, remark, transaction_group, retry_count, error_message, update_time";

/// 基于SQLite的DDL任务存储，表结构由 `DatabaseManager::migrate` 创建
pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &SqliteRow, tasks: Vec<TaskRecord>) -> DdlResult<Job> {
        let cancel_requested: i64 = row.try_get("cancel_requested")?;
        Ok(Job {
            job_id: row.try_get("job_id")?,
            schema_name: row.try_get("schema_name")?,
            ddl_type: row.try_get::<DdlType, _>("ddl_type")?,
            ddl_stmt: row.try_get("ddl_stmt")?,
            state: row.try_get::<JobState, _>("state")?,
            tasks,
            create_time: row.try_get("create_time")?,
            update_time: row.try_get("update_time")?,
            trace_id: row.try_get("trace_id")?,
            error_message: row.try_get("error_message")?,
            cancel_requested: cancel_requested != 0,
        })
    }

    async fn load_tasks(&self, job_id: i64) -> DdlResult<Vec<TaskRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM ddl_tasks WHERE job_id = ? ORDER BY task_id"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::job_database_error(
                job_context!(RepositoryOperation::Read, job_id = job_id),
                e,
            )
        })?;

        rows.iter().map(MappingHelpers::row_to_task).collect()
    }

    async fn rows_to_jobs(&self, rows: Vec<SqliteRow>) -> DdlResult<Vec<Job>> {
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let job_id: i64 = row.try_get("job_id")?;
            let tasks = self.load_tasks(job_id).await?;
            jobs.push(Self::row_to_job(&row, tasks)?);
        }
        Ok(jobs)
    }

    async fn write_task(tx: &mut Transaction<'static, Sqlite>, task: &TaskRecord) -> DdlResult<()> {
        let context = job_context!(
            RepositoryOperation::Update,
            job_id = task.job_id,
            task_id = task.task_id
        );
        let params_json = serde_json::to_string(&task.params)
            .map_err(|e| RepositoryErrorHelpers::serialization_error(context.clone(), e))?;

        let result = sqlx::query(
            r#"
            UPDATE ddl_tasks
            SET state = ?, params = ?, remark = ?, retry_count = ?, error_message = ?, update_time = ?
            WHERE job_id = ? AND task_id = ?
            "#,
        )
        .bind(task.state)
        .bind(params_json)
        .bind(&task.remark)
        .bind(i64::from(task.retry_count))
        .bind(&task.error_message)
        .bind(task.update_time)
        .bind(task.job_id)
        .bind(task.task_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| RepositoryErrorHelpers::job_database_error(context.clone(), e))?;

        if result.rows_affected() == 0 {
            return Err(DdlError::task_not_found(task.job_id, task.task_id));
        }

        sqlx::query("UPDATE ddl_jobs SET update_time = ? WHERE job_id = ?")
            .bind(Utc::now())
            .bind(task.job_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| RepositoryErrorHelpers::job_database_error(context, e))?;
        Ok(())
    }

    async fn begin(&self, context_job_id: Option<i64>) -> DdlResult<Transaction<'static, Sqlite>> {
        self.pool.begin().await.map_err(|e| {
            let context = match context_job_id {
                Some(job_id) => job_context!(RepositoryOperation::BatchUpdate, job_id = job_id),
                None => job_context!(RepositoryOperation::Create),
            };
            RepositoryErrorHelpers::job_database_error(context, e)
        })
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    #[instrument(skip(self, job), fields(
        schema_name = %job.schema_name(),
        ddl_type = %job.ddl_type(),
        task_count = job.tasks().len(),
    ))]
    async fn create_job(&self, job: &ExecutableJob) -> DdlResult<Job> {
        let context = job_context!(RepositoryOperation::Create);
        let now = Utc::now();
        let mut tx = self.begin(None).await?;

        let job_id = sqlx::query(
            r#"
            INSERT INTO ddl_jobs (schema_name, ddl_type, ddl_stmt, state, trace_id, cancel_requested, create_time, update_time)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(job.schema_name())
        .bind(job.ddl_type())
        .bind(job.ddl_stmt())
        .bind(JobState::Queued)
        .bind(job.trace_id())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryErrorHelpers::job_database_error(context.clone(), e))?
        .last_insert_rowid();

        for planned in job.tasks() {
            let task_context = job_context!(
                RepositoryOperation::Create,
                job_id = job_id,
                task_id = planned.task_id
            );
            let params_json = serde_json::to_string(&planned.params).map_err(|e| {
                RepositoryErrorHelpers::serialization_error(task_context.clone(), e)
            })?;
            let preds_json = serde_json::to_string(&planned.predecessor_ids).map_err(|e| {
                RepositoryErrorHelpers::serialization_error(task_context.clone(), e)
            })?;

            sqlx::query(
                r#"
                INSERT INTO ddl_tasks (job_id, task_id, task_type, state, params, predecessor_ids, remark, transaction_group, retry_count, update_time)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
                "#,
            )
            .bind(job_id)
            .bind(planned.task_id)
            .bind(&planned.task_type)
            .bind(TaskState::Ready)
            .bind(params_json)
            .bind(preds_json)
            .bind(&planned.remark)
            .bind(&planned.transaction_group)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryErrorHelpers::job_database_error(task_context, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryErrorHelpers::job_database_error(context, e))?;

        let created = job.to_queued_job(job_id, now);
        debug!("DDL任务已持久化: job {}, {} 个子任务", job_id, created.tasks.len());
        Ok(created)
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn get_job(&self, job_id: i64) -> DdlResult<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM ddl_jobs WHERE job_id = ?"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::job_database_error(
                job_context!(RepositoryOperation::Read, job_id = job_id),
                e,
            )
        })?;

        match row {
            Some(row) => {
                let tasks = self.load_tasks(job_id).await?;
                Ok(Some(Self::row_to_job(&row, tasks)?))
            }
            None => {
                debug!("DDL任务不存在: {}", job_id);
                Ok(None)
            }
        }
    }

    async fn list_unfinished_jobs(&self) -> DdlResult<Vec<Job>> {
        let rows = sqlx::query(&JobQueryBuilder::build_unfinished_query())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                RepositoryErrorHelpers::job_database_error(
                    job_context!(RepositoryOperation::Query),
                    e,
                )
            })?;
        self.rows_to_jobs(rows).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> DdlResult<Vec<Job>> {
        let (sql, params) = JobQueryBuilder::build_select_query(filter);
        let mut query = sqlx::query(&sql);
        for param in params {
            query = match param {
                JobQueryParam::String(s) => query.bind(s),
                JobQueryParam::State(state) => query.bind(state),
                JobQueryParam::DdlType(ddl_type) => query.bind(ddl_type),
                JobQueryParam::Int64(i) => query.bind(i),
            };
        }

        let rows = query.fetch_all(&self.pool).await.map_err(|e| {
            RepositoryErrorHelpers::job_database_error(job_context!(RepositoryOperation::Query), e)
        })?;
        self.rows_to_jobs(rows).await
    }

    #[instrument(skip(self, error_message), fields(job_id = %job_id, state = %state))]
    async fn update_job_state(
        &self,
        job_id: i64,
        state: JobState,
        error_message: Option<&str>,
    ) -> DdlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE ddl_jobs
            SET state = ?, error_message = COALESCE(?, error_message), update_time = ?
            WHERE job_id = ?
            "#,
        )
        .bind(state)
        .bind(error_message)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::job_database_error(
                job_context!(RepositoryOperation::Update, job_id = job_id),
                e,
            )
        })?;

        if result.rows_affected() == 0 {
            return Err(DdlError::job_not_found(job_id));
        }
        Ok(())
    }

    async fn update_task(&self, task: &TaskRecord) -> DdlResult<()> {
        self.update_tasks(std::slice::from_ref(task)).await
    }

    async fn update_tasks(&self, tasks: &[TaskRecord]) -> DdlResult<()> {
        let Some(first) = tasks.first() else {
            return Ok(());
        };
        let mut tx = self.begin(Some(first.job_id)).await?;
        for task in tasks {
            Self::write_task(&mut tx, task).await?;
        }
        tx.commit().await.map_err(|e| {
            RepositoryErrorHelpers::job_database_error(
                job_context!(RepositoryOperation::BatchUpdate, job_id = first.job_id),
                e,
            )
        })?;
        Ok(())
    }

    async fn request_cancel(&self, job_id: i64) -> DdlResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ddl_jobs SET cancel_requested = 1, update_time = ?
            WHERE job_id = ? AND state NOT IN ('SUCCESS', 'ROLLBACK_SUCCESS', 'ROLLBACK_FAILED')
            "#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::job_database_error(
                job_context!(RepositoryOperation::Update, job_id = job_id),
                e,
            )
        })?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get_job(job_id).await? {
            Some(_) => Ok(false),
            None => Err(DdlError::job_not_found(job_id)),
        }
    }

    async fn purge_terminal_jobs(&self, before: DateTime<Utc>) -> DdlResult<u64> {
        let context = job_context!(RepositoryOperation::Delete);
        let mut tx = self.begin(None).await?;

        sqlx::query(
            r#"
            DELETE FROM ddl_tasks WHERE job_id IN (
                SELECT job_id FROM ddl_jobs
                WHERE state IN ('SUCCESS', 'ROLLBACK_SUCCESS', 'ROLLBACK_FAILED') AND update_time < ?
            )
            "#,
        )
        .bind(before)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryErrorHelpers::job_database_error(context.clone(), e))?;

        let result = sqlx::query(
            r#"
            DELETE FROM ddl_jobs
            WHERE state IN ('SUCCESS', 'ROLLBACK_SUCCESS', 'ROLLBACK_FAILED') AND update_time < ?
            "#,
        )
        .bind(before)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryErrorHelpers::job_database_error(context.clone(), e))?;

        tx.commit()
            .await
            .map_err(|e| RepositoryErrorHelpers::job_database_error(context, e))?;
        Ok(result.rows_affected())
    }
}
