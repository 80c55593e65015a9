use std::collections::BTreeMap;

use async_trait::async_trait;
use ddl_domain::{CdcEvent, CdcSink, DdlVisibility};
use ddl_errors::{DdlError, DdlResult};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation};
use crate::job_context;

/// 把CDC打标记录写入 `ddl_cdc_records`，(job_id, task_id) 唯一约束保证重复投递被忽略
pub struct SqliteCdcSink {
    pool: SqlitePool,
}

impl SqliteCdcSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 按写入顺序返回某张表上的打标记录
    pub async fn records_for_table(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> DdlResult<Vec<CdcEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, task_id, schema_name, table_name, ddl_kind, ddl_type, ddl_stmt,
                   visibility, extra_params, trace_id, mark_time
            FROM ddl_cdc_records
            WHERE LOWER(schema_name) = LOWER(?) AND table_name = ?
            ORDER BY id
            "#,
        )
        .bind(schema_name)
        .bind(table_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::job_database_error(job_context!(RepositoryOperation::Query), e)
        })?;

        rows.iter()
            .map(|row| {
                let visibility: String = row.try_get("visibility")?;
                let extra_params: String = row.try_get("extra_params")?;
                let extra_params: BTreeMap<String, serde_json::Value> =
                    serde_json::from_str(&extra_params).map_err(|e| {
                        DdlError::Serialization(format!("解析extra_params失败: {e}"))
                    })?;
                Ok(CdcEvent {
                    schema_name: row.try_get("schema_name")?,
                    table_name: row.try_get("table_name")?,
                    ddl_kind: row.try_get("ddl_kind")?,
                    ddl_stmt: row.try_get("ddl_stmt")?,
                    ddl_type: row.try_get("ddl_type")?,
                    job_id: row.try_get("job_id")?,
                    task_id: row.try_get("task_id")?,
                    visibility: if visibility == DdlVisibility::Private.as_str() {
                        DdlVisibility::Private
                    } else {
                        DdlVisibility::Public
                    },
                    extra_params,
                    trace_id: row.try_get("trace_id")?,
                    mark_time: row.try_get("mark_time")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CdcSink for SqliteCdcSink {
    #[instrument(skip_all, fields(job_id = event.job_id, task_id = event.task_id))]
    async fn notify(&self, event: &CdcEvent) -> DdlResult<()> {
        let context = job_context!(
            RepositoryOperation::Create,
            job_id = event.job_id,
            task_id = event.task_id
        );
        let extra_params = serde_json::to_string(&event.extra_params)
            .map_err(|e| RepositoryErrorHelpers::serialization_error(context.clone(), e))?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO ddl_cdc_records
                (job_id, task_id, schema_name, table_name, ddl_kind, ddl_type, ddl_stmt,
                 visibility, extra_params, trace_id, mark_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.job_id)
        .bind(event.task_id)
        .bind(&event.schema_name)
        .bind(&event.table_name)
        .bind(&event.ddl_kind)
        .bind(&event.ddl_type)
        .bind(&event.ddl_stmt)
        .bind(event.visibility.as_str())
        .bind(extra_params)
        .bind(&event.trace_id)
        .bind(event.mark_time)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::job_database_error(context, e))?;

        if result.rows_affected() == 0 {
            debug!("CDC打标记录已存在，忽略重复投递");
        }
        Ok(())
    }
}
