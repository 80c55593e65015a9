//! SQLite行到领域对象的映射

use ddl_domain::{TaskRecord, TaskState};
use ddl_errors::{DdlError, DdlResult};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn parse_id_list_sqlite(row: &SqliteRow, field_name: &str) -> DdlResult<Vec<i64>> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| DdlError::Serialization(format!("解析{field_name}失败: {e}")))
    }

    pub fn parse_json_sqlite(row: &SqliteRow, field_name: &str) -> DdlResult<serde_json::Value> {
        let json_str: String = row.try_get(field_name)?;
        json_str
            .parse()
            .map_err(|e| DdlError::Serialization(format!("解析{field_name}失败: {e}")))
    }

    pub fn row_to_task(row: &SqliteRow) -> DdlResult<TaskRecord> {
        let state: TaskState = row.try_get("state")?;
        let retry_count: i64 = row.try_get("retry_count")?;
        Ok(TaskRecord {
            task_id: row.try_get("task_id")?,
            job_id: row.try_get("job_id")?,
            task_type: row.try_get("task_type")?,
            state,
            params: Self::parse_json_sqlite(row, "params")?,
            predecessor_ids: Self::parse_id_list_sqlite(row, "predecessor_ids")?,
            remark: row.try_get("remark")?,
            transaction_group: row.try_get("transaction_group")?,
            retry_count: u32::try_from(retry_count).unwrap_or(0),
            error_message: row.try_get("error_message")?,
            update_time: row.try_get("update_time")?,
        })
    }
}
