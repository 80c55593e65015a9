use crate::entities::{DdlType, JobFilter, JobState};

pub const JOB_COLUMNS: &str = "job_id, schema_name, ddl_type, ddl_stmt, state, trace_id, error_message, cancel_requested, create_time, update_time";

/// 根据过滤条件生成DDL任务查询语句，参数按 `?` 顺序绑定
pub struct JobQueryBuilder;

impl JobQueryBuilder {
    pub fn build_select_query(filter: &JobFilter) -> (String, Vec<JobQueryParam>) {
        let mut query = format!("SELECT {JOB_COLUMNS} FROM ddl_jobs WHERE 1=1");
        let mut params = Vec::new();

        if let Some(state) = filter.state {
            query.push_str(" AND state = ?");
            params.push(JobQueryParam::State(state));
        }

        if let Some(schema_name) = &filter.schema_name {
            query.push_str(" AND LOWER(schema_name) = LOWER(?)");
            params.push(JobQueryParam::String(schema_name.clone()));
        }

        if let Some(ddl_type) = filter.ddl_type {
            query.push_str(" AND ddl_type = ?");
            params.push(JobQueryParam::DdlType(ddl_type));
        }

        query.push_str(" ORDER BY job_id DESC");

        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(JobQueryParam::Int64(limit));
        }

        (query, params)
    }

    pub fn build_unfinished_query() -> String {
        format!(
            "SELECT {JOB_COLUMNS} FROM ddl_jobs WHERE state NOT IN ('SUCCESS', 'ROLLBACK_SUCCESS', 'ROLLBACK_FAILED') ORDER BY job_id ASC"
        )
    }
}

#[derive(Debug, Clone)]
pub enum JobQueryParam {
    String(String),
    State(JobState),
    DdlType(DdlType),
    Int64(i64),
}

impl JobQueryParam {
    pub fn as_string(&self) -> String {
        match self {
            JobQueryParam::String(s) => s.clone(),
            JobQueryParam::State(state) => state.as_str().to_string(),
            JobQueryParam::DdlType(ddl_type) => ddl_type.as_str().to_string(),
            JobQueryParam::Int64(i) => i.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_select_query_no_filter() {
        let (query, params) = JobQueryBuilder::build_select_query(&JobFilter::default());
        assert!(query.starts_with("SELECT job_id, schema_name"));
        assert!(query.ends_with("ORDER BY job_id DESC"));
        assert!(params.is_empty());
    }

    #[test]
    fn test_build_select_query_with_all_filters() {
        let filter = JobFilter {
            state: Some(JobState::RollbackFailed),
            schema_name: Some("DB1".to_string()),
            ddl_type: Some(DdlType::DropTable),
            limit: Some(10),
        };
        let (query, params) = JobQueryBuilder::build_select_query(&filter);

        assert!(query.contains("AND state = ?"));
        assert!(query.contains("AND LOWER(schema_name) = LOWER(?)"));
        assert!(query.contains("AND ddl_type = ?"));
        assert!(query.contains("LIMIT ?"));
        let values: Vec<String> = params.iter().map(JobQueryParam::as_string).collect();
        assert_eq!(values, vec!["ROLLBACK_FAILED", "DB1", "DROP_TABLE", "10"]);
    }
}
