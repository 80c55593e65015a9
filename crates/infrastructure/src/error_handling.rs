//! 仓储操作的错误上下文
//!
//! 把sqlx错误转换为带有DDL任务上下文的 `DdlError`，并记录结构化日志

use std::fmt;

use chrono::{DateTime, Utc};
use ddl_errors::DdlError;
use sqlx::Error as SqlxError;
use tracing::{error, instrument};

#[derive(Debug, Clone)]
pub enum RepositoryOperation {
    Create,
    Read,
    Update,
    Delete,
    Query,
    BatchUpdate,
    Migrate,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Update => write!(f, "更新"),
            RepositoryOperation::Delete => write!(f, "删除"),
            RepositoryOperation::Query => write!(f, "查询"),
            RepositoryOperation::BatchUpdate => write!(f, "批量更新"),
            RepositoryOperation::Migrate => write!(f, "迁移"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOperationContext {
    pub operation: RepositoryOperation,
    pub job_id: Option<i64>,
    pub task_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub additional_info: Option<String>,
}

impl JobOperationContext {
    pub fn new(operation: RepositoryOperation) -> Self {
        Self {
            operation,
            job_id: None,
            task_id: None,
            timestamp: Utc::now(),
            additional_info: None,
        }
    }

    pub fn with_job_id(mut self, job_id: i64) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_task_id(mut self, task_id: i64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_additional_info(mut self, info: String) -> Self {
        self.additional_info = Some(info);
        self
    }

    pub fn entity_description(&self) -> String {
        match (&self.job_id, &self.task_id) {
            (Some(job_id), Some(task_id)) => format!("DDL子任务 (job: {job_id}, task: {task_id})"),
            (Some(job_id), None) => format!("DDL任务 (ID: {job_id})"),
            (None, Some(task_id)) => format!("DDL子任务 (ID: {task_id})"),
            (None, None) => "DDL任务".to_string(),
        }
    }
}

pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    #[instrument(skip_all, fields(
        operation = %context.operation,
        job_id = ?context.job_id,
        task_id = ?context.task_id,
        timestamp = %context.timestamp,
    ))]
    pub fn job_database_error(context: JobOperationContext, error: SqlxError) -> DdlError {
        let entity_desc = context.entity_description();
        let operation_desc = context.operation.to_string();

        let error_msg = match &error {
            SqlxError::Database(db_error) => match db_error.constraint() {
                Some(constraint) => {
                    format!("{operation_desc}{entity_desc}时发生数据库约束冲突: {constraint}")
                }
                None => format!("{operation_desc}{entity_desc}时发生数据库错误: {db_error}"),
            },
            SqlxError::PoolClosed => format!("{operation_desc}{entity_desc}时数据库连接池已关闭"),
            SqlxError::PoolTimedOut => format!("{operation_desc}{entity_desc}时数据库连接池超时"),
            SqlxError::Io(io_error) => {
                format!("{operation_desc}{entity_desc}时发生I/O错误: {io_error}")
            }
            _ => format!("{operation_desc}{entity_desc}时发生未知数据库错误: {error}"),
        };
        let error_msg = match &context.additional_info {
            Some(info) => format!("{error_msg} ({info})"),
            None => error_msg,
        };

        error!(error = %error, "{}", error_msg);
        DdlError::store_error(error_msg)
    }

    pub fn serialization_error(context: JobOperationContext, error: serde_json::Error) -> DdlError {
        let msg = format!(
            "{}{}时序列化失败: {}",
            context.operation,
            context.entity_description(),
            error
        );
        error!(error = %error, "{}", msg);
        DdlError::Serialization(msg)
    }
}

#[macro_export]
macro_rules! job_context {
    ($operation:expr) => {
        $crate::error_handling::JobOperationContext::new($operation)
    };
    ($operation:expr, job_id = $job_id:expr) => {
        $crate::error_handling::JobOperationContext::new($operation).with_job_id($job_id)
    };
    ($operation:expr, job_id = $job_id:expr, task_id = $task_id:expr) => {
        $crate::error_handling::JobOperationContext::new($operation)
            .with_job_id($job_id)
            .with_task_id($task_id)
    };
}
