use thiserror::Error;


#[derive(Debug, Error)]
pub enum DdlError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("存储操作错误: {0}")]
    StoreOperation(String),
    #[error("DDL任务未找到: {job_id}")]
    JobNotFound { job_id: i64 },
    #[error("子任务未找到: job {job_id} task {task_id}")]
    TaskNotFound { job_id: i64, task_id: i64 },
    #[error("未注册的任务类型: {0}")]
    UnknownTaskType(String),
    #[error("检测到循环依赖: {0}")]
    CircularDependency(String),
    #[error("无效的任务依赖: 任务 {task_id} 依赖任务 {dependency_id} - {reason}")]
    InvalidDependency {
        task_id: i64,
        dependency_id: i64,
        reason: String,
    },
    #[error("非法的状态转换: {entity} {from} -> {to}")]
    InvalidStateTransition {
        entity: String,
        from: String,
        to: String,
    },
    #[error("元数据锁等待超时: {key}, 已等待 {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("任务执行致命错误: {0}")]
    TaskFatal(String),
    #[error("回滚失败: {0}")]
    RollbackFailed(String),
    #[error("任务不支持回滚: {0}")]
    RollbackUnsupported(String),
    #[error("DDL任务已取消: {job_id}")]
    Cancelled { job_id: i64 },
    #[error("失去DDL任务所有权: {job_id}")]
    OwnershipLost { job_id: i64 },
    #[error("故障注入: {name}")]
    FailPointInjected { name: String, fatal: bool },
    #[error("模拟进程崩溃: {0}")]
    SimulatedCrash(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("内部错误: {0}")]
    Internal(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("操作超时: {0}")]
    Timeout(String),
}

pub type DdlResult<T> = Result<T, DdlError>;

impl DdlError {
    pub fn store_error<S: Into<String>>(msg: S) -> Self {
        Self::StoreOperation(msg.into())
    }
    pub fn job_not_found(job_id: i64) -> Self {
        Self::JobNotFound { job_id }
    }
    pub fn task_not_found(job_id: i64, task_id: i64) -> Self {
        Self::TaskNotFound { job_id, task_id }
    }
    pub fn task_execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }
    pub fn task_fatal<S: Into<String>>(msg: S) -> Self {
        Self::TaskFatal(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn invalid_transition(
        entity: impl Into<String>,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        Self::InvalidStateTransition {
            entity: entity.into(),
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    /// 瞬时错误，在子任务粒度上按退避策略重试
    pub fn is_retryable(&self) -> bool {
        match self {
            DdlError::Database(_)
            | DdlError::StoreOperation(_)
            | DdlError::LockTimeout { .. }
            | DdlError::TaskExecution(_)
            | DdlError::Network(_)
            | DdlError::Timeout(_) => true,
            DdlError::FailPointInjected { fatal, .. } => !fatal,
            _ => false,
        }
    }

    /// 致命错误，触发整个DDL任务回滚
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !self.is_crash()
    }

    /// 模拟崩溃只在测试中出现，驱动流程必须立即停止且不再持久化任何状态
    pub fn is_crash(&self) -> bool {
        matches!(self, DdlError::SimulatedCrash(_))
    }

    pub fn user_message(&self) -> &str {
        match self {
            DdlError::JobNotFound { .. } => "请求的DDL任务不存在",
            DdlError::LockTimeout { .. } => "等待元数据锁超时，请稍后重试",
            DdlError::ValidationError(_) => "DDL语句校验失败",
            DdlError::Cancelled { .. } => "DDL任务已被取消",
            DdlError::RollbackFailed(_) | DdlError::RollbackUnsupported(_) => {
                "DDL任务回滚失败，需要人工介入"
            }
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for DdlError {
    fn from(err: serde_json::Error) -> Self {
        DdlError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for DdlError {
    fn from(err: anyhow::Error) -> Self {
        DdlError::Internal(err.to_string())
    }
}
