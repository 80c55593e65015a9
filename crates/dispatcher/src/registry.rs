use std::collections::HashMap;
use std::sync::Arc;

use ddl_domain::{DdlError, DdlResult, ExecutableJob};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::task::DdlTask;
use crate::tasks::{
    AcquireMdlTask, AlterPhysicalTablesTask, CdcMarkTask, CreatePhysicalTablesTask,
    DropPhysicalTablesTask, SyncSchemaTask, UpdateTableMetaTask, ValidateTableTask,
};

pub type TaskFactory = Arc<dyn Fn(&serde_json::Value) -> DdlResult<Box<dyn DdlTask>> + Send + Sync>;

/// 任务类型标签到构造函数的映射，恢复时通过它从持久化的参数重建子任务
#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: HashMap<String, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_tasks() -> Self {
        let mut registry = Self::new();
        registry.register_serde::<ValidateTableTask>(ValidateTableTask::TYPE);
        registry.register_serde::<AcquireMdlTask>(AcquireMdlTask::TYPE);
        registry.register_serde::<CreatePhysicalTablesTask>(CreatePhysicalTablesTask::TYPE);
        registry.register_serde::<AlterPhysicalTablesTask>(AlterPhysicalTablesTask::TYPE);
        registry.register_serde::<DropPhysicalTablesTask>(DropPhysicalTablesTask::TYPE);
        registry.register_serde::<UpdateTableMetaTask>(UpdateTableMetaTask::TYPE);
        registry.register_serde::<CdcMarkTask>(CdcMarkTask::TYPE);
        registry.register_serde::<SyncSchemaTask>(SyncSchemaTask::TYPE);
        registry
    }

    /// 同名类型会被覆盖
    pub fn register<F>(&mut self, task_type: &str, factory: F)
    where
        F: Fn(&serde_json::Value) -> DdlResult<Box<dyn DdlTask>> + Send + Sync + 'static,
    {
        debug!("注册任务类型: {}", task_type);
        self.factories
            .insert(task_type.to_string(), Arc::new(factory));
    }

    /// 参数即任务本身的序列化形式
    pub fn register_serde<T>(&mut self, task_type: &str)
    where
        T: DdlTask + DeserializeOwned + 'static,
    {
        let name = task_type.to_string();
        self.register(task_type, move |params| {
            let task: T = serde_json::from_value(params.clone()).map_err(|e| {
                DdlError::validation_error(format!("任务 {name} 的参数无效: {e}"))
            })?;
            Ok(Box::new(task))
        });
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn create(
        &self,
        task_type: &str,
        params: &serde_json::Value,
    ) -> DdlResult<Box<dyn DdlTask>> {
        let factory = self
            .factories
            .get(task_type)
            .ok_or_else(|| DdlError::UnknownTaskType(task_type.to_string()))?;
        factory(params)
    }

    /// 提交前确认每个子任务都能被构造
    pub fn validate_job(&self, job: &ExecutableJob) -> DdlResult<()> {
        for task in job.tasks() {
            self.create(&task.task_type, &task.params)?;
        }
        Ok(())
    }
}
