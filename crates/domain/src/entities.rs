use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ddl_errors::{DdlError, DdlResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Success,
    Failed,
    RollbackRunning,
    RollbackSuccess,
    RollbackFailed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::RollbackRunning => "ROLLBACK_RUNNING",
            JobState::RollbackSuccess => "ROLLBACK_SUCCESS",
            JobState::RollbackFailed => "ROLLBACK_FAILED",
        }
    }

    /// 终态的任务不再被调度器驱动，ROLLBACK_FAILED 需要人工处理
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::RollbackSuccess | JobState::RollbackFailed
        )
    }

    /// 处于回滚阶段（包括等待回滚的FAILED）
    pub fn is_rolling_back(&self) -> bool {
        matches!(self, JobState::Failed | JobState::RollbackRunning)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Running, Success)
                | (Running, Failed)
                | (Failed, RollbackRunning)
                | (RollbackRunning, RollbackSuccess)
                | (RollbackRunning, RollbackFailed)
        )
    }

    pub fn transition_to(self, next: JobState) -> DdlResult<JobState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DdlError::invalid_transition("job", self, next))
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobState::Queued),
            "RUNNING" => Ok(JobState::Running),
            "SUCCESS" => Ok(JobState::Success),
            "FAILED" => Ok(JobState::Failed),
            "ROLLBACK_RUNNING" => Ok(JobState::RollbackRunning),
            "ROLLBACK_SUCCESS" => Ok(JobState::RollbackSuccess),
            "ROLLBACK_FAILED" => Ok(JobState::RollbackFailed),
            _ => Err(DdlError::Serialization(format!("Invalid job state: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Ready,
    Running,
    Success,
    Failed,
    RollbackSuccess,
    RollbackFailed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::Success => "SUCCESS",
            TaskState::Failed => "FAILED",
            TaskState::RollbackSuccess => "ROLLBACK_SUCCESS",
            TaskState::RollbackFailed => "ROLLBACK_FAILED",
        }
    }

    /// RUNNING -> READY 只用于重试和崩溃恢复后的重置
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Ready, Running)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Ready)
                | (Success, RollbackSuccess)
                | (Success, RollbackFailed)
                | (Failed, RollbackSuccess)
                | (Failed, RollbackFailed)
        )
    }

    pub fn transition_to(self, next: TaskState) -> DdlResult<TaskState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DdlError::invalid_transition("task", self, next))
        }
    }

    /// 已经产生过副作用、回滚时需要撤销的状态
    pub fn needs_undo(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = DdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(TaskState::Ready),
            "RUNNING" => Ok(TaskState::Running),
            "SUCCESS" => Ok(TaskState::Success),
            "FAILED" => Ok(TaskState::Failed),
            "ROLLBACK_SUCCESS" => Ok(TaskState::RollbackSuccess),
            "ROLLBACK_FAILED" => Ok(TaskState::RollbackFailed),
            _ => Err(DdlError::Serialization(format!("Invalid task state: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DdlType {
    CreateTable,
    AlterTable,
    DropTable,
    RenameTable,
    TruncateTable,
    CreateIndex,
    DropIndex,
    Repartition,
}

impl DdlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DdlType::CreateTable => "CREATE_TABLE",
            DdlType::AlterTable => "ALTER_TABLE",
            DdlType::DropTable => "DROP_TABLE",
            DdlType::RenameTable => "RENAME_TABLE",
            DdlType::TruncateTable => "TRUNCATE_TABLE",
            DdlType::CreateIndex => "CREATE_INDEX",
            DdlType::DropIndex => "DROP_INDEX",
            DdlType::Repartition => "REPARTITION",
        }
    }

    pub fn all() -> &'static [DdlType] {
        &[
            DdlType::CreateTable,
            DdlType::AlterTable,
            DdlType::DropTable,
            DdlType::RenameTable,
            DdlType::TruncateTable,
            DdlType::CreateIndex,
            DdlType::DropIndex,
            DdlType::Repartition,
        ]
    }
}

impl fmt::Display for DdlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DdlType {
    type Err = DdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DdlType::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DdlError::Serialization(format!("Invalid ddl type: {s}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub task_id: i64,
    pub job_id: i64,
    /// 任务类型标签，恢复时通过注册表反序列化
    pub task_type: String,
    pub state: TaskState,
    pub params: serde_json::Value,
    pub predecessor_ids: Vec<i64>,
    pub remark: Option<String>,
    pub transaction_group: Option<String>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub update_time: DateTime<Utc>,
}

impl TaskRecord {
    pub fn is_ready(&self) -> bool {
        self.state == TaskState::Ready
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskState::Success
    }

    /// 校验后切换状态并刷新更新时间
    pub fn set_state(&mut self, next: TaskState) -> DdlResult<()> {
        self.state = self.state.transition_to(next)?;
        self.update_time = Utc::now();
        Ok(())
    }

    pub fn entity_description(&self) -> String {
        format!(
            "子任务 {} (job: {}, 类型: {}, 状态: {})",
            self.task_id, self.job_id, self.task_type, self.state
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: i64,
    pub schema_name: String,
    pub ddl_type: DdlType,
    pub ddl_stmt: String,
    pub state: JobState,
    pub tasks: Vec<TaskRecord>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub trace_id: String,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
}

impl Job {
    pub fn task(&self, task_id: i64) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: i64) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    pub fn task_states(&self) -> Vec<TaskState> {
        self.tasks.iter().map(|t| t.state).collect()
    }

    /// 所有前驱都已成功的READY子任务，按task_id排序
    pub fn ready_tasks(&self) -> Vec<&TaskRecord> {
        let states: HashMap<i64, TaskState> =
            self.tasks.iter().map(|t| (t.task_id, t.state)).collect();
        let mut ready: Vec<&TaskRecord> = self
            .tasks
            .iter()
            .filter(|t| t.is_ready())
            .filter(|t| {
                t.predecessor_ids
                    .iter()
                    .all(|p| states.get(p) == Some(&TaskState::Success))
            })
            .collect();
        ready.sort_by_key(|t| t.task_id);
        ready
    }

    pub fn all_tasks_succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.is_success())
    }

    /// 子任务的拓扑顺序，回滚时按其逆序执行
    pub fn topological_order(&self) -> DdlResult<Vec<i64>> {
        crate::dag::topological_order(
            self.tasks
                .iter()
                .map(|t| (t.task_id, t.predecessor_ids.as_slice())),
        )
    }

    pub fn entity_description(&self) -> String {
        format!(
            "DDL任务 {} ({} {}: {}, 状态: {})",
            self.job_id,
            self.ddl_type,
            self.schema_name,
            self.ddl_stmt,
            self.state
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub schema_name: Option<String>,
    pub ddl_type: Option<DdlType>,
    pub limit: Option<i64>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.state.map_or(true, |s| job.state == s)
            && self
                .schema_name
                .as_deref()
                .map_or(true, |s| job.schema_name.eq_ignore_ascii_case(s))
            && self.ddl_type.map_or(true, |t| job.ddl_type == t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Failed));
        assert!(JobState::Running.can_transition_to(JobState::Success));
        assert!(JobState::Failed.can_transition_to(JobState::RollbackRunning));
        assert!(JobState::RollbackRunning.can_transition_to(JobState::RollbackFailed));

        assert!(!JobState::Queued.can_transition_to(JobState::Success));
        assert!(!JobState::Running.can_transition_to(JobState::RollbackRunning));
        assert!(!JobState::Success.can_transition_to(JobState::Failed));
        assert!(!JobState::RollbackFailed.can_transition_to(JobState::RollbackRunning));

        let err = JobState::Success.transition_to(JobState::Running).unwrap_err();
        assert!(matches!(err, DdlError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_task_state_transitions() {
        assert!(TaskState::Ready.can_transition_to(TaskState::Running));
        assert!(TaskState::Running.can_transition_to(TaskState::Ready));
        assert!(TaskState::Success.can_transition_to(TaskState::RollbackSuccess));
        assert!(TaskState::Failed.can_transition_to(TaskState::RollbackFailed));

        assert!(!TaskState::Success.can_transition_to(TaskState::Running));
        assert!(!TaskState::Ready.can_transition_to(TaskState::Success));
        assert!(!TaskState::RollbackSuccess.can_transition_to(TaskState::Ready));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Success.is_terminal());
        assert!(JobState::RollbackSuccess.is_terminal());
        assert!(JobState::RollbackFailed.is_terminal());
        assert!(!JobState::Failed.is_terminal());
        assert!(!JobState::RollbackRunning.is_terminal());
    }

    #[test]
    fn test_state_string_forms() {
        for state in [
            JobState::Queued,
            JobState::RollbackRunning,
            JobState::RollbackFailed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!(
            serde_json::to_string(&JobState::RollbackSuccess).unwrap(),
            "\"ROLLBACK_SUCCESS\""
        );
        assert_eq!("REPARTITION".parse::<DdlType>().unwrap(), DdlType::Repartition);
        assert!("UNKNOWN".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_ready_tasks_respect_predecessors() {
        let now = Utc::now();
        let task = |task_id: i64, state: TaskState, preds: Vec<i64>| TaskRecord {
            task_id,
            job_id: 1,
            task_type: "T".to_string(),
            state,
            params: serde_json::Value::Null,
            predecessor_ids: preds,
            remark: None,
            transaction_group: None,
            retry_count: 0,
            error_message: None,
            update_time: now,
        };
        let job = Job {
            job_id: 1,
            schema_name: "db".to_string(),
            ddl_type: DdlType::CreateTable,
            ddl_stmt: "create table t(id int)".to_string(),
            state: JobState::Running,
            tasks: vec![
                task(1, TaskState::Success, vec![]),
                task(2, TaskState::Ready, vec![1]),
                task(3, TaskState::Ready, vec![1, 2]),
                task(4, TaskState::Ready, vec![]),
            ],
            create_time: now,
            update_time: now,
            trace_id: "trace".to_string(),
            error_message: None,
            cancel_requested: false,
        };

        let ready: Vec<i64> = job.ready_tasks().iter().map(|t| t.task_id).collect();
        assert_eq!(ready, vec![2, 4]);
        assert_eq!(job.topological_order().unwrap(), vec![1, 2, 3, 4]);
    }
}
