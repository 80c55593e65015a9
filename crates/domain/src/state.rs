use crate::entities::{JobState, TaskState};

/// 由子任务状态归约出DDL任务状态
///
/// - 回滚阶段中任一子任务 ROLLBACK_FAILED => ROLLBACK_FAILED
/// - 回滚阶段中已没有待撤销的子任务 => ROLLBACK_SUCCESS
/// - 正向执行阶段全部成功 => SUCCESS，任一失败 => FAILED
/// - 其余情况保持当前状态，已开始执行的QUEUED任务归约为RUNNING
pub fn reduce_job_state(current: JobState, tasks: &[TaskState]) -> JobState {
    if current.is_terminal() {
        return current;
    }

    if current.is_rolling_back() {
        // FAILED 必须先经过 ROLLBACK_RUNNING 才能归约到回滚终态
        if current != JobState::RollbackRunning {
            return current;
        }
        if tasks.contains(&TaskState::RollbackFailed) {
            return JobState::RollbackFailed;
        }
        let nothing_to_undo = tasks
            .iter()
            .all(|s| matches!(s, TaskState::Ready | TaskState::RollbackSuccess));
        return if nothing_to_undo {
            JobState::RollbackSuccess
        } else {
            current
        };
    }

    if tasks.iter().all(|s| *s == TaskState::Success) {
        return JobState::Success;
    }
    if tasks.contains(&TaskState::Failed) {
        return JobState::Failed;
    }
    let started = tasks
        .iter()
        .any(|s| matches!(s, TaskState::Running | TaskState::Success));
    if started {
        JobState::Running
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskState::*;

    #[test]
    fn test_all_success_reduces_to_success() {
        assert_eq!(
            reduce_job_state(JobState::Running, &[Success, Success, Success]),
            JobState::Success
        );
    }

    #[test]
    fn test_any_failure_reduces_to_failed() {
        assert_eq!(
            reduce_job_state(JobState::Running, &[Success, Failed, Ready]),
            JobState::Failed
        );
    }

    #[test]
    fn test_partial_progress_stays_running() {
        assert_eq!(
            reduce_job_state(JobState::Running, &[Success, Ready]),
            JobState::Running
        );
        assert_eq!(
            reduce_job_state(JobState::Queued, &[Ready, Ready]),
            JobState::Queued
        );
        assert_eq!(
            reduce_job_state(JobState::Queued, &[Success, Ready]),
            JobState::Running
        );
    }

    #[test]
    fn test_rollback_reduction() {
        assert_eq!(
            reduce_job_state(JobState::RollbackRunning, &[RollbackSuccess, Ready]),
            JobState::RollbackSuccess
        );
        assert_eq!(
            reduce_job_state(JobState::RollbackRunning, &[Success, RollbackSuccess]),
            JobState::RollbackRunning
        );
        assert_eq!(
            reduce_job_state(JobState::RollbackRunning, &[RollbackFailed, Success]),
            JobState::RollbackFailed
        );
        assert_eq!(
            reduce_job_state(JobState::Failed, &[RollbackSuccess, Ready]),
            JobState::Failed
        );
    }

    #[test]
    fn test_terminal_state_is_stable() {
        assert_eq!(
            reduce_job_state(JobState::Success, &[Success, Ready]),
            JobState::Success
        );
    }
}
