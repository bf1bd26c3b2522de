use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{QueueLogStatus, QueueStatus, QueueTask};
use crate::{SchedulerError, SchedulerResult};

/// 任务处理器返回的结果类别
///
/// 数值编码与其驱动的队列任务状态保持一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// 失败，允许重试
    RetryFail,
    Success,
    /// 失败，不再重试
    TerminalFail,
    Cancel,
}

impl TaskOutcome {
    pub fn code(self) -> i32 {
        match self {
            TaskOutcome::RetryFail => 1,
            TaskOutcome::Success => 3,
            TaskOutcome::TerminalFail => 4,
            TaskOutcome::Cancel => 5,
        }
    }

    pub fn from_code(code: i32) -> SchedulerResult<Self> {
        match code {
            1 => Ok(TaskOutcome::RetryFail),
            3 => Ok(TaskOutcome::Success),
            4 => Ok(TaskOutcome::TerminalFail),
            5 => Ok(TaskOutcome::Cancel),
            other => Err(SchedulerError::InvalidExecutionStatus(other)),
        }
    }

    pub fn default_text(self) -> &'static str {
        match self {
            TaskOutcome::RetryFail => "失败",
            TaskOutcome::Success => "成功",
            TaskOutcome::TerminalFail => "终止",
            TaskOutcome::Cancel => "取消",
        }
    }

    /// 结束一次尝试后队列任务应处的状态
    pub fn queue_status(self) -> QueueStatus {
        match self {
            TaskOutcome::RetryFail => QueueStatus::Pending,
            TaskOutcome::Success => QueueStatus::Succeeded,
            TaskOutcome::TerminalFail => QueueStatus::TerminalFailed,
            TaskOutcome::Cancel => QueueStatus::Cancelled,
        }
    }

    /// 关闭执行日志时使用的状态
    pub fn log_status(self) -> QueueLogStatus {
        match self {
            TaskOutcome::RetryFail => QueueLogStatus::RetryFailed,
            TaskOutcome::Success => QueueLogStatus::Succeeded,
            TaskOutcome::TerminalFail => QueueLogStatus::TerminalFailed,
            TaskOutcome::Cancel => QueueLogStatus::Cancelled,
        }
    }
}

/// 任务执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    outcome: TaskOutcome,
    result: String,
}

impl ExecutionResult {
    pub fn new(outcome: TaskOutcome, result: impl Into<String>) -> Self {
        Self {
            outcome,
            result: result.into(),
        }
    }

    /// 从数值编码构造，未知编码直接拒绝
    pub fn from_code(code: i32, result: Option<String>) -> SchedulerResult<Self> {
        let outcome = TaskOutcome::from_code(code)?;
        Ok(match result {
            Some(text) => Self::new(outcome, text),
            None => Self::from(outcome),
        })
    }

    /// 结构化结果以 JSON 文本保存
    pub fn with_json(outcome: TaskOutcome, result: &Value) -> SchedulerResult<Self> {
        Ok(Self::new(outcome, serde_json::to_string(result)?))
    }

    pub fn retry_fail(result: impl Into<String>) -> Self {
        Self::new(TaskOutcome::RetryFail, result)
    }

    pub fn success(result: impl Into<String>) -> Self {
        Self::new(TaskOutcome::Success, result)
    }

    pub fn terminal_fail(result: impl Into<String>) -> Self {
        Self::new(TaskOutcome::TerminalFail, result)
    }

    pub fn cancel(result: impl Into<String>) -> Self {
        Self::new(TaskOutcome::Cancel, result)
    }

    pub fn outcome(&self) -> TaskOutcome {
        self.outcome
    }

    pub fn result(&self) -> &str {
        &self.result
    }

    /// 可重试失败且重试次数已用尽时提升为终止失败
    pub fn promote_if_exhausted(self, task: &QueueTask) -> Self {
        if self.outcome == TaskOutcome::RetryFail && task.is_last_attempt() {
            Self {
                outcome: TaskOutcome::TerminalFail,
                result: self.result,
            }
        } else {
            self
        }
    }
}

impl From<TaskOutcome> for ExecutionResult {
    fn from(outcome: TaskOutcome) -> Self {
        Self::new(outcome, outcome.default_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(execute_count: i64, max_execute_count: i64) -> QueueTask {
        QueueTask {
            id: 1,
            distributor_id: 1,
            task_topic: "demo".to_string(),
            task_data: "{}".to_string(),
            execute_status: QueueStatus::Running,
            execute_result: String::new(),
            execute_count,
            max_execute_count,
            next_execute_time: 0,
            create_time: 0,
            start_time: 0,
            end_time: 0,
        }
    }

    #[test]
    fn test_from_code_rejects_unknown_status() {
        for code in [0, 2, 6, -1] {
            match ExecutionResult::from_code(code, None) {
                Err(SchedulerError::InvalidExecutionStatus(c)) => assert_eq!(c, code),
                other => panic!("Expected InvalidExecutionStatus, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_default_texts() {
        let result = ExecutionResult::from_code(3, None).unwrap();
        assert_eq!(result.outcome(), TaskOutcome::Success);
        assert_eq!(result.result(), "成功");
        assert_eq!(ExecutionResult::from(TaskOutcome::Cancel).result(), "取消");

        let result = ExecutionResult::from_code(1, Some("磁盘已满".to_string())).unwrap();
        assert_eq!(result.outcome(), TaskOutcome::RetryFail);
        assert_eq!(result.result(), "磁盘已满");
    }

    #[test]
    fn test_json_result_is_encoded() {
        let result = ExecutionResult::with_json(TaskOutcome::Success, &json!({"rows": 3})).unwrap();
        assert_eq!(result.result(), r#"{"rows":3}"#);
    }

    #[test]
    fn test_retry_fail_promoted_on_last_attempt() {
        let promoted = ExecutionResult::retry_fail("boom").promote_if_exhausted(&task(4, 5));
        assert_eq!(promoted.outcome(), TaskOutcome::TerminalFail);
        assert_eq!(promoted.result(), "boom");

        let kept = ExecutionResult::retry_fail("boom").promote_if_exhausted(&task(3, 5));
        assert_eq!(kept.outcome(), TaskOutcome::RetryFail);

        let success = ExecutionResult::success("ok").promote_if_exhausted(&task(4, 5));
        assert_eq!(success.outcome(), TaskOutcome::Success);
    }

    #[test]
    fn test_status_mapping_table() {
        assert_eq!(TaskOutcome::RetryFail.queue_status(), QueueStatus::Pending);
        assert_eq!(TaskOutcome::RetryFail.log_status(), QueueLogStatus::RetryFailed);
        assert_eq!(TaskOutcome::TerminalFail.queue_status(), QueueStatus::TerminalFailed);
        assert_eq!(TaskOutcome::TerminalFail.log_status(), QueueLogStatus::TerminalFailed);
        assert_eq!(TaskOutcome::Success.log_status(), QueueLogStatus::Succeeded);
        assert_eq!(TaskOutcome::Cancel.queue_status(), QueueStatus::Cancelled);
    }
}
