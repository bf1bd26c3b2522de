use serde::{Deserialize, Serialize};

text_status! {
    /// 执行日志状态，与一次尝试的结果一一对应
    pub enum QueueLogStatus {
        Started => "STARTED",
        Succeeded => "SUCCEEDED",
        RetryFailed => "RETRY_FAILED",
        TerminalFailed => "TERMINAL_FAILED",
        Cancelled => "CANCELLED",
    }
}

/// 队列任务的一次执行尝试记录
///
/// 每个队列任务最多只有一条 `Started` 状态的记录，在尝试结束时关闭。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueLog {
    pub id: i64,
    pub queue_id: i64,
    pub execute_status: QueueLogStatus,
    pub execute_result: String,
    pub start_time: i64,
    pub end_time: i64,
}

impl QueueLog {
    pub fn is_open(&self) -> bool {
        self.execute_status == QueueLogStatus::Started
    }
}
