use serde::{Deserialize, Serialize};
use serde_json::Value;

text_status! {
    /// 队列任务状态
    ///
    /// 可重试失败的任务回到 `Pending` 并带上新的 `next_execute_time`。
    pub enum QueueStatus {
        Pending => "PENDING",
        Running => "RUNNING",
        Succeeded => "SUCCEEDED",
        TerminalFailed => "TERMINAL_FAILED",
        Cancelled => "CANCELLED",
    }
}

/// 一个可执行的工作单元
///
/// `execute_count` 只在一次尝试结束时加一（成功、可重试失败或终止），认领时不变。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueTask {
    #[serde(rename = "queue_id")]
    pub id: i64,
    pub distributor_id: i64,
    pub task_topic: String,
    pub task_data: String,
    pub execute_status: QueueStatus,
    pub execute_result: String,
    pub execute_count: i64,
    pub max_execute_count: i64,
    pub next_execute_time: i64,
    pub create_time: i64,
    pub start_time: i64,
    pub end_time: i64,
}

impl QueueTask {
    /// 解析任务数据，非 JSON 内容按字符串返回
    pub fn payload(&self) -> Value {
        serde_json::from_str(&self.task_data)
            .unwrap_or_else(|_| Value::String(self.task_data.clone()))
    }

    /// 本次尝试是否已是最后一次机会
    pub fn is_last_attempt(&self) -> bool {
        self.execute_count >= self.max_execute_count - 1
    }

    pub fn is_pending(&self) -> bool {
        self.execute_status == QueueStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(execute_count: i64, max_execute_count: i64) -> QueueTask {
        QueueTask {
            id: 1,
            distributor_id: 1,
            task_topic: "demo".to_string(),
            task_data: r#"{"x":1}"#.to_string(),
            execute_status: QueueStatus::Pending,
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
    fn test_last_attempt_boundary() {
        assert!(!sample(3, 5).is_last_attempt());
        assert!(sample(4, 5).is_last_attempt());
        assert!(sample(0, 1).is_last_attempt());
    }

    #[test]
    fn test_payload_parsing() {
        assert_eq!(sample(0, 5).payload(), json!({"x": 1}));

        let mut task = sample(0, 5);
        task.task_data = "plain text".to_string();
        assert_eq!(task.payload(), json!("plain text"));
    }

    #[test]
    fn test_queue_id_wire_name() {
        let value = serde_json::to_value(sample(0, 5)).unwrap();
        assert_eq!(value["queue_id"], json!(1));
        assert_eq!(value["execute_status"], json!("PENDING"));
    }
}
