use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SchedulerError, SchedulerResult};

text_status! {
    /// 分发记录状态: `Pending -> Running -> Succeeded | Failed`
    pub enum DistributorStatus {
        Pending => "PENDING",
        Running => "RUNNING",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
    }
}

/// 触发器的一次触发实例，展开为若干队列任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Distributor {
    pub id: i64,
    pub scheduler_id: i64,
    pub task_topic: String,
    pub task_data: String,
    pub task_count: i64,
    pub execute_status: DistributorStatus,
    pub execute_result: String,
    pub create_time: i64,
    pub start_time: i64,
    pub end_time: i64,
}

impl Distributor {
    /// 把载荷展开为逐个任务的数据
    ///
    /// 数组按元素展开，对象视为单个任务；空载荷或空数组得到一个空对象任务。
    pub fn expand_payload(&self) -> SchedulerResult<Vec<Value>> {
        expand_payload(&self.task_data)
    }
}

pub fn expand_payload(task_data: &str) -> SchedulerResult<Vec<Value>> {
    if task_data.trim().is_empty() {
        return Ok(vec![Value::Object(Default::default())]);
    }

    let value: Value = serde_json::from_str(task_data).map_err(|e| {
        SchedulerError::Serialization(format!("分发载荷不是有效的JSON: {e}"))
    })?;

    let payloads = match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };

    if payloads.is_empty() {
        Ok(vec![Value::Object(Default::default())])
    } else {
        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expand_array_payload() {
        let payloads = expand_payload(r#"[{"x":1},{"x":2}]"#).unwrap();
        assert_eq!(payloads, vec![json!({"x": 1}), json!({"x": 2})]);
    }

    #[test]
    fn test_expand_empty_payload_yields_single_task() {
        for raw in ["", "  ", "[]", "null"] {
            let payloads = expand_payload(raw).unwrap();
            assert_eq!(payloads, vec![json!({})], "payload {raw:?}");
        }
    }

    #[test]
    fn test_expand_object_payload_is_single_task() {
        let payloads = expand_payload(r#"{"path":"/tmp"}"#).unwrap();
        assert_eq!(payloads, vec![json!({"path": "/tmp"})]);
    }

    #[test]
    fn test_expand_invalid_payload() {
        match expand_payload("[1,") {
            Err(SchedulerError::Serialization(_)) => {}
            other => panic!("Expected serialization error, got {other:?}"),
        }
    }
}
