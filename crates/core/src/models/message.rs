//! 协调器与工作进程之间的线协议
//!
//! 每条消息是一个 JSON 对象，按行分帧传输。
//!
//! - 工作进程 -> 协调器: `{type, worker_id, time, data}`
//! - 协调器 -> 工作进程: `{type, data, time}`
//!
//! 信封只携带原始 `data`，通过 [`CoordinatorMessage::command`] 与
//! [`WorkerMessage::event`] 解码为强类型的载荷。

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::QueueTask;
use crate::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMessageType {
    Connect,
    QueueDistributor,
    Finished,
    ExecuteTaskFinished,
}

impl WorkerMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMessageType::Connect => "connect",
            WorkerMessageType::QueueDistributor => "queue_distributor",
            WorkerMessageType::Finished => "finished",
            WorkerMessageType::ExecuteTaskFinished => "execute_task_finished",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorMessageType {
    CronScheduler,
    TimeScheduler,
    TaskDistributor,
    QueueScheduler,
    ExecuteTask,
    OverdueTasks,
}

impl CoordinatorMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorMessageType::CronScheduler => "cron_scheduler",
            CoordinatorMessageType::TimeScheduler => "time_scheduler",
            CoordinatorMessageType::TaskDistributor => "task_distributor",
            CoordinatorMessageType::QueueScheduler => "queue_scheduler",
            CoordinatorMessageType::ExecuteTask => "execute_task",
            CoordinatorMessageType::OverdueTasks => "overdue_tasks",
        }
    }
}

/// 握手载荷，工作进程上报本地的在途计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectReport {
    pub queue_count: i64,
    #[serde(default)]
    pub task_topic_pool_count: BTreeMap<String, i64>,
    #[serde(default)]
    pub task_queue_id_pool: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSchedulerRequest {
    #[serde(default)]
    pub exclude_topic: Vec<String>,
    pub select_count: i64,
}

/// 下发执行的队列任务，附带协调器解析出的处理器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteTaskRequest {
    #[serde(flatten)]
    pub task: QueueTask,
    /// 已注册主题的处理器名称，未注册时为 null
    pub task_handler: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteTaskFinished {
    pub queue_id: i64,
    pub task_topic: String,
}

/// 协调器下发的指令
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorCommand {
    CronScheduler,
    TimeScheduler,
    TaskDistributor,
    QueueScheduler(QueueSchedulerRequest),
    ExecuteTask(ExecuteTaskRequest),
    /// 全集群当前在途的队列任务 ID
    OverdueTasks(Vec<i64>),
}

impl CoordinatorCommand {
    pub fn message_type(&self) -> CoordinatorMessageType {
        match self {
            CoordinatorCommand::CronScheduler => CoordinatorMessageType::CronScheduler,
            CoordinatorCommand::TimeScheduler => CoordinatorMessageType::TimeScheduler,
            CoordinatorCommand::TaskDistributor => CoordinatorMessageType::TaskDistributor,
            CoordinatorCommand::QueueScheduler(_) => CoordinatorMessageType::QueueScheduler,
            CoordinatorCommand::ExecuteTask(_) => CoordinatorMessageType::ExecuteTask,
            CoordinatorCommand::OverdueTasks(_) => CoordinatorMessageType::OverdueTasks,
        }
    }
}

/// 工作进程上报的事件
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Connect(ConnectReport),
    QueueDistributor(Vec<QueueTask>),
    Finished,
    ExecuteTaskFinished(ExecuteTaskFinished),
}

impl WorkerEvent {
    pub fn message_type(&self) -> WorkerMessageType {
        match self {
            WorkerEvent::Connect(_) => WorkerMessageType::Connect,
            WorkerEvent::QueueDistributor(_) => WorkerMessageType::QueueDistributor,
            WorkerEvent::Finished => WorkerMessageType::Finished,
            WorkerEvent::ExecuteTaskFinished(_) => WorkerMessageType::ExecuteTaskFinished,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorMessage {
    #[serde(rename = "type")]
    pub message_type: CoordinatorMessageType,
    #[serde(default)]
    pub data: Value,
    pub time: i64,
}

impl CoordinatorMessage {
    pub fn from_command(command: &CoordinatorCommand, time: i64) -> SchedulerResult<Self> {
        let data = match command {
            CoordinatorCommand::CronScheduler
            | CoordinatorCommand::TimeScheduler
            | CoordinatorCommand::TaskDistributor => Value::Array(Vec::new()),
            CoordinatorCommand::QueueScheduler(request) => serde_json::to_value(request)?,
            CoordinatorCommand::ExecuteTask(request) => serde_json::to_value(request)?,
            CoordinatorCommand::OverdueTasks(ids) => serde_json::to_value(ids)?,
        };
        Ok(Self {
            message_type: command.message_type(),
            data,
            time,
        })
    }

    pub fn command(&self) -> SchedulerResult<CoordinatorCommand> {
        Ok(match self.message_type {
            CoordinatorMessageType::CronScheduler => CoordinatorCommand::CronScheduler,
            CoordinatorMessageType::TimeScheduler => CoordinatorCommand::TimeScheduler,
            CoordinatorMessageType::TaskDistributor => CoordinatorCommand::TaskDistributor,
            CoordinatorMessageType::QueueScheduler => {
                CoordinatorCommand::QueueScheduler(decode_data(&self.data)?)
            }
            CoordinatorMessageType::ExecuteTask => {
                CoordinatorCommand::ExecuteTask(decode_data(&self.data)?)
            }
            CoordinatorMessageType::OverdueTasks => {
                CoordinatorCommand::OverdueTasks(decode_data(&self.data)?)
            }
        })
    }

    pub fn serialize(&self) -> SchedulerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(json: &str) -> SchedulerResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| SchedulerError::Protocol(format!("无法解析协调器消息: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    #[serde(rename = "type")]
    pub message_type: WorkerMessageType,
    pub worker_id: u32,
    pub time: i64,
    #[serde(default)]
    pub data: Value,
}

impl WorkerMessage {
    pub fn from_event(worker_id: u32, event: &WorkerEvent, time: i64) -> SchedulerResult<Self> {
        let data = match event {
            WorkerEvent::Connect(report) => serde_json::to_value(report)?,
            WorkerEvent::QueueDistributor(rows) => serde_json::to_value(rows)?,
            WorkerEvent::Finished => Value::Array(Vec::new()),
            WorkerEvent::ExecuteTaskFinished(finished) => serde_json::to_value(finished)?,
        };
        Ok(Self {
            message_type: event.message_type(),
            worker_id,
            time,
            data,
        })
    }

    pub fn event(&self) -> SchedulerResult<WorkerEvent> {
        Ok(match self.message_type {
            WorkerMessageType::Connect => WorkerEvent::Connect(decode_data(&self.data)?),
            WorkerMessageType::QueueDistributor => {
                WorkerEvent::QueueDistributor(decode_data(&self.data)?)
            }
            WorkerMessageType::Finished => WorkerEvent::Finished,
            WorkerMessageType::ExecuteTaskFinished => {
                WorkerEvent::ExecuteTaskFinished(decode_data(&self.data)?)
            }
        })
    }

    pub fn serialize(&self) -> SchedulerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(json: &str) -> SchedulerResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| SchedulerError::Protocol(format!("无法解析工作进程消息: {e}")))
    }
}

fn decode_data<T: DeserializeOwned>(data: &Value) -> SchedulerResult<T> {
    serde_json::from_value(data.clone())
        .map_err(|e| SchedulerError::Protocol(format!("消息载荷格式错误: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueueStatus;
    use serde_json::json;

    fn queue_task() -> QueueTask {
        QueueTask {
            id: 42,
            distributor_id: 3,
            task_topic: "demo".to_string(),
            task_data: r#"{"x":1}"#.to_string(),
            execute_status: QueueStatus::Pending,
            execute_result: String::new(),
            execute_count: 0,
            max_execute_count: 5,
            next_execute_time: 0,
            create_time: 100,
            start_time: 0,
            end_time: 0,
        }
    }

    #[test]
    fn test_trigger_envelope_shape() {
        let message = CoordinatorMessage::from_command(&CoordinatorCommand::CronScheduler, 1700)
            .unwrap();
        let value: Value = serde_json::from_str(&message.serialize().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "cron_scheduler", "data": [], "time": 1700}));
    }

    #[test]
    fn test_queue_scheduler_payload() {
        let raw = r#"{"type":"queue_scheduler","data":{"exclude_topic":["mail"],"select_count":7},"time":5}"#;
        let message = CoordinatorMessage::deserialize(raw).unwrap();
        match message.command().unwrap() {
            CoordinatorCommand::QueueScheduler(request) => {
                assert_eq!(request.exclude_topic, vec!["mail".to_string()]);
                assert_eq!(request.select_count, 7);
            }
            other => panic!("Expected QueueScheduler, got {other:?}"),
        }
    }

    #[test]
    fn test_execute_task_carries_full_row() {
        let command = CoordinatorCommand::ExecuteTask(ExecuteTaskRequest {
            task: queue_task(),
            task_handler: Some("demo".to_string()),
        });
        let message = CoordinatorMessage::from_command(&command, 9).unwrap();
        assert_eq!(message.data["queue_id"], json!(42));
        assert_eq!(message.data["task_topic"], json!("demo"));
        assert_eq!(message.data["task_handler"], json!("demo"));

        let decoded = CoordinatorMessage::deserialize(&message.serialize().unwrap())
            .unwrap()
            .command()
            .unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_worker_connect_envelope() {
        let report = ConnectReport {
            queue_count: 5,
            task_topic_pool_count: BTreeMap::from([("demo".to_string(), 1)]),
            task_queue_id_pool: vec![42],
        };
        let message = WorkerMessage::from_event(2, &WorkerEvent::Connect(report.clone()), 10)
            .unwrap();
        let value: Value = serde_json::from_str(&message.serialize().unwrap()).unwrap();
        assert_eq!(value["type"], json!("connect"));
        assert_eq!(value["worker_id"], json!(2));
        assert_eq!(value["data"]["task_topic_pool_count"]["demo"], json!(1));

        match message.event().unwrap() {
            WorkerEvent::Connect(decoded) => assert_eq!(decoded, report),
            other => panic!("Expected Connect, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_messages_are_protocol_errors() {
        assert!(matches!(
            WorkerMessage::deserialize("not json"),
            Err(SchedulerError::Protocol(_))
        ));
        assert!(matches!(
            CoordinatorMessage::deserialize(r#"{"type":"reboot","data":[],"time":1}"#),
            Err(SchedulerError::Protocol(_))
        ));

        let message = WorkerMessage {
            message_type: WorkerMessageType::ExecuteTaskFinished,
            worker_id: 1,
            time: 1,
            data: json!({"queue_id": "x"}),
        };
        assert!(matches!(message.event(), Err(SchedulerError::Protocol(_))));
    }
}
