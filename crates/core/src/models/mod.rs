/// 以大写文本存储的状态枚举
///
/// 生成 `as_str`、`FromStr`、`Display` 以及与数据库文本列一致的 serde 表示。
macro_rules! text_status {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::SchedulerError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err($crate::SchedulerError::Serialization(format!(
                        "无效的{}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub mod distributor;
pub mod execution_result;
pub mod message;
pub mod queue_log;
pub mod queue_task;
pub mod scheduler;

pub use distributor::{Distributor, DistributorStatus};
pub use execution_result::{ExecutionResult, TaskOutcome};
pub use message::{
    ConnectReport, CoordinatorCommand, CoordinatorMessage, CoordinatorMessageType,
    ExecuteTaskFinished, ExecuteTaskRequest, QueueSchedulerRequest, WorkerEvent, WorkerMessage,
    WorkerMessageType,
};
pub use queue_log::{QueueLog, QueueLogStatus};
pub use queue_task::{QueueStatus, QueueTask};
pub use scheduler::{NewDistributor, Scheduler, SchedulerKind, SchedulerStatus};
