pub mod config;
pub mod cron_utils;
pub mod errors;
pub mod models;
pub mod task_registry;
pub mod traits;

pub use config::*;
pub use cron_utils::{CronEvaluator, CronExpression};
pub use errors::*;
pub use task_registry::{TaskTopic, TaskTopicRegistry};

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
