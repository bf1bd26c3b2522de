//! 任务处理器接口
//!
//! 每个任务主题对应一个处理器。处理器实例在工作进程内按需创建并缓存复用，
//! 同一进程内不会并发调用。
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use taskq_core::models::{ExecutionResult, QueueTask};
//! use taskq_core::traits::TaskHandler;
//! use taskq_core::SchedulerResult;
//!
//! struct SendMail;
//!
//! #[async_trait]
//! impl TaskHandler for SendMail {
//!     async fn execute(&self, task: &QueueTask) -> SchedulerResult<ExecutionResult> {
//!         let payload = task.payload();
//!         // 发送邮件...
//!         Ok(ExecutionResult::success(format!("已发送: {payload}")))
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    models::{ExecutionResult, QueueTask},
    SchedulerResult,
};

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// 执行一次尝试
    ///
    /// 返回 `Err` 视为未处理的失败：重试次数未用尽时按可重试失败处理，
    /// 错误文本保存为任务结果。
    async fn execute(&self, task: &QueueTask) -> SchedulerResult<ExecutionResult>;
}

/// 处理器工厂，工作进程首次执行某主题时调用
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn TaskHandler> + Send + Sync>;
