use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use taskq_core::models::{ExecuteTaskRequest, ExecutionResult, QueueStatus, QueueTask};
use taskq_core::traits::{QueueRepository, TaskHandler};
use taskq_core::{SchedulerResult, TaskTopicRegistry};
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::WorkerMetrics;

/// 任务主题没有注册处理器时写入的结果
pub const UNREGISTERED_TOPIC: &str = "任务主题未注册";

/// 执行单个队列任务：认领、调用处理器、记录结果
///
/// 处理器实例按主题懒加载并缓存，同一进程内串行调用。
pub struct TaskExecutionManager {
    repository: Arc<dyn QueueRepository>,
    registry: Arc<TaskTopicRegistry>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    metrics: Arc<WorkerMetrics>,
}

impl TaskExecutionManager {
    pub fn new(
        repository: Arc<dyn QueueRepository>,
        registry: Arc<TaskTopicRegistry>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            repository,
            registry,
            handlers: HashMap::new(),
            metrics,
        }
    }

    /// 执行一次尝试，任务已被其他进程认领或不再待执行时返回 `None`
    #[instrument(skip(self, request), fields(queue_id = request.task.id, topic = %request.task.task_topic))]
    pub async fn execute(
        &mut self,
        request: &ExecuteTaskRequest,
    ) -> SchedulerResult<Option<ExecutionResult>> {
        let queue_id = request.task.id;
        let Some(mut task) = self.repository.get_queue_task(queue_id).await? else {
            debug!("队列任务 {} 不是待执行状态，跳过", queue_id);
            self.metrics.record_claim_lost();
            return Ok(None);
        };

        let topic = request
            .task_handler
            .as_deref()
            .and_then(|name| self.registry.get(name));
        let max_attempts = topic.map(|t| t.max_attempts()).unwrap_or(1);

        if self.repository.claim_queue_task(queue_id, max_attempts).await? != 1 {
            debug!("队列任务 {} 已被其他进程认领", queue_id);
            self.metrics.record_claim_lost();
            return Ok(None);
        }
        self.repository.open_queue_log(queue_id).await?;

        let start_time = Instant::now();
        task.execute_status = QueueStatus::Running;
        task.max_execute_count = max_attempts;
        task.start_time = Utc::now().timestamp();

        let result = match topic {
            None => {
                warn!("任务主题 {} 未注册", task.task_topic);
                ExecutionResult::terminal_fail(UNREGISTERED_TOPIC)
            }
            Some(topic) => {
                let handler = self
                    .handlers
                    .entry(topic.topic().to_string())
                    .or_insert_with(|| topic.create_handler())
                    .clone();
                self.run_handler(handler, &task).await
            }
        }
        .promote_if_exhausted(&task);

        let now = Utc::now().timestamp();
        let status = result.outcome().queue_status();
        self.repository
            .close_queue_task(queue_id, now, status, result.result())
            .await?;
        self.repository
            .close_queue_log(queue_id, now, result.outcome().log_status(), result.result())
            .await?;

        self.metrics
            .record_outcome(result.outcome(), start_time.elapsed());
        info!(
            "队列任务 {} 第{}次执行结束: {:?}",
            queue_id,
            task.execute_count + 1,
            result.outcome()
        );
        Ok(Some(result))
    }

    /// 处理器返回错误或 panic 时按可重试失败处理，错误文本作为结果
    async fn run_handler(&self, handler: Arc<dyn TaskHandler>, task: &QueueTask) -> ExecutionResult {
        match AssertUnwindSafe(handler.execute(task)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("队列任务 {} 执行出错: {}", task.id, e);
                ExecutionResult::retry_fail(e.to_string())
            }
            Err(panic) => {
                self.metrics.record_panic();
                let message = panic_message(panic.as_ref());
                error!("队列任务 {} 处理器异常: {}", task.id, message);
                ExecutionResult::retry_fail(message)
            }
        }
    }

    pub fn cached_handlers(&self) -> usize {
        self.handlers.len()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "处理器异常退出".to_string()
    }
}
