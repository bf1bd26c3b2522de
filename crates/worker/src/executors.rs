//! 内置任务处理器
//!
//! 配置文件中的任务主题通过处理器名称引用这里的实现。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taskq_core::config::models::TaskTopicConfig;
use taskq_core::models::{ExecutionResult, QueueTask};
use taskq_core::traits::TaskHandler;
use taskq_core::{SchedulerError, SchedulerResult, TaskTopic, TaskTopicRegistry};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{info, warn};

pub const SHELL_HANDLER: &str = "shell";
pub const LOG_HANDLER: &str = "log";

/// Shell任务参数，即队列任务的载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// 超时秒数，超时按可重试失败处理
    pub timeout_seconds: Option<u64>,
}

/// Shell任务处理器
///
/// 退出码为0时成功，结果为标准输出；否则可重试失败，结果为标准错误。
#[derive(Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, task: &QueueTask, params: ShellTaskParams) -> SchedulerResult<ExecutionResult> {
        let start_time = Instant::now();
        info!(
            "执行Shell任务: queue_id={}, command={}, args={:?}",
            task.id, params.command, params.args
        );

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref dir) = params.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &params.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SchedulerError::TaskExecution(format!("启动Shell命令失败: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchedulerError::TaskExecution("无法获取stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SchedulerError::TaskExecution("无法获取stderr".to_string()))?;

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let completion = async {
            let stdout_task = drain_pipe(stdout, &mut stdout_buf, task.id);
            let stderr_task = drain_pipe(stderr, &mut stderr_buf, task.id);

            tokio::join!(stdout_task, stderr_task);
            child.wait().await
        };

        let exit_status = match params.timeout_seconds {
            Some(seconds) => match tokio::time::timeout(Duration::from_secs(seconds), completion).await {
                Ok(status) => status,
                Err(_) => {
                    warn!("Shell任务超时: queue_id={}, timeout={}s", task.id, seconds);
                    return Ok(ExecutionResult::retry_fail(format!(
                        "命令执行超时: {seconds}秒"
                    )));
                }
            },
            None => completion.await,
        }
        .map_err(|e| SchedulerError::TaskExecution(format!("等待进程结束失败: {e}")))?;

        let exit_code = exit_status.code();
        info!(
            "Shell任务执行完成: queue_id={}, success={}, exit_code={:?}, duration={}ms",
            task.id,
            exit_status.success(),
            exit_code,
            start_time.elapsed().as_millis()
        );

        let stdout = decode_output(&stdout_buf);
        let stderr = decode_output(&stderr_buf);
        if exit_status.success() {
            Ok(ExecutionResult::success(stdout))
        } else if !stderr.is_empty() {
            Ok(ExecutionResult::retry_fail(stderr))
        } else {
            Ok(ExecutionResult::retry_fail(format!(
                "命令执行失败，退出码: {exit_code:?}"
            )))
        }
    }
}

/// 读完管道中的全部字节，输出不是合法 UTF-8 时也不会提前停止
async fn drain_pipe<R: AsyncRead + Unpin>(mut pipe: R, buf: &mut Vec<u8>, queue_id: i64) {
    if let Err(e) = pipe.read_to_end(buf).await {
        warn!("读取Shell输出失败: queue_id={}, error={}", queue_id, e);
    }
}

fn decode_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

#[async_trait]
impl TaskHandler for ShellExecutor {
    async fn execute(&self, task: &QueueTask) -> SchedulerResult<ExecutionResult> {
        let params: ShellTaskParams = match serde_json::from_str(&task.task_data) {
            Ok(params) => params,
            Err(e) => {
                warn!("Shell任务参数无效: queue_id={}, error={}", task.id, e);
                return Ok(ExecutionResult::terminal_fail(format!(
                    "解析Shell任务参数失败: {e}"
                )));
            }
        };
        self.run(task, params).await
    }
}

/// 只记录载荷的处理器
#[derive(Debug, Default)]
pub struct LogExecutor;

#[async_trait]
impl TaskHandler for LogExecutor {
    async fn execute(&self, task: &QueueTask) -> SchedulerResult<ExecutionResult> {
        info!(
            "任务 {} (主题 {}) 第{}次执行，载荷: {}",
            task.id,
            task.task_topic,
            task.execute_count + 1,
            task.payload()
        );
        Ok(ExecutionResult::success(task.task_data.clone()))
    }
}

fn shell_handler() -> Arc<dyn TaskHandler> {
    Arc::new(ShellExecutor::new())
}

fn log_handler() -> Arc<dyn TaskHandler> {
    Arc::new(LogExecutor)
}

fn handler_factory(name: &str) -> Option<fn() -> Arc<dyn TaskHandler>> {
    match name {
        SHELL_HANDLER => Some(shell_handler),
        LOG_HANDLER => Some(log_handler),
        _ => None,
    }
}

/// 按配置构建任务主题注册表
pub fn build_registry(topics: &[TaskTopicConfig]) -> SchedulerResult<TaskTopicRegistry> {
    let mut builder = TaskTopicRegistry::builder();
    for config in topics {
        let factory = handler_factory(&config.handler).ok_or_else(|| {
            SchedulerError::Configuration(format!(
                "任务主题 {} 引用了未知的处理器: {}",
                config.topic, config.handler
            ))
        })?;
        builder = builder.register(
            TaskTopic::new(config.topic.clone(), factory)
                .with_max_concurrency(config.max_concurrency)
                .with_max_attempts(config.max_attempts),
        );
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskq_core::models::{QueueStatus, TaskOutcome};

    fn task(task_data: &str) -> QueueTask {
        QueueTask {
            id: 7,
            distributor_id: 1,
            task_topic: "demo".to_string(),
            task_data: task_data.to_string(),
            execute_status: QueueStatus::Running,
            execute_result: String::new(),
            execute_count: 0,
            max_execute_count: 3,
            next_execute_time: 0,
            create_time: 0,
            start_time: 0,
            end_time: 0,
        }
    }

    #[test]
    fn test_build_registry() {
        let topics = vec![
            TaskTopicConfig {
                topic: "mail".to_string(),
                handler: "log".to_string(),
                max_concurrency: 2,
                max_attempts: 4,
            },
            TaskTopicConfig {
                topic: "cleanup".to_string(),
                handler: "shell".to_string(),
                max_concurrency: 1,
                max_attempts: 1,
            },
        ];

        let registry = build_registry(&topics).unwrap();
        assert_eq!(registry.len(), 2);
        let mail = registry.get("mail").unwrap();
        assert_eq!(mail.max_concurrency(), 2);
        assert_eq!(mail.max_attempts(), 4);
    }

    #[test]
    fn test_build_registry_rejects_unknown_handler() {
        let topics = vec![TaskTopicConfig {
            topic: "mail".to_string(),
            handler: "smtp".to_string(),
            max_concurrency: 2,
            max_attempts: 4,
        }];

        match build_registry(&topics) {
            Err(SchedulerError::Configuration(message)) => assert!(message.contains("smtp")),
            other => panic!("Expected configuration error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_log_executor_echoes_payload() {
        let result = LogExecutor.execute(&task(r#"{"x":1}"#)).await.unwrap();
        assert_eq!(result.outcome(), TaskOutcome::Success);
        assert_eq!(result.result(), r#"{"x":1}"#);
    }

    #[tokio::test]
    async fn test_shell_executor_invalid_params_is_terminal() {
        let result = ShellExecutor::new().execute(&task("[]")).await.unwrap();
        assert_eq!(result.outcome(), TaskOutcome::TerminalFail);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_success_and_failure() {
        let executor = ShellExecutor::new();

        let result = executor
            .execute(&task(r#"{"command":"echo","args":["hello"]}"#))
            .await
            .unwrap();
        assert_eq!(result.outcome(), TaskOutcome::Success);
        assert_eq!(result.result(), "hello");

        let result = executor
            .execute(&task(r#"{"command":"sh","args":["-c","echo boom >&2; exit 3"]}"#))
            .await
            .unwrap();
        assert_eq!(result.outcome(), TaskOutcome::RetryFail);
        assert_eq!(result.result(), "boom");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_drains_non_utf8_output() {
        // 一个非法字节后跟超过管道缓冲区的输出
        let script = r"printf '\377\n'; head -c 200000 /dev/zero | tr '\0' a; exit 0";
        let params = serde_json::json!({
            "command": "sh",
            "args": ["-c", script],
            "timeout_seconds": 10,
        });
        let result = ShellExecutor::new()
            .execute(&task(&params.to_string()))
            .await
            .unwrap();
        assert_eq!(result.outcome(), TaskOutcome::Success);
        assert!(result.result().starts_with('\u{FFFD}'));
        assert_eq!(result.result().matches('a').count(), 200_000);
    }

    #[tokio::test]
    async fn test_shell_executor_missing_command_is_error() {
        let result = ShellExecutor::new()
            .execute(&task(r#"{"command":"/nonexistent/taskq-command"}"#))
            .await;
        assert!(matches!(result, Err(SchedulerError::TaskExecution(_))));
    }
}
