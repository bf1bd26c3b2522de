use serde::{Deserialize, Serialize};

/// 队列并发与重试策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 全局在途任务上限（所有主题之和）
    pub task_concurrency: i64,
    /// 单个主题的全局在途上限
    pub topic_concurrency: i64,
    /// 可重试失败后再次执行前的等待秒数
    pub retry_interval_seconds: i64,
    /// 运行中任务超过该秒数且不在任何工作进程上时视为孤儿任务
    pub timeout_seconds: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            task_concurrency: 50,
            topic_concurrency: 10,
            retry_interval_seconds: 10,
            timeout_seconds: 60,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.task_concurrency <= 0 {
            return Err(anyhow::anyhow!("全局任务并发数必须大于0"));
        }

        if self.topic_concurrency <= 0 {
            return Err(anyhow::anyhow!("主题任务并发数必须大于0"));
        }

        if self.retry_interval_seconds < 0 {
            return Err(anyhow::anyhow!("重试间隔不能为负数"));
        }

        if self.timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("任务超时时间必须大于0"));
        }

        Ok(())
    }
}
