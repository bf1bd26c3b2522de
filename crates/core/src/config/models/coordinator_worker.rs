use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub enabled: bool,
    /// 承载协调器的工作进程启动时上报的初始未完成消息数
    pub reserved_load: i64,
    /// 每秒发送一次CRON检查
    pub cron_scheduler_enabled: bool,
    /// 以下间隔为 0 时关闭对应定时器
    pub time_scheduler_interval_ms: u64,
    pub distributor_interval_ms: u64,
    pub queue_interval_ms: u64,
    pub overdue_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    /// 为本进程内的每个工作进程建立一条通道
    pub connect_local: bool,
    pub remote_endpoints: Vec<RemoteEndpoint>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reserved_load: 5,
            cron_scheduler_enabled: true,
            time_scheduler_interval_ms: 1000,
            distributor_interval_ms: 1000,
            queue_interval_ms: 1000,
            overdue_interval_ms: 30_000,
            reconnect_interval_ms: 1000,
            connect_local: true,
            remote_endpoints: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn cron_interval(&self) -> Option<Duration> {
        self.cron_scheduler_enabled.then(|| Duration::from_secs(1))
    }

    pub fn time_scheduler_interval(&self) -> Option<Duration> {
        interval(self.time_scheduler_interval_ms)
    }

    pub fn distributor_interval(&self) -> Option<Duration> {
        interval(self.distributor_interval_ms)
    }

    pub fn queue_interval(&self) -> Option<Duration> {
        interval(self.queue_interval_ms)
    }

    pub fn overdue_interval(&self) -> Option<Duration> {
        interval(self.overdue_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(1))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reserved_load < 0 {
            return Err(anyhow::anyhow!("预留负载不能为负数"));
        }

        if self.reconnect_interval_ms == 0 {
            return Err(anyhow::anyhow!("重连间隔必须大于0"));
        }

        for endpoint in &self.remote_endpoints {
            if endpoint.address.is_empty() {
                return Err(anyhow::anyhow!("远程端点地址不能为空"));
            }
            if endpoint.connections == 0 {
                return Err(anyhow::anyhow!(
                    "远程端点 {} 的连接数必须大于0",
                    endpoint.address
                ));
            }
        }

        if self.enabled && !self.connect_local && self.remote_endpoints.is_empty() {
            return Err(anyhow::anyhow!("协调器没有任何可连接的端点"));
        }

        Ok(())
    }
}

fn interval(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// 远程工作进程的共享监听端点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub address: String,
    /// 对该端点建立的通道数，通常等于对端进程内的工作进程数
    #[serde(default = "default_connections")]
    pub connections: usize,
}

fn default_connections() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 本进程内运行的工作进程数
    pub count: usize,
    /// 第一个工作进程的 ID，其余依次递增
    pub first_worker_id: u32,
    /// 共享监听地址，供其他进程的协调器连接
    pub listen_address: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 1,
            first_worker_id: 0,
            listen_address: None,
        }
    }
}

impl WorkerConfig {
    pub fn worker_ids(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.count as u32).map(move |offset| self.first_worker_id + offset)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.count == 0 {
            return Err(anyhow::anyhow!("工作进程数必须大于0"));
        }

        if let Some(address) = &self.listen_address {
            if address.is_empty() {
                return Err(anyhow::anyhow!("监听地址不能为空"));
            }
        }

        Ok(())
    }
}

/// 任务主题注册项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTopicConfig {
    pub topic: String,
    /// 内置处理器名称
    pub handler: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
}

fn default_max_concurrency() -> i64 {
    crate::task_registry::DEFAULT_MAX_CONCURRENCY
}

fn default_max_attempts() -> i64 {
    crate::task_registry::DEFAULT_MAX_ATTEMPTS
}

impl TaskTopicConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.topic.is_empty() {
            return Err(anyhow::anyhow!("任务主题不能为空"));
        }

        if self.handler.is_empty() {
            return Err(anyhow::anyhow!("任务主题 {} 未指定处理器", self.topic));
        }

        if self.max_concurrency <= 0 {
            return Err(anyhow::anyhow!(
                "任务主题 {} 的最大并发数必须大于0",
                self.topic
            ));
        }

        if self.max_attempts <= 0 {
            return Err(anyhow::anyhow!(
                "任务主题 {} 的最大执行次数必须大于0",
                self.topic
            ));
        }

        Ok(())
    }
}

pub(crate) fn validate_unique_topics(topics: &[TaskTopicConfig]) -> anyhow::Result<()> {
    let mut seen = HashSet::new();
    for topic in topics {
        topic.validate()?;
        if !seen.insert(topic.topic.as_str()) {
            return Err(anyhow::anyhow!("任务主题重复: {}", topic.topic));
        }
    }
    Ok(())
}
