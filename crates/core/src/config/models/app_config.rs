use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    coordinator_worker::{validate_unique_topics, CoordinatorConfig, TaskTopicConfig, WorkerConfig},
    database::DatabaseConfig,
    observability::ObservabilityConfig,
    queue::QueueConfig,
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub coordinator: CoordinatorConfig,
    pub worker: WorkerConfig,
    pub task_topics: Vec<TaskTopicConfig>,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: TASKQ_, nested keys joined by `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        // 1. Load config file if provided
        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/taskq.toml", "taskq.toml", "/etc/taskq/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        // 2. Environment variable overrides - highest priority
        builder = builder.add_source(
            Environment::with_prefix("TASKQ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.queue.validate().context("队列配置验证失败")?;
        self.coordinator.validate().context("协调器配置验证失败")?;
        self.worker.validate().context("工作进程配置验证失败")?;
        validate_unique_topics(&self.task_topics).context("任务主题配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.task_concurrency, 50);
        assert_eq!(config.queue.topic_concurrency, 10);
        assert_eq!(config.queue.retry_interval_seconds, 10);
        assert_eq!(config.queue.timeout_seconds, 60);
        assert_eq!(config.coordinator.reserved_load, 5);
        assert_eq!(
            config.coordinator.overdue_interval(),
            Some(std::time::Duration::from_secs(30))
        );
    }

    #[test]
    fn test_from_toml_with_topics() {
        let config = AppConfig::from_toml(
            r#"
            [queue]
            task_concurrency = 20

            [coordinator]
            queue_interval_ms = 0

            [[coordinator.remote_endpoints]]
            address = "10.0.0.2:9889"
            connections = 4

            [[task_topics]]
            topic = "backup"
            handler = "shell"
            max_concurrency = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.task_concurrency, 20);
        assert_eq!(config.queue.topic_concurrency, 10);
        assert_eq!(config.coordinator.queue_interval(), None);
        assert_eq!(config.coordinator.remote_endpoints[0].connections, 4);
        assert_eq!(config.task_topics[0].max_concurrency, 2);
        assert_eq!(config.task_topics[0].max_attempts, 5);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(AppConfig::from_toml("[queue]\ntask_concurrency = 0").is_err());
        assert!(AppConfig::from_toml("[database]\nurl = \"postgres://db\"").is_err());
        assert!(AppConfig::from_toml("[worker]\ncount = 0").is_err());
        assert!(AppConfig::from_toml(
            "[coordinator]\nconnect_local = false\nremote_endpoints = []"
        )
        .is_err());
        assert!(AppConfig::from_toml(
            r#"
            [[task_topics]]
            topic = "a"
            handler = "log"
            [[task_topics]]
            topic = "a"
            handler = "shell"
            "#
        )
        .is_err());
    }

    #[test]
    fn test_load_from_file_and_roundtrip() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[worker]\ncount = 3\nfirst_worker_id = 10").unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.worker.count, 3);
        assert_eq!(config.worker.worker_ids().collect::<Vec<_>>(), vec![10, 11, 12]);

        let rendered = config.to_toml().unwrap();
        let reparsed = AppConfig::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.worker.count, 3);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/taskq.toml")).is_err());
    }
}
