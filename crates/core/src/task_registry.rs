use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::traits::{HandlerFactory, TaskHandler};

pub const DEFAULT_MAX_CONCURRENCY: i64 = 5;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

/// 一个任务主题的注册信息
#[derive(Clone)]
pub struct TaskTopic {
    topic: String,
    max_concurrency: i64,
    max_attempts: i64,
    factory: HandlerFactory,
}

impl TaskTopic {
    pub fn new<F>(topic: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn TaskHandler> + Send + Sync + 'static,
    {
        Self {
            topic: topic.into(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            factory: Arc::new(factory),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: i64) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn max_concurrency(&self) -> i64 {
        self.max_concurrency
    }

    pub fn max_attempts(&self) -> i64 {
        self.max_attempts
    }

    pub fn create_handler(&self) -> Arc<dyn TaskHandler> {
        (self.factory)()
    }
}

impl fmt::Debug for TaskTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTopic")
            .field("topic", &self.topic)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// 任务主题注册表，启动时构建，之后只读
#[derive(Debug, Clone, Default)]
pub struct TaskTopicRegistry {
    topics: HashMap<String, TaskTopic>,
}

impl TaskTopicRegistry {
    pub fn builder() -> TaskTopicRegistryBuilder {
        TaskTopicRegistryBuilder::default()
    }

    pub fn get(&self, topic: &str) -> Option<&TaskTopic> {
        self.topics.get(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// 主题的实际并发上限: min(主题声明值, 全局单主题上限)，未注册时取全局上限
    pub fn effective_max_concurrency(&self, topic: &str, ceiling: i64) -> i64 {
        self.topics
            .get(topic)
            .map(|t| t.max_concurrency.min(ceiling))
            .unwrap_or(ceiling)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TaskTopicRegistryBuilder {
    topics: HashMap<String, TaskTopic>,
}

impl TaskTopicRegistryBuilder {
    /// 注册主题，同名主题后注册者覆盖先注册者
    pub fn register(mut self, topic: TaskTopic) -> Self {
        self.topics.insert(topic.topic.clone(), topic);
        self
    }

    pub fn build(self) -> TaskTopicRegistry {
        TaskTopicRegistry {
            topics: self.topics,
        }
    }
}
