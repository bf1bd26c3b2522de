//! 按任务主题的准入控制
//!
//! 记录全集群每个主题的在途任务数。主题达到上限后进入排除集合，
//! 直到计数回落到上限以下才移出。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use taskq_core::TaskTopicRegistry;
use tracing::debug;

pub struct TopicAdmission {
    registry: Arc<TaskTopicRegistry>,
    /// 全局单主题并发上限
    topic_ceiling: i64,
    /// 全局在途任务上限（所有主题之和）
    task_ceiling: i64,
    counts: HashMap<String, i64>,
    saturated: BTreeSet<String>,
}

impl TopicAdmission {
    pub fn new(registry: Arc<TaskTopicRegistry>, task_ceiling: i64, topic_ceiling: i64) -> Self {
        Self {
            registry,
            topic_ceiling,
            task_ceiling,
            counts: HashMap::new(),
            saturated: BTreeSet::new(),
        }
    }

    pub fn registry(&self) -> &TaskTopicRegistry {
        &self.registry
    }

    pub fn effective_max(&self, topic: &str) -> i64 {
        self.registry
            .effective_max_concurrency(topic, self.topic_ceiling)
    }

    pub fn in_flight(&self, topic: &str) -> i64 {
        self.counts.get(topic).copied().unwrap_or(0)
    }

    pub fn total_in_flight(&self) -> i64 {
        self.counts.values().sum()
    }

    pub fn is_saturated(&self, topic: &str) -> bool {
        self.saturated.contains(topic)
    }

    pub fn excluded_topics(&self) -> Vec<String> {
        self.saturated.iter().cloned().collect()
    }

    /// 全局剩余容量，已满时为 None
    pub fn headroom(&self) -> Option<i64> {
        let total = self.total_in_flight();
        (self.task_ceiling > total).then(|| self.task_ceiling - total)
    }

    /// 判断主题是否还能再接收一个任务，已满时标记为饱和
    pub fn can_admit(&mut self, topic: &str) -> bool {
        if self.in_flight(topic) >= self.effective_max(topic) {
            self.refresh(topic);
            return false;
        }
        true
    }

    /// 发送确认后记录一个在途任务
    pub fn admit(&mut self, topic: &str) {
        self.add(topic, 1);
    }

    /// 握手时并入工作进程上报的在途数
    pub fn add(&mut self, topic: &str, count: i64) {
        *self.counts.entry(topic.to_string()).or_insert(0) += count;
        self.refresh(topic);
    }

    pub fn release(&mut self, topic: &str, count: i64) {
        if let Some(current) = self.counts.get_mut(topic) {
            *current = (*current - count).max(0);
        }
        self.refresh(topic);
    }

    fn refresh(&mut self, topic: &str) {
        let max = self.effective_max(topic);
        if self.in_flight(topic) < max {
            if self.saturated.remove(topic) {
                debug!("任务主题 {} 恢复可调度", topic);
            }
        } else if self.saturated.insert(topic.to_string()) {
            debug!("任务主题 {} 达到最大并发数 {}", topic, max);
            metrics::counter!("taskq_topic_saturations_total").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use taskq_core::models::{ExecutionResult, QueueTask};
    use taskq_core::traits::TaskHandler;
    use taskq_core::{SchedulerResult, TaskTopic};

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        async fn execute(&self, _task: &QueueTask) -> SchedulerResult<ExecutionResult> {
            Ok(ExecutionResult::success(""))
        }
    }

    fn admission() -> TopicAdmission {
        let registry = TaskTopicRegistry::builder()
            .register(TaskTopic::new("demo", || Arc::new(Noop)).with_max_concurrency(2))
            .register(TaskTopic::new("bulk", || Arc::new(Noop)).with_max_concurrency(99))
            .build();
        TopicAdmission::new(Arc::new(registry), 10, 3)
    }

    #[test]
    fn test_effective_max_is_capped_by_ceiling() {
        let admission = admission();
        assert_eq!(admission.effective_max("demo"), 2);
        assert_eq!(admission.effective_max("bulk"), 3);
        assert_eq!(admission.effective_max("unknown"), 3);
    }

    #[test]
    fn test_saturation_enters_and_leaves() {
        let mut admission = admission();
        assert!(admission.can_admit("demo"));
        admission.admit("demo");
        assert!(!admission.is_saturated("demo"));
        admission.admit("demo");
        assert!(admission.is_saturated("demo"));
        assert!(!admission.can_admit("demo"));
        assert_eq!(admission.excluded_topics(), vec!["demo".to_string()]);

        admission.release("demo", 1);
        assert!(!admission.is_saturated("demo"));
        assert!(admission.can_admit("demo"));
    }

    #[test]
    fn test_headroom_and_release_floor() {
        let mut admission = admission();
        admission.add("bulk", 3);
        admission.add("other", 3);
        assert_eq!(admission.headroom(), Some(4));
        admission.add("third", 4);
        assert_eq!(admission.headroom(), None);

        admission.release("bulk", 10);
        assert_eq!(admission.in_flight("bulk"), 0);
        assert_eq!(admission.headroom(), Some(3));
    }
}
