use serde::{Deserialize, Serialize};

text_status! {
    /// 触发器类型
    pub enum SchedulerKind {
        /// CRON 表达式周期触发
        Cron => "CRON",
        /// 固定时间点（epoch 秒）一次性触发
        FixedTime => "FIXED_TIME",
    }
}

text_status! {
    /// 触发器状态，`Disabled` 为终态
    pub enum SchedulerStatus {
        Active => "ACTIVE",
        Disabled => "DISABLED",
    }
}

/// 触发器定义
///
/// 每次触发生成一个 [`Distributor`](super::Distributor)。固定时间触发器在触发瞬间
/// 通过一次条件更新被禁用，因此不会重复触发。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scheduler {
    pub id: i64,
    pub task_topic: String,
    /// 任务数据模板（JSON 数组，每个元素对应一个队列任务）
    pub task_data: String,
    pub scheduler_kind: SchedulerKind,
    /// CRON 表达式或 epoch 秒
    pub scheduler_rule: String,
    pub scheduler_status: SchedulerStatus,
    pub create_time: i64,
}

impl Scheduler {
    pub fn is_active(&self) -> bool {
        self.scheduler_status == SchedulerStatus::Active
    }

    /// 固定时间触发器的触发时间点，规则无法解析时返回 None
    pub fn fire_time(&self) -> Option<i64> {
        match self.scheduler_kind {
            SchedulerKind::FixedTime => self.scheduler_rule.trim().parse().ok(),
            SchedulerKind::Cron => None,
        }
    }
}

/// 待插入的分发记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDistributor {
    pub scheduler_id: i64,
    pub task_topic: String,
    pub task_data: String,
}

impl From<&Scheduler> for NewDistributor {
    fn from(scheduler: &Scheduler) -> Self {
        Self {
            scheduler_id: scheduler.id,
            task_topic: scheduler.task_topic.clone(),
            task_data: scheduler.task_data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(rule: &str) -> Scheduler {
        Scheduler {
            id: 7,
            task_topic: "demo".to_string(),
            task_data: "[]".to_string(),
            scheduler_kind: SchedulerKind::FixedTime,
            scheduler_rule: rule.to_string(),
            scheduler_status: SchedulerStatus::Active,
            create_time: 0,
        }
    }

    #[test]
    fn test_fire_time() {
        assert_eq!(fixed("100").fire_time(), Some(100));
        assert_eq!(fixed(" 100 ").fire_time(), Some(100));
        assert_eq!(fixed("soon").fire_time(), None);

        let mut cron = fixed("0 * * * * ?");
        cron.scheduler_kind = SchedulerKind::Cron;
        assert_eq!(cron.fire_time(), None);
    }

    #[test]
    fn test_status_text_roundtrip() {
        assert_eq!(SchedulerKind::FixedTime.as_str(), "FIXED_TIME");
        assert_eq!("CRON".parse::<SchedulerKind>().unwrap(), SchedulerKind::Cron);
        assert!("cron".parse::<SchedulerKind>().is_err());
        assert_eq!(
            serde_json::to_string(&SchedulerStatus::Disabled).unwrap(),
            "\"DISABLED\""
        );
    }

    #[test]
    fn test_new_distributor_from_scheduler() {
        let distributor = NewDistributor::from(&fixed("100"));
        assert_eq!(distributor.scheduler_id, 7);
        assert_eq!(distributor.task_topic, "demo");
        assert_eq!(distributor.task_data, "[]");
    }
}
