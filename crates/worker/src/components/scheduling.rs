//! 触发器扫描、分发展开、队列扫描与超时清理
//!
//! 所有时间判断都以协调器消息携带的时间为准。

use std::sync::Arc;

use chrono::{Local, TimeZone};
use taskq_core::models::{
    Distributor, DistributorStatus, NewDistributor, QueueSchedulerRequest, QueueTask,
};
use taskq_core::traits::QueueRepository;
use taskq_core::{CronEvaluator, SchedulerError, SchedulerResult};
use tracing::{debug, info, instrument, warn};

use crate::metrics::WorkerMetrics;

/// 分发记录展开的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributionOutcome {
    /// 展开成功，值为生成的队列任务数
    Expanded(u64),
    Failed(String),
    /// 已被其他进程认领
    Skipped,
}

pub struct SchedulingManager {
    repository: Arc<dyn QueueRepository>,
    metrics: Arc<WorkerMetrics>,
}

impl SchedulingManager {
    pub fn new(repository: Arc<dyn QueueRepository>, metrics: Arc<WorkerMetrics>) -> Self {
        Self {
            repository,
            metrics,
        }
    }

    /// 为在 `time` 这一秒到期的CRON触发器各生成一条分发记录
    #[instrument(skip(self))]
    pub async fn cron_scheduler(&self, time: i64) -> SchedulerResult<u64> {
        let instant = Local
            .timestamp_opt(time, 0)
            .single()
            .ok_or_else(|| SchedulerError::Internal(format!("无效的时间戳: {time}")))?;

        let due: Vec<NewDistributor> = self
            .repository
            .list_due_cron_schedulers()
            .await?
            .iter()
            .filter(|scheduler| CronEvaluator::is_due(&scheduler.scheduler_rule, &instant))
            .map(NewDistributor::from)
            .collect();

        self.insert_distributors(&due).await
    }

    /// 为到期的固定时间触发器生成分发记录，每个触发器只生效一次
    #[instrument(skip(self))]
    pub async fn time_scheduler(&self, time: i64) -> SchedulerResult<u64> {
        let mut due = Vec::new();
        for scheduler in self.repository.list_due_fixed_schedulers(time).await? {
            // 停用失败说明其他进程已经处理
            if self.repository.disable_scheduler(scheduler.id).await? == 1 {
                due.push(NewDistributor::from(&scheduler));
            }
        }

        self.insert_distributors(&due).await
    }

    async fn insert_distributors(&self, rows: &[NewDistributor]) -> SchedulerResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let inserted = self.repository.bulk_insert_distributors(rows).await?;
        self.metrics.record_distributors(inserted);
        info!("生成分发记录 {} 条", inserted);
        Ok(inserted)
    }

    /// 展开所有待处理的分发记录
    pub async fn task_distributor(&self) -> SchedulerResult<Vec<(i64, DistributionOutcome)>> {
        let distributors = self.repository.list_pending_distributors().await?;
        let mut outcomes = Vec::with_capacity(distributors.len());
        for distributor in distributors {
            let outcome = self.distribute(&distributor).await?;
            outcomes.push((distributor.id, outcome));
        }
        Ok(outcomes)
    }

    #[instrument(skip(self, distributor), fields(distributor_id = distributor.id, topic = %distributor.task_topic))]
    async fn distribute(&self, distributor: &Distributor) -> SchedulerResult<DistributionOutcome> {
        let payloads = match distributor.expand_payload() {
            Ok(payloads) => payloads,
            Err(e) => {
                let message = e.to_string();
                if self.repository.claim_distributor(distributor.id, 0).await? != 1 {
                    return Ok(DistributionOutcome::Skipped);
                }
                warn!("分发记录 {} 载荷无效: {}", distributor.id, message);
                self.repository
                    .close_distributor(distributor.id, DistributorStatus::Failed, &message)
                    .await?;
                return Ok(DistributionOutcome::Failed(message));
            }
        };

        let task_count = payloads.len() as i64;
        if self
            .repository
            .claim_distributor(distributor.id, task_count)
            .await?
            != 1
        {
            debug!("分发记录 {} 已被认领", distributor.id);
            return Ok(DistributionOutcome::Skipped);
        }

        match self
            .repository
            .bulk_insert_queue_tasks(distributor.id, &payloads, &distributor.task_topic)
            .await
        {
            Ok(inserted) => {
                self.metrics.record_queue_tasks(inserted);
                self.repository
                    .close_distributor(distributor.id, DistributorStatus::Succeeded, "")
                    .await?;
                info!("分发记录 {} 展开为 {} 个队列任务", distributor.id, inserted);
                Ok(DistributionOutcome::Expanded(inserted))
            }
            Err(e) => {
                let message = e.to_string();
                warn!("分发记录 {} 展开失败: {}", distributor.id, message);
                self.repository
                    .close_distributor(distributor.id, DistributorStatus::Failed, &message)
                    .await?;
                Ok(DistributionOutcome::Failed(message))
            }
        }
    }

    /// 查询可执行的队列任务，`select_count` 不为正时不查询
    pub async fn queue_scheduler(
        &self,
        request: &QueueSchedulerRequest,
        time: i64,
    ) -> SchedulerResult<Vec<QueueTask>> {
        if request.select_count <= 0 {
            return Ok(Vec::new());
        }
        self.repository
            .list_runnable_queue(time, &request.exclude_topic, request.select_count)
            .await
    }

    /// 结束不在任何工作进程上的超时任务
    ///
    /// `live_ids` 为协调器认为仍在执行的任务，返回结束的任务数。
    #[instrument(skip(self, live_ids), fields(live = live_ids.len()))]
    pub async fn overdue_tasks(&self, live_ids: &[i64], time: i64) -> SchedulerResult<u64> {
        let mut closed = 0;
        for retryable in [true, false] {
            let ids = self
                .repository
                .list_orphaned_queue_ids(live_ids, time, retryable)
                .await?;
            if ids.is_empty() {
                continue;
            }
            warn!("结束超时任务 {:?}，可重试: {}", ids, retryable);
            closed += self.repository.close_queue_tasks(&ids, time, retryable).await?;
            self.repository.close_queue_logs(&ids, time, retryable).await?;
        }
        self.metrics.record_overdue(closed);
        Ok(closed)
    }
}
