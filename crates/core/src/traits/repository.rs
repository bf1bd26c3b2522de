//! 持久化网关接口
//!
//! 四张逻辑表（触发器、分发记录、队列任务、执行日志）上的查询与条件更新。
//! 所有修改操作返回实际影响的行数，调用方以此判断认领是否成功：
//! 返回 0 表示记录已被其他进程认领，不是错误。

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    models::{
        Distributor, DistributorStatus, NewDistributor, QueueLogStatus, QueueStatus, QueueTask,
        Scheduler,
    },
    SchedulerResult,
};

#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// 所有启用中的CRON触发器
    async fn list_due_cron_schedulers(&self) -> SchedulerResult<Vec<Scheduler>>;

    /// 启用中且触发时间不晚于 `now` 的固定时间触发器
    async fn list_due_fixed_schedulers(&self, now: i64) -> SchedulerResult<Vec<Scheduler>>;

    async fn list_pending_distributors(&self) -> SchedulerResult<Vec<Distributor>>;

    /// 可执行的队列任务，按 ID 升序，跳过 `exclude_topics` 中的主题
    async fn list_runnable_queue(
        &self,
        now: i64,
        exclude_topics: &[String],
        limit: i64,
    ) -> SchedulerResult<Vec<QueueTask>>;

    /// 仍处于运行状态、不在 `live_ids` 中且已超时的队列任务
    ///
    /// `retryable` 为 true 时返回还有重试机会的任务，否则返回已用尽的任务。
    async fn list_orphaned_queue_ids(
        &self,
        live_ids: &[i64],
        now: i64,
        retryable: bool,
    ) -> SchedulerResult<Vec<i64>>;

    /// 仅返回待执行状态的队列任务
    async fn get_queue_task(&self, id: i64) -> SchedulerResult<Option<QueueTask>>;

    async fn disable_scheduler(&self, id: i64) -> SchedulerResult<u64>;

    async fn claim_distributor(&self, id: i64, task_count: i64) -> SchedulerResult<u64>;

    async fn claim_queue_task(&self, id: i64, max_attempts: i64) -> SchedulerResult<u64>;

    /// 为一次尝试打开执行日志，返回日志 ID
    async fn open_queue_log(&self, queue_id: i64) -> SchedulerResult<i64>;

    async fn close_distributor(
        &self,
        id: i64,
        status: DistributorStatus,
        result: &str,
    ) -> SchedulerResult<u64>;

    /// 批量结束超时任务：可重试的回到待执行，否则终止
    async fn close_queue_tasks(
        &self,
        ids: &[i64],
        now: i64,
        retryable: bool,
    ) -> SchedulerResult<u64>;

    async fn close_queue_logs(
        &self,
        ids: &[i64],
        now: i64,
        retryable: bool,
    ) -> SchedulerResult<u64>;

    /// 结束一次尝试，状态为 `Pending` 时设置下次执行时间
    async fn close_queue_task(
        &self,
        id: i64,
        now: i64,
        status: QueueStatus,
        result: &str,
    ) -> SchedulerResult<u64>;

    async fn close_queue_log(
        &self,
        queue_id: i64,
        now: i64,
        status: QueueLogStatus,
        result: &str,
    ) -> SchedulerResult<u64>;

    async fn bulk_insert_distributors(&self, rows: &[NewDistributor]) -> SchedulerResult<u64>;

    async fn bulk_insert_queue_tasks(
        &self,
        distributor_id: i64,
        payloads: &[Value],
        topic: &str,
    ) -> SchedulerResult<u64>;
}
