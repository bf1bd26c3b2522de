use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use taskq_core::{
    config::models::QueueConfig,
    models::{
        Distributor, DistributorStatus, NewDistributor, QueueLog, QueueLogStatus, QueueStatus,
        QueueTask, Scheduler, SchedulerKind, SchedulerStatus,
    },
    traits::QueueRepository,
    SchedulerResult,
};
use tracing::{debug, instrument};

/// 单条 INSERT 语句最多插入的行数
const INSERT_CHUNK_SIZE: usize = 500;

const OVERDUE_RETRY_RESULT: &str = "异常终止，等待重试";
const OVERDUE_FINAL_RESULT: &str = "异常终止，不可重试";

const SCHEDULER_COLUMNS: &str =
    "id, task_topic, task_data, scheduler_kind, scheduler_rule, scheduler_status, create_time";
const DISTRIBUTOR_COLUMNS: &str = "id, scheduler_id, task_topic, task_data, task_count, \
     execute_status, execute_result, create_time, start_time, end_time";
const QUEUE_COLUMNS: &str = "id, distributor_id, task_topic, task_data, execute_status, \
     execute_result, execute_count, max_execute_count, next_execute_time, create_time, \
     start_time, end_time";

fn now() -> i64 {
    Utc::now().timestamp()
}

/// 基于 SQLite 的持久化网关
///
/// 所有状态迁移都是以当前状态为条件的单条 UPDATE，影响行数即认领结果。
pub struct SqliteQueueRepository {
    pool: SqlitePool,
    retry_interval_seconds: i64,
    timeout_seconds: i64,
}

impl SqliteQueueRepository {
    pub fn new(pool: SqlitePool, config: &QueueConfig) -> Self {
        Self {
            pool,
            retry_interval_seconds: config.retry_interval_seconds,
            timeout_seconds: config.timeout_seconds,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_scheduler(row: &SqliteRow) -> SchedulerResult<Scheduler> {
        let kind: String = row.try_get("scheduler_kind")?;
        let status: String = row.try_get("scheduler_status")?;
        Ok(Scheduler {
            id: row.try_get("id")?,
            task_topic: row.try_get("task_topic")?,
            task_data: row.try_get("task_data")?,
            scheduler_kind: kind.parse()?,
            scheduler_rule: row.try_get("scheduler_rule")?,
            scheduler_status: status.parse()?,
            create_time: row.try_get("create_time")?,
        })
    }

    fn row_to_distributor(row: &SqliteRow) -> SchedulerResult<Distributor> {
        let status: String = row.try_get("execute_status")?;
        Ok(Distributor {
            id: row.try_get("id")?,
            scheduler_id: row.try_get("scheduler_id")?,
            task_topic: row.try_get("task_topic")?,
            task_data: row.try_get("task_data")?,
            task_count: row.try_get("task_count")?,
            execute_status: status.parse()?,
            execute_result: row.try_get("execute_result")?,
            create_time: row.try_get("create_time")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
        })
    }

    fn row_to_queue_task(row: &SqliteRow) -> SchedulerResult<QueueTask> {
        let status: String = row.try_get("execute_status")?;
        Ok(QueueTask {
            id: row.try_get("id")?,
            distributor_id: row.try_get("distributor_id")?,
            task_topic: row.try_get("task_topic")?,
            task_data: row.try_get("task_data")?,
            execute_status: status.parse()?,
            execute_result: row.try_get("execute_result")?,
            execute_count: row.try_get("execute_count")?,
            max_execute_count: row.try_get("max_execute_count")?,
            next_execute_time: row.try_get("next_execute_time")?,
            create_time: row.try_get("create_time")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
        })
    }

    fn row_to_queue_log(row: &SqliteRow) -> SchedulerResult<QueueLog> {
        let status: String = row.try_get("execute_status")?;
        Ok(QueueLog {
            id: row.try_get("id")?,
            queue_id: row.try_get("queue_id")?,
            execute_status: status.parse()?,
            execute_result: row.try_get("execute_result")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
        })
    }

    /// 新建触发器
    pub async fn create_scheduler(
        &self,
        task_topic: &str,
        task_data: &str,
        kind: SchedulerKind,
        rule: &str,
    ) -> SchedulerResult<i64> {
        let result = sqlx::query(
            "INSERT INTO task_schedulers (task_topic, task_data, scheduler_kind, scheduler_rule, scheduler_status, create_time)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(task_topic)
        .bind(task_data)
        .bind(kind.as_str())
        .bind(rule)
        .bind(SchedulerStatus::Active.as_str())
        .bind(now())
        .execute(&self.pool)
        .await?;

        debug!("创建触发器成功: ID {}", result.last_insert_rowid());
        Ok(result.last_insert_rowid())
    }

    pub async fn get_scheduler(&self, id: i64) -> SchedulerResult<Option<Scheduler>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULER_COLUMNS} FROM task_schedulers WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_scheduler).transpose()
    }

    pub async fn list_distributors(&self) -> SchedulerResult<Vec<Distributor>> {
        let rows = sqlx::query(&format!(
            "SELECT {DISTRIBUTOR_COLUMNS} FROM task_distributors ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_distributor).collect()
    }

    /// 按 ID 查询队列任务，不限状态
    pub async fn find_queue_task(&self, id: i64) -> SchedulerResult<Option<QueueTask>> {
        let row = sqlx::query(&format!("SELECT {QUEUE_COLUMNS} FROM task_queues WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_queue_task).transpose()
    }

    pub async fn list_queue_tasks(&self, distributor_id: i64) -> SchedulerResult<Vec<QueueTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM task_queues WHERE distributor_id = ? ORDER BY id ASC"
        ))
        .bind(distributor_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_queue_task).collect()
    }

    pub async fn list_queue_logs(&self, queue_id: i64) -> SchedulerResult<Vec<QueueLog>> {
        let rows = sqlx::query(
            "SELECT id, queue_id, execute_status, execute_result, start_time, end_time
             FROM task_queue_logs WHERE queue_id = ? ORDER BY id ASC",
        )
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_queue_log).collect()
    }

    fn overdue_outcome(&self, now: i64, retryable: bool) -> (QueueStatus, QueueLogStatus, &'static str, i64) {
        if retryable {
            (
                QueueStatus::Pending,
                QueueLogStatus::RetryFailed,
                OVERDUE_RETRY_RESULT,
                now + self.retry_interval_seconds,
            )
        } else {
            (
                QueueStatus::TerminalFailed,
                QueueLogStatus::TerminalFailed,
                OVERDUE_FINAL_RESULT,
                0,
            )
        }
    }
}

#[async_trait]
impl QueueRepository for SqliteQueueRepository {
    #[instrument(skip(self))]
    async fn list_due_cron_schedulers(&self) -> SchedulerResult<Vec<Scheduler>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULER_COLUMNS} FROM task_schedulers
             WHERE scheduler_kind = ? AND scheduler_status = ? ORDER BY id ASC"
        ))
        .bind(SchedulerKind::Cron.as_str())
        .bind(SchedulerStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_scheduler).collect()
    }

    #[instrument(skip(self))]
    async fn list_due_fixed_schedulers(&self, now: i64) -> SchedulerResult<Vec<Scheduler>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULER_COLUMNS} FROM task_schedulers
             WHERE scheduler_kind = ? AND scheduler_status = ?
               AND CAST(scheduler_rule AS INTEGER) <= ?
             ORDER BY id ASC"
        ))
        .bind(SchedulerKind::FixedTime.as_str())
        .bind(SchedulerStatus::Active.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_scheduler).collect()
    }

    #[instrument(skip(self))]
    async fn list_pending_distributors(&self) -> SchedulerResult<Vec<Distributor>> {
        let rows = sqlx::query(&format!(
            "SELECT {DISTRIBUTOR_COLUMNS} FROM task_distributors
             WHERE execute_status = ? ORDER BY id ASC"
        ))
        .bind(DistributorStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_distributor).collect()
    }

    #[instrument(skip(self))]
    async fn list_runnable_queue(
        &self,
        now: i64,
        exclude_topics: &[String],
        limit: i64,
    ) -> SchedulerResult<Vec<QueueTask>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {QUEUE_COLUMNS} FROM task_queues WHERE execute_status = "
        ));
        builder.push_bind(QueueStatus::Pending.as_str());
        builder.push(" AND next_execute_time <= ").push_bind(now);

        if !exclude_topics.is_empty() {
            builder.push(" AND task_topic NOT IN (");
            let mut separated = builder.separated(", ");
            for topic in exclude_topics {
                separated.push_bind(topic.clone());
            }
            separated.push_unseparated(")");
        }

        builder.push(" ORDER BY id ASC LIMIT ").push_bind(limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_queue_task).collect()
    }

    #[instrument(skip(self, live_ids), fields(live = live_ids.len()))]
    async fn list_orphaned_queue_ids(
        &self,
        live_ids: &[i64],
        now: i64,
        retryable: bool,
    ) -> SchedulerResult<Vec<i64>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id FROM task_queues WHERE execute_status = ");
        builder.push_bind(QueueStatus::Running.as_str());
        builder
            .push(" AND start_time < ")
            .push_bind(now - self.timeout_seconds);

        if retryable {
            builder.push(" AND execute_count < max_execute_count - 1");
        } else {
            builder.push(" AND execute_count >= max_execute_count - 1");
        }

        if !live_ids.is_empty() {
            builder.push(" AND id NOT IN (");
            let mut separated = builder.separated(", ");
            for id in live_ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
        }

        builder.push(" ORDER BY id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(Into::into))
            .collect()
    }

    async fn get_queue_task(&self, id: i64) -> SchedulerResult<Option<QueueTask>> {
        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM task_queues WHERE id = ? AND execute_status = ?"
        ))
        .bind(id)
        .bind(QueueStatus::Pending.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_queue_task).transpose()
    }

    #[instrument(skip(self))]
    async fn disable_scheduler(&self, id: i64) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE task_schedulers SET scheduler_status = ? WHERE id = ? AND scheduler_status = ?",
        )
        .bind(SchedulerStatus::Disabled.as_str())
        .bind(id)
        .bind(SchedulerStatus::Active.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn claim_distributor(&self, id: i64, task_count: i64) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE task_distributors SET task_count = ?, execute_status = ?, start_time = ?
             WHERE id = ? AND execute_status = ?",
        )
        .bind(task_count)
        .bind(DistributorStatus::Running.as_str())
        .bind(now())
        .bind(id)
        .bind(DistributorStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn claim_queue_task(&self, id: i64, max_attempts: i64) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE task_queues SET execute_status = ?, execute_result = '', max_execute_count = ?, start_time = ?
             WHERE id = ? AND execute_status = ?",
        )
        .bind(QueueStatus::Running.as_str())
        .bind(max_attempts)
        .bind(now())
        .bind(id)
        .bind(QueueStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn open_queue_log(&self, queue_id: i64) -> SchedulerResult<i64> {
        let result = sqlx::query(
            "INSERT INTO task_queue_logs (queue_id, execute_status, start_time) VALUES (?, ?, ?)",
        )
        .bind(queue_id)
        .bind(QueueLogStatus::Started.as_str())
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn close_distributor(
        &self,
        id: i64,
        status: DistributorStatus,
        result: &str,
    ) -> SchedulerResult<u64> {
        let outcome = sqlx::query(
            "UPDATE task_distributors SET execute_status = ?, execute_result = ?, end_time = ?
             WHERE id = ? AND execute_status = ?",
        )
        .bind(status.as_str())
        .bind(result)
        .bind(now())
        .bind(id)
        .bind(DistributorStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn close_queue_tasks(
        &self,
        ids: &[i64],
        now: i64,
        retryable: bool,
    ) -> SchedulerResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let (status, _, result, next_execute_time) = self.overdue_outcome(now, retryable);
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE task_queues SET execute_status = ");
        builder.push_bind(status.as_str());
        builder.push(", execute_result = ").push_bind(result);
        builder.push(", end_time = ").push_bind(now);
        builder.push(", execute_count = execute_count + 1, next_execute_time = ");
        builder.push_bind(next_execute_time);
        builder.push(" WHERE execute_status = ");
        builder.push_bind(QueueStatus::Running.as_str());
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let outcome = builder.build().execute(&self.pool).await?;
        Ok(outcome.rows_affected())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn close_queue_logs(
        &self,
        ids: &[i64],
        now: i64,
        retryable: bool,
    ) -> SchedulerResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let (_, log_status, result, _) = self.overdue_outcome(now, retryable);
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE task_queue_logs SET execute_status = ");
        builder.push_bind(log_status.as_str());
        builder.push(", execute_result = ").push_bind(result);
        builder.push(", end_time = ").push_bind(now);
        builder.push(" WHERE execute_status = ");
        builder.push_bind(QueueLogStatus::Started.as_str());
        builder.push(" AND queue_id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let outcome = builder.build().execute(&self.pool).await?;
        Ok(outcome.rows_affected())
    }

    #[instrument(skip(self, result))]
    async fn close_queue_task(
        &self,
        id: i64,
        now: i64,
        status: QueueStatus,
        result: &str,
    ) -> SchedulerResult<u64> {
        let next_execute_time = if status == QueueStatus::Pending {
            now + self.retry_interval_seconds
        } else {
            0
        };

        let outcome = sqlx::query(
            "UPDATE task_queues
             SET execute_status = ?, execute_result = ?, end_time = ?,
                 execute_count = execute_count + 1, next_execute_time = ?
             WHERE id = ? AND execute_status = ?",
        )
        .bind(status.as_str())
        .bind(result)
        .bind(now)
        .bind(next_execute_time)
        .bind(id)
        .bind(QueueStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected())
    }

    async fn close_queue_log(
        &self,
        queue_id: i64,
        now: i64,
        status: QueueLogStatus,
        result: &str,
    ) -> SchedulerResult<u64> {
        let outcome = sqlx::query(
            "UPDATE task_queue_logs SET execute_status = ?, execute_result = ?, end_time = ?
             WHERE queue_id = ? AND execute_status = ?",
        )
        .bind(status.as_str())
        .bind(result)
        .bind(now)
        .bind(queue_id)
        .bind(QueueLogStatus::Started.as_str())
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected())
    }

    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn bulk_insert_distributors(&self, rows: &[NewDistributor]) -> SchedulerResult<u64> {
        let create_time = now();
        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO task_distributors (scheduler_id, task_topic, task_data, execute_status, create_time) ",
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.scheduler_id)
                    .push_bind(row.task_topic.clone())
                    .push_bind(row.task_data.clone())
                    .push_bind(DistributorStatus::Pending.as_str())
                    .push_bind(create_time);
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        debug!("批量创建分发记录 {} 条", inserted);
        Ok(inserted)
    }

    #[instrument(skip(self, payloads), fields(count = payloads.len()))]
    async fn bulk_insert_queue_tasks(
        &self,
        distributor_id: i64,
        payloads: &[Value],
        topic: &str,
    ) -> SchedulerResult<u64> {
        let create_time = now();
        let mut inserted = 0;
        // 所有分块在同一事务内，任一分块失败则整体回滚
        let mut tx = self.pool.begin().await?;

        for chunk in payloads.chunks(INSERT_CHUNK_SIZE) {
            let encoded = chunk
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()?;

            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO task_queues (distributor_id, task_topic, task_data, execute_status, create_time) ",
            );
            builder.push_values(encoded, |mut b, task_data| {
                b.push_bind(distributor_id)
                    .push_bind(topic.to_string())
                    .push_bind(task_data)
                    .push_bind(QueueStatus::Pending.as_str())
                    .push_bind(create_time);
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        debug!("分发记录 {} 创建队列任务 {} 条", distributor_id, inserted);
        Ok(inserted)
    }
}
