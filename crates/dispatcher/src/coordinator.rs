//! 协调器状态
//!
//! 协调器只持有可重建的内存计数：每个已连接工作进程的负载、
//! 全集群按主题的在途任务数、正在执行的队列 ID、积压消息和待分发的队列任务。
//! 所有方法都在同一个事件循环中调用，不需要加锁。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use taskq_core::models::{
    ConnectReport, CoordinatorCommand, CoordinatorMessage, ExecuteTaskFinished,
    ExecuteTaskRequest, QueueSchedulerRequest, QueueTask, WorkerEvent, WorkerMessage,
};
use taskq_core::{QueueConfig, SchedulerResult, TaskTopicRegistry};
use taskq_infrastructure::transport::{ConnectionHandle, ConnectionId};
use tracing::{debug, error, info, warn};

use crate::admission::TopicAdmission;
use crate::metrics::CoordinatorMetrics;
use crate::strategies::{DispatchStrategy, LeastLoadedStrategy, WorkerLoad};

/// 已握手的工作进程
struct WorkerSlot {
    connection: ConnectionHandle,
    outstanding: i64,
    topic_counts: HashMap<String, i64>,
    queue_ids: HashSet<i64>,
}

impl WorkerSlot {
    fn hold(&mut self, queue_id: i64, topic: &str) {
        *self.topic_counts.entry(topic.to_string()).or_insert(0) += 1;
        self.queue_ids.insert(queue_id);
    }

    /// 释放一个在途任务，返回该进程是否确实计入过这个主题
    fn release(&mut self, queue_id: i64, topic: &str) -> bool {
        self.queue_ids.remove(&queue_id);
        match self.topic_counts.get_mut(topic) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    self.topic_counts.remove(topic);
                }
                true
            }
            _ => false,
        }
    }
}

pub struct Coordinator {
    host_worker_id: Option<u32>,
    strategy: Box<dyn DispatchStrategy>,
    /// 已建立但尚未握手的通道
    pending: HashMap<ConnectionId, ConnectionHandle>,
    connections: HashMap<ConnectionId, u32>,
    slots: BTreeMap<u32, WorkerSlot>,
    admission: TopicAdmission,
    in_flight: BTreeSet<i64>,
    backlog: VecDeque<CoordinatorMessage>,
    untreated: IndexMap<i64, QueueTask>,
    metrics: CoordinatorMetrics,
}

impl Coordinator {
    pub fn new(registry: Arc<TaskTopicRegistry>, config: &QueueConfig) -> Self {
        Self {
            host_worker_id: None,
            strategy: Box::new(LeastLoadedStrategy::new()),
            pending: HashMap::new(),
            connections: HashMap::new(),
            slots: BTreeMap::new(),
            admission: TopicAdmission::new(
                registry,
                config.task_concurrency,
                config.topic_concurrency,
            ),
            in_flight: BTreeSet::new(),
            backlog: VecDeque::new(),
            untreated: IndexMap::new(),
            metrics: CoordinatorMetrics::new(),
        }
    }

    /// 承载协调器的工作进程，队列扫描优先发给它
    pub fn with_host_worker(mut self, worker_id: u32) -> Self {
        self.host_worker_id = Some(worker_id);
        self
    }

    pub fn with_strategy(mut self, strategy: Box<dyn DispatchStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn connected_workers(&self) -> Vec<u32> {
        self.slots.keys().copied().collect()
    }

    pub fn is_connected(&self, worker_id: u32) -> bool {
        self.slots.contains_key(&worker_id)
    }

    pub fn outstanding(&self, worker_id: u32) -> Option<i64> {
        self.slots.get(&worker_id).map(|slot| slot.outstanding)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn untreated_ids(&self) -> Vec<i64> {
        self.untreated.keys().copied().collect()
    }

    pub fn in_flight_ids(&self) -> Vec<i64> {
        self.in_flight.iter().copied().collect()
    }

    pub fn topic_in_flight(&self, topic: &str) -> i64 {
        self.admission.in_flight(topic)
    }

    pub fn excluded_topics(&self) -> Vec<String> {
        self.admission.excluded_topics()
    }

    /// 新通道建立，等待工作进程握手
    pub fn register_connection(&mut self, connection: ConnectionHandle) {
        debug!("通道 {} 已建立，等待握手", connection.id());
        self.pending.insert(connection.id(), connection);
    }

    /// 处理工作进程上报的消息，任何错误都只记录日志
    pub fn handle_message(&mut self, connection_id: ConnectionId, message: WorkerMessage, now: i64) {
        let message_type = message.message_type;
        if let Err(e) = self.dispatch_event(connection_id, message, now) {
            error!(
                "处理工作进程消息 {} 失败 (通道 {}): {}",
                message_type.as_str(),
                connection_id,
                e
            );
        }
        self.record_sizes();
    }

    /// 通道关闭，归还该工作进程占用的计数
    pub fn handle_closed(&mut self, connection_id: ConnectionId) -> Option<u32> {
        if self.pending.remove(&connection_id).is_some() {
            debug!("未握手的通道 {} 已关闭", connection_id);
            return None;
        }
        let worker_id = self.connections.remove(&connection_id)?;
        let slot = self.slots.remove(&worker_id)?;

        for (topic, count) in &slot.topic_counts {
            self.admission.release(topic, *count);
        }
        for queue_id in &slot.queue_ids {
            self.in_flight.remove(queue_id);
        }

        warn!(
            "工作进程 {} 断开连接，释放在途任务 {} 个",
            worker_id,
            slot.queue_ids.len()
        );
        self.record_sizes();
        Some(worker_id)
    }

    pub fn close_all(&mut self) {
        for connection in self.pending.values() {
            connection.close();
        }
        for slot in self.slots.values() {
            slot.connection.close();
        }
    }

    /// 发送一条指令给负载最小的工作进程，没有可用进程时进入积压队列
    pub fn send(&mut self, command: CoordinatorCommand, now: i64) -> SchedulerResult<Option<u32>> {
        let message = CoordinatorMessage::from_command(&command, now)?;
        let sent = self.send_message(message, None)?;
        self.record_sizes();
        Ok(sent)
    }

    /// 全局在途数未满时请求更多可执行队列任务
    pub fn send_queue_scheduler(&mut self, now: i64) -> SchedulerResult<Option<u32>> {
        let Some(select_count) = self.admission.headroom() else {
            debug!("在途任务已达全局上限，跳过队列调度");
            return Ok(None);
        };
        let command = CoordinatorCommand::QueueScheduler(QueueSchedulerRequest {
            exclude_topic: self.admission.excluded_topics(),
            select_count,
        });
        let message = CoordinatorMessage::from_command(&command, now)?;
        let sent = self.send_message(message, self.host_worker_id)?;
        self.record_sizes();
        Ok(sent)
    }

    pub fn send_overdue_tasks(&mut self, now: i64) -> SchedulerResult<Option<u32>> {
        self.send(CoordinatorCommand::OverdueTasks(self.in_flight_ids()), now)
    }

    /// 按准入规则尝试下发一个队列任务
    ///
    /// 主题已满或没有可用工作进程时返回 false，任务留在待分发队列中。
    pub fn try_dispatch_queue(&mut self, task: &QueueTask, now: i64) -> SchedulerResult<bool> {
        if self.slots.is_empty() || !self.admission.can_admit(&task.task_topic) {
            return Ok(false);
        }

        let task_handler = self
            .admission
            .registry()
            .contains(&task.task_topic)
            .then(|| task.task_topic.clone());
        let command = CoordinatorCommand::ExecuteTask(ExecuteTaskRequest {
            task: task.clone(),
            task_handler,
        });
        let message = CoordinatorMessage::from_command(&command, now)?;

        let Some(worker_id) = self.deliver(&message, None)? else {
            return Ok(false);
        };

        self.admission.admit(&task.task_topic);
        self.in_flight.insert(task.id);
        if let Some(slot) = self.slots.get_mut(&worker_id) {
            slot.hold(task.id, &task.task_topic);
        }
        self.metrics.record_admitted();
        debug!(
            "队列任务 {} ({}) 已下发给工作进程 {}",
            task.id, task.task_topic, worker_id
        );
        Ok(true)
    }

    /// 按到达顺序对待分发的队列任务重新执行准入，跳过已满的主题
    pub fn drain_untreated(&mut self, now: i64) {
        if self.slots.is_empty() || self.untreated.is_empty() {
            return;
        }

        let had_admissible = self.has_admissible();
        let ids: Vec<i64> = self.untreated.keys().copied().collect();
        for id in ids {
            let Some(task) = self.untreated.get(&id).cloned() else {
                continue;
            };
            match self.try_dispatch_queue(&task, now) {
                Ok(true) => {
                    self.untreated.shift_remove(&id);
                }
                Ok(false) => {}
                Err(e) => error!("下发队列任务 {} 失败: {}", id, e),
            }
        }

        if had_admissible && !self.has_admissible() {
            if let Err(e) = self.send_queue_scheduler(now) {
                error!("发送队列调度消息失败: {}", e);
            }
        }
        self.record_sizes();
    }

    fn has_admissible(&self) -> bool {
        self.untreated
            .values()
            .any(|task| !self.admission.is_saturated(&task.task_topic))
    }

    fn dispatch_event(
        &mut self,
        connection_id: ConnectionId,
        message: WorkerMessage,
        now: i64,
    ) -> SchedulerResult<()> {
        let event = match message.event()? {
            WorkerEvent::Connect(report) => {
                return self.handshake(connection_id, message.worker_id, report, now);
            }
            event => event,
        };

        let Some(worker_id) = self.connections.get(&connection_id).copied() else {
            warn!(
                "通道 {} 尚未握手，丢弃消息 {}",
                connection_id,
                message.message_type.as_str()
            );
            return Ok(());
        };
        if worker_id != message.worker_id {
            warn!(
                "通道 {} 属于工作进程 {}，消息却声明为 {}",
                connection_id, worker_id, message.worker_id
            );
        }

        match event {
            WorkerEvent::Connect(_) => {}
            WorkerEvent::QueueDistributor(rows) => self.queue_distributor(rows, now),
            WorkerEvent::Finished => {
                if let Some(slot) = self.slots.get_mut(&worker_id) {
                    slot.outstanding = (slot.outstanding - 1).max(0);
                }
            }
            WorkerEvent::ExecuteTaskFinished(finished) => {
                self.execute_task_finished(worker_id, finished);
                self.drain_untreated(now);
            }
        }
        Ok(())
    }

    fn handshake(
        &mut self,
        connection_id: ConnectionId,
        worker_id: u32,
        report: ConnectReport,
        now: i64,
    ) -> SchedulerResult<()> {
        if self.connections.contains_key(&connection_id) {
            warn!("通道 {} 重复握手，忽略", connection_id);
            return Ok(());
        }
        let Some(connection) = self.pending.remove(&connection_id) else {
            warn!("收到未知通道 {} 的握手", connection_id);
            return Ok(());
        };
        if self.slots.contains_key(&worker_id) {
            warn!(
                "工作进程 {} 已存在连接，关闭新通道 {}",
                worker_id, connection_id
            );
            connection.close();
            self.metrics.record_duplicate_handshake();
            return Ok(());
        }

        for (topic, count) in &report.task_topic_pool_count {
            self.admission.add(topic, *count);
        }
        self.in_flight
            .extend(report.task_queue_id_pool.iter().copied());

        self.slots.insert(
            worker_id,
            WorkerSlot {
                connection,
                outstanding: report.queue_count,
                topic_counts: report.task_topic_pool_count.into_iter().collect(),
                queue_ids: report.task_queue_id_pool.into_iter().collect(),
            },
        );
        self.connections.insert(connection_id, worker_id);
        info!(
            "工作进程 {} 已连接 (通道 {}, 未完成消息 {})",
            worker_id, connection_id, report.queue_count
        );

        self.flush_backlog();
        self.drain_untreated(now);
        Ok(())
    }

    fn queue_distributor(&mut self, rows: Vec<QueueTask>, now: i64) {
        let mut merged = 0usize;
        for task in rows {
            // 已下发但尚未完成的任务可能被再次扫描到
            if self.in_flight.contains(&task.id) {
                continue;
            }
            self.untreated.insert(task.id, task);
            merged += 1;
        }
        debug!("合并待分发队列任务 {} 个", merged);
        self.drain_untreated(now);
    }

    fn execute_task_finished(&mut self, worker_id: u32, finished: ExecuteTaskFinished) {
        let counted = self
            .slots
            .get_mut(&worker_id)
            .map(|slot| slot.release(finished.queue_id, &finished.task_topic))
            .unwrap_or(false);
        if counted {
            self.admission.release(&finished.task_topic, 1);
        }
        self.in_flight.remove(&finished.queue_id);
        debug!(
            "工作进程 {} 完成队列任务 {} ({})",
            worker_id, finished.queue_id, finished.task_topic
        );
    }

    fn send_message(
        &mut self,
        message: CoordinatorMessage,
        preferred: Option<u32>,
    ) -> SchedulerResult<Option<u32>> {
        // 积压消息先于新消息送达
        if !self.backlog.is_empty() && !self.slots.is_empty() {
            self.flush_backlog();
        }
        if self.backlog.is_empty() {
            if let Some(worker_id) = self.deliver(&message, preferred)? {
                return Ok(Some(worker_id));
            }
        }
        debug!(
            "没有可用的工作进程，消息 {} 进入积压队列",
            message.message_type.as_str()
        );
        self.backlog.push_back(message);
        self.metrics.record_backlogged();
        Ok(None)
    }

    /// 选择工作进程并写入通道，成功后才计入未完成消息数
    fn deliver(
        &mut self,
        message: &CoordinatorMessage,
        preferred: Option<u32>,
    ) -> SchedulerResult<Option<u32>> {
        let worker_id = match preferred.filter(|id| self.slots.contains_key(id)) {
            Some(worker_id) => worker_id,
            None => {
                let loads: Vec<WorkerLoad> = self
                    .slots
                    .iter()
                    .map(|(worker_id, slot)| WorkerLoad {
                        worker_id: *worker_id,
                        outstanding: slot.outstanding,
                    })
                    .collect();
                match self.strategy.select_worker(&loads) {
                    Some(worker_id) => worker_id,
                    None => return Ok(None),
                }
            }
        };

        let Some(slot) = self.slots.get_mut(&worker_id) else {
            return Ok(None);
        };
        let frame = message.serialize()?;
        if !slot.connection.send(frame) {
            warn!(
                "向工作进程 {} 发送 {} 失败",
                worker_id,
                message.message_type.as_str()
            );
            return Ok(None);
        }
        slot.outstanding += 1;
        self.metrics.record_dispatched();
        Ok(Some(worker_id))
    }

    /// 按原顺序补发积压消息
    fn flush_backlog(&mut self) {
        if self.backlog.is_empty() {
            return;
        }
        let queued: Vec<CoordinatorMessage> = self.backlog.drain(..).collect();
        let total = queued.len();
        let mut remaining = queued.into_iter();
        while let Some(message) = remaining.next() {
            match self.deliver(&message, None) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.backlog.push_back(message);
                    self.backlog.extend(remaining.by_ref());
                    break;
                }
                Err(e) => error!("补发积压消息失败，已丢弃: {}", e),
            }
        }
        info!(
            "补发积压消息 {} 条，剩余 {} 条",
            total - self.backlog.len(),
            self.backlog.len()
        );
    }

    fn record_sizes(&self) {
        self.metrics.update_sizes(
            self.slots.len(),
            self.backlog.len(),
            self.untreated.len(),
            self.in_flight.len(),
        );
    }
}
