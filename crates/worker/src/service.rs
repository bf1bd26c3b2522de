//! 工作进程事件循环
//!
//! 一个工作进程只有一个执行上下文：同一时刻只处理一条协调器消息，
//! 消息按到达顺序逐条处理。每条消息处理完后都回复 `finished`。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use taskq_core::models::{
    ConnectReport, CoordinatorCommand, CoordinatorMessage, ExecuteTaskFinished, WorkerEvent,
    WorkerMessage,
};
use taskq_core::traits::QueueRepository;
use taskq_core::{SchedulerResult, TaskTopicRegistry};
use taskq_infrastructure::transport::{
    spawn_connection, BoxedTransport, ConnectionEvent, ConnectionHandle, ConnectionId,
    IncomingConnections,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::components::{SchedulingManager, TaskExecutionManager};
use crate::metrics::WorkerMetrics;

/// 工作进程服务构建器
pub struct WorkerServiceBuilder {
    worker_id: u32,
    repository: Arc<dyn QueueRepository>,
    registry: Arc<TaskTopicRegistry>,
    reserved_load: i64,
}

impl WorkerServiceBuilder {
    pub fn new(
        worker_id: u32,
        repository: Arc<dyn QueueRepository>,
        registry: Arc<TaskTopicRegistry>,
    ) -> Self {
        Self {
            worker_id,
            repository,
            registry,
            reserved_load: 0,
        }
    }

    /// 握手时额外上报的负载，宿主工作进程用它为队列扫描预留容量
    pub fn reserved_load(mut self, reserved_load: i64) -> Self {
        self.reserved_load = reserved_load;
        self
    }

    pub fn build(self) -> WorkerService {
        let metrics = Arc::new(WorkerMetrics::new(self.worker_id));
        WorkerService {
            worker_id: self.worker_id,
            reserved_load: self.reserved_load,
            scheduling: SchedulingManager::new(self.repository.clone(), metrics.clone()),
            execution: TaskExecutionManager::new(self.repository, self.registry, metrics.clone()),
            load: LocalLoad::default(),
            connections: HashMap::new(),
            metrics,
        }
    }
}

/// 本进程正在处理的消息与任务
#[derive(Debug, Default)]
struct LocalLoad {
    processing: i64,
    topic_counts: BTreeMap<String, i64>,
    queue_ids: BTreeSet<i64>,
}

impl LocalLoad {
    fn begin_task(&mut self, queue_id: i64, topic: &str) {
        *self.topic_counts.entry(topic.to_string()).or_insert(0) += 1;
        self.queue_ids.insert(queue_id);
    }

    fn end_task(&mut self, queue_id: i64, topic: &str) {
        if let Some(count) = self.topic_counts.get_mut(topic) {
            *count -= 1;
            if *count <= 0 {
                self.topic_counts.remove(topic);
            }
        }
        self.queue_ids.remove(&queue_id);
    }
}

pub struct WorkerService {
    worker_id: u32,
    reserved_load: i64,
    scheduling: SchedulingManager,
    execution: TaskExecutionManager,
    load: LocalLoad,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    metrics: Arc<WorkerMetrics>,
}

impl WorkerService {
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// 握手时上报的本地负载
    pub fn connect_report(&self) -> ConnectReport {
        ConnectReport {
            queue_count: self.reserved_load + self.load.processing,
            task_topic_pool_count: self.load.topic_counts.clone(),
            task_queue_id_pool: self.load.queue_ids.iter().copied().collect(),
        }
    }

    /// 处理一条协调器消息，返回需要回复的事件，最后一个总是 `finished`
    pub async fn process(&mut self, message: &CoordinatorMessage) -> Vec<WorkerEvent> {
        self.metrics.record_command();
        self.load.processing += 1;

        let mut replies = Vec::with_capacity(2);
        match message.command() {
            Ok(command) => match self.handle_command(command, message.time).await {
                Ok(Some(event)) => replies.push(event),
                Ok(None) => {}
                Err(e) => error!(
                    "工作进程 {} 处理 {} 消息失败: {}",
                    self.worker_id,
                    message.message_type.as_str(),
                    e
                ),
            },
            Err(e) => warn!("工作进程 {} 收到无法解析的消息: {}", self.worker_id, e),
        }
        replies.push(WorkerEvent::Finished);

        self.load.processing -= 1;
        replies
    }

    async fn handle_command(
        &mut self,
        command: CoordinatorCommand,
        time: i64,
    ) -> SchedulerResult<Option<WorkerEvent>> {
        match command {
            CoordinatorCommand::CronScheduler => {
                self.scheduling.cron_scheduler(time).await?;
                Ok(None)
            }
            CoordinatorCommand::TimeScheduler => {
                self.scheduling.time_scheduler(time).await?;
                Ok(None)
            }
            CoordinatorCommand::TaskDistributor => {
                self.scheduling.task_distributor().await?;
                Ok(None)
            }
            CoordinatorCommand::QueueScheduler(request) => {
                let rows = self.scheduling.queue_scheduler(&request, time).await?;
                if rows.is_empty() {
                    Ok(None)
                } else {
                    debug!("队列扫描得到 {} 个任务", rows.len());
                    Ok(Some(WorkerEvent::QueueDistributor(rows)))
                }
            }
            CoordinatorCommand::ExecuteTask(request) => {
                let queue_id = request.task.id;
                let task_topic = request.task.task_topic.clone();

                self.load.begin_task(queue_id, &task_topic);
                let result = self.execution.execute(&request).await;
                self.load.end_task(queue_id, &task_topic);

                // 即使执行出错也要通知协调器释放并发名额
                if let Err(e) = result {
                    error!("队列任务 {} 执行失败: {}", queue_id, e);
                }
                Ok(Some(WorkerEvent::ExecuteTaskFinished(ExecuteTaskFinished {
                    queue_id,
                    task_topic,
                })))
            }
            CoordinatorCommand::OverdueTasks(live_ids) => {
                self.scheduling.overdue_tasks(&live_ids, time).await?;
                Ok(None)
            }
        }
    }

    /// 接受通道并在其上处理消息，直到收到关闭信号
    pub async fn run(
        mut self,
        mut incoming: IncomingConnections,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("工作进程 {} 启动", self.worker_id);
        let (events_tx, mut events_rx) =
            mpsc::unbounded_channel::<ConnectionEvent<CoordinatorMessage>>();

        loop {
            tokio::select! {
                Some(transport) = incoming.recv() => self.accept(transport, &events_tx),
                Some(event) = events_rx.recv() => match event {
                    ConnectionEvent::Message { connection_id, message } => {
                        let replies = self.process(&message).await;
                        for event in &replies {
                            self.reply(connection_id, event);
                        }
                    }
                    ConnectionEvent::Closed { connection_id } => {
                        if self.connections.remove(&connection_id).is_some() {
                            info!("工作进程 {} 的通道 {} 已关闭", self.worker_id, connection_id);
                        }
                        self.metrics.set_connections(self.connections.len());
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("工作进程 {} 收到关闭信号", self.worker_id);
                    break;
                }
            }
        }

        for handle in self.connections.values() {
            handle.close();
        }
    }

    /// 新通道建立后立即上报本地负载
    fn accept(
        &mut self,
        transport: BoxedTransport,
        events_tx: &mpsc::UnboundedSender<ConnectionEvent<CoordinatorMessage>>,
    ) {
        let handle = spawn_connection(transport, events_tx.clone(), CoordinatorMessage::deserialize);
        let connection_id = handle.id();
        self.connections.insert(connection_id, handle);
        self.metrics.set_connections(self.connections.len());
        info!("工作进程 {} 接受通道 {}", self.worker_id, connection_id);

        let report = WorkerEvent::Connect(self.connect_report());
        self.reply(connection_id, &report);
    }

    fn reply(&self, connection_id: ConnectionId, event: &WorkerEvent) {
        let Some(handle) = self.connections.get(&connection_id) else {
            debug!("通道 {} 已关闭，丢弃 {} 消息", connection_id, event.message_type().as_str());
            return;
        };

        let frame = match WorkerMessage::from_event(self.worker_id, event, Utc::now().timestamp())
            .and_then(|message| message.serialize())
        {
            Ok(frame) => frame,
            Err(e) => {
                error!("序列化 {} 消息失败: {}", event.message_type().as_str(), e);
                return;
            }
        };

        if !handle.send(frame) {
            warn!("通道 {} 发送失败", connection_id);
        }
    }
}
