use std::collections::HashMap;

use taskq_core::models::WorkerMessage;
use taskq_core::{CoordinatorConfig, SchedulerResult};
use taskq_infrastructure::transport::{
    spawn_connection, BoxedTransport, ConnectionEvent, ConnectionHandle, ConnectionId, Endpoint,
    LocalEndpoint,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 拨号结果，由后台任务投递回事件循环
pub struct DialOutcome {
    target: usize,
    result: SchedulerResult<BoxedTransport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    Disconnected,
    Dialing,
    Connected(ConnectionId),
}

struct Target {
    endpoint: Endpoint,
    state: TargetState,
}

/// 根据配置生成协调器要维持的通道列表
pub fn endpoint_targets(config: &CoordinatorConfig, local: &[LocalEndpoint]) -> Vec<Endpoint> {
    let mut targets = Vec::new();
    if config.connect_local {
        targets.extend(local.iter().cloned().map(Endpoint::Local));
    }
    for remote in &config.remote_endpoints {
        for _ in 0..remote.connections {
            targets.push(Endpoint::Tcp(remote.address.clone()));
        }
    }
    targets
}

/// 维持到各个工作进程端点的通道，断开的端点在下一轮重连
pub struct ConnectionManager {
    targets: Vec<Target>,
    by_connection: HashMap<ConnectionId, usize>,
    dial_tx: mpsc::UnboundedSender<DialOutcome>,
}

impl ConnectionManager {
    pub fn new(endpoints: Vec<Endpoint>) -> (Self, mpsc::UnboundedReceiver<DialOutcome>) {
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let targets = endpoints
            .into_iter()
            .map(|endpoint| Target {
                endpoint,
                state: TargetState::Disconnected,
            })
            .collect();
        (
            Self {
                targets,
                by_connection: HashMap::new(),
                dial_tx,
            },
            dial_rx,
        )
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn connected_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| matches!(t.state, TargetState::Connected(_)))
            .count()
    }

    /// 为所有断开的端点发起拨号
    pub fn dial_disconnected(&mut self) {
        for (index, target) in self.targets.iter_mut().enumerate() {
            if target.state != TargetState::Disconnected {
                continue;
            }
            target.state = TargetState::Dialing;
            let endpoint = target.endpoint.clone();
            let dial_tx = self.dial_tx.clone();
            tokio::spawn(async move {
                let result = endpoint.connect().await;
                let _ = dial_tx.send(DialOutcome {
                    target: index,
                    result,
                });
            });
        }
    }

    /// 拨号完成，成功时启动通道并返回发送端
    pub fn on_dialed(
        &mut self,
        outcome: DialOutcome,
        events: &mpsc::UnboundedSender<ConnectionEvent<WorkerMessage>>,
    ) -> Option<ConnectionHandle> {
        let target = self.targets.get_mut(outcome.target)?;
        match outcome.result {
            Ok(transport) => {
                let handle =
                    spawn_connection(transport, events.clone(), WorkerMessage::deserialize);
                target.state = TargetState::Connected(handle.id());
                self.by_connection.insert(handle.id(), outcome.target);
                info!("已连接端点 {} (通道 {})", target.endpoint, handle.id());
                Some(handle)
            }
            Err(e) => {
                target.state = TargetState::Disconnected;
                debug!("连接端点 {} 失败: {}", target.endpoint, e);
                None
            }
        }
    }

    pub fn on_closed(&mut self, connection_id: ConnectionId) {
        let Some(index) = self.by_connection.remove(&connection_id) else {
            return;
        };
        if let Some(target) = self.targets.get_mut(index) {
            warn!("端点 {} 的通道 {} 已断开", target.endpoint, connection_id);
            target.state = TargetState::Disconnected;
        }
    }
}
