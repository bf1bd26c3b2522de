use std::fmt;

use taskq_core::{SchedulerError, SchedulerResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::connection::BoxedTransport;

const LOCAL_PIPE_CAPACITY: usize = 64 * 1024;

/// 工作进程接收新通道的一端
pub type IncomingConnections = mpsc::UnboundedReceiver<BoxedTransport>;

/// 进程内工作进程的入口
#[derive(Clone)]
pub struct LocalEndpoint {
    name: String,
    sender: mpsc::UnboundedSender<BoxedTransport>,
}

pub fn local_endpoint(name: impl Into<String>) -> (LocalEndpoint, IncomingConnections) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        LocalEndpoint {
            name: name.into(),
            sender,
        },
        receiver,
    )
}

impl LocalEndpoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 建立一条进程内双工通道，对端交给工作进程
    pub fn connect(&self) -> SchedulerResult<BoxedTransport> {
        let (near, far) = tokio::io::duplex(LOCAL_PIPE_CAPACITY);
        self.deliver(Box::new(far))?;
        Ok(Box::new(near))
    }

    /// 把已建立的传输层交给工作进程
    pub fn deliver(&self, transport: BoxedTransport) -> SchedulerResult<()> {
        self.sender
            .send(transport)
            .map_err(|_| SchedulerError::Network(format!("工作进程 {} 已停止接收连接", self.name)))
    }
}

impl fmt::Debug for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEndpoint").field("name", &self.name).finish()
    }
}

/// 协调器可拨号的端点
#[derive(Debug, Clone)]
pub enum Endpoint {
    Local(LocalEndpoint),
    Tcp(String),
}

impl Endpoint {
    pub async fn connect(&self) -> SchedulerResult<BoxedTransport> {
        match self {
            Endpoint::Local(endpoint) => endpoint.connect(),
            Endpoint::Tcp(address) => {
                let stream = TcpStream::connect(address)
                    .await
                    .map_err(|e| SchedulerError::Network(format!("连接 {address} 失败: {e}")))?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local(endpoint) => write!(f, "local://{}", endpoint.name()),
            Endpoint::Tcp(address) => write!(f, "tcp://{address}"),
        }
    }
}

/// 进程共享的 TCP 监听端点
///
/// 接受的连接依次轮流分配给本进程内的工作进程。
pub struct TcpAcceptor {
    listener: TcpListener,
    workers: Vec<LocalEndpoint>,
}

impl TcpAcceptor {
    pub async fn bind(address: &str, workers: Vec<LocalEndpoint>) -> SchedulerResult<Self> {
        if workers.is_empty() {
            return Err(SchedulerError::Configuration(
                "监听端点至少需要一个工作进程".to_string(),
            ));
        }
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| SchedulerError::Network(format!("监听 {address} 失败: {e}")))?;
        info!("工作进程监听地址: {}", address);
        Ok(Self { listener, workers })
    }

    pub fn local_addr(&self) -> SchedulerResult<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut next = 0usize;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("设置 TCP_NODELAY 失败: {}", e);
                        }
                        let worker = &self.workers[next % self.workers.len()];
                        next = next.wrapping_add(1);
                        debug!("接受来自 {} 的连接，分配给 {}", peer, worker.name());
                        if let Err(e) = worker.deliver(Box::new(stream)) {
                            error!("分配连接失败: {}", e);
                        }
                    }
                    Err(e) => error!("接受连接失败: {}", e),
                },
                _ = shutdown_rx.recv() => {
                    info!("监听端点停止");
                    break;
                }
            }
        }
    }
}
