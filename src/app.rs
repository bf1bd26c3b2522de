use std::sync::Arc;

use anyhow::{Context, Result};
use taskq_core::config::AppConfig;
use taskq_core::traits::QueueRepository;
use taskq_core::TaskTopicRegistry;
use taskq_dispatcher::{endpoint_targets, Coordinator, CoordinatorService};
use taskq_infrastructure::transport::{local_endpoint, LocalEndpoint, TcpAcceptor};
use taskq_infrastructure::{DatabaseManager, SqliteQueueRepository};
use taskq_worker::{build_registry, WorkerServiceBuilder};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行工作进程
    Worker,
    /// 仅运行协调器，连接远程端点
    Coordinator,
    /// 工作进程与协调器运行在同一进程
    All,
}

impl AppMode {
    pub fn runs_workers(self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }

    pub fn runs_coordinator(self, config: &AppConfig) -> bool {
        match self {
            AppMode::Coordinator => true,
            AppMode::All => config.coordinator.enabled,
            AppMode::Worker => false,
        }
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    registry: Arc<TaskTopicRegistry>,
    database: Option<DatabaseManager>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let registry = Arc::new(build_registry(&config.task_topics).context("构建任务主题注册表失败")?);
        info!("已注册任务主题 {} 个", registry.len());

        // 协调器本身不访问数据库
        let database = if mode.runs_workers() {
            let database = DatabaseManager::new(&config.database)
                .await
                .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
            database.migrate().await.context("执行数据库迁移失败")?;
            Some(database)
        } else {
            None
        };

        Ok(Self {
            config,
            mode,
            registry,
            database,
        })
    }

    /// 运行到收到关闭信号，所有组件退出后返回
    pub async fn run(self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);
        let hosts_coordinator = self.mode.runs_coordinator(&self.config);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        let local = match &self.database {
            Some(database) => {
                self.start_workers(database, hosts_coordinator, &shutdown_rx, &mut handles)
                    .await?
            }
            None => Vec::new(),
        };

        if hosts_coordinator {
            let mut coordinator = Coordinator::new(self.registry.clone(), &self.config.queue);
            if !local.is_empty() && self.config.coordinator.connect_local {
                coordinator = coordinator.with_host_worker(self.config.worker.first_worker_id);
            }
            let targets = endpoint_targets(&self.config.coordinator, &local);
            let service = CoordinatorService::new(coordinator, targets, self.config.coordinator.clone());
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                let coordinator = service.run(shutdown_rx).await;
                info!(
                    "协调器已停止，剩余待派发任务 {} 个",
                    coordinator.untreated_ids().len()
                );
            }));
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("组件异常退出: {}", e);
            }
        }

        if let Some(database) = &self.database {
            database.close().await;
        }
        info!("应用程序已停止");
        Ok(())
    }

    async fn start_workers(
        &self,
        database: &DatabaseManager,
        hosts_coordinator: bool,
        shutdown_rx: &broadcast::Receiver<()>,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> Result<Vec<LocalEndpoint>> {
        let repository: Arc<dyn QueueRepository> = Arc::new(SqliteQueueRepository::new(
            database.pool().clone(),
            &self.config.queue,
        ));

        let mut local = Vec::new();
        for worker_id in self.config.worker.worker_ids() {
            let (endpoint, incoming) = local_endpoint(format!("worker-{worker_id}"));
            let mut builder =
                WorkerServiceBuilder::new(worker_id, repository.clone(), self.registry.clone());
            if hosts_coordinator && worker_id == self.config.worker.first_worker_id {
                builder = builder.reserved_load(self.config.coordinator.reserved_load);
            }
            handles.push(tokio::spawn(
                builder.build().run(incoming, shutdown_rx.resubscribe()),
            ));
            local.push(endpoint);
        }

        if let Some(address) = &self.config.worker.listen_address {
            let acceptor = TcpAcceptor::bind(address, local.clone())
                .await
                .with_context(|| format!("绑定监听地址失败: {address}"))?;
            info!("工作进程监听地址: {}", acceptor.local_addr()?);
            handles.push(tokio::spawn(acceptor.run(shutdown_rx.resubscribe())));
        }

        info!("已启动工作进程 {} 个", local.len());
        Ok(local)
    }
}
