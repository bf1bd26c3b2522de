//! 工作进程：响应协调器消息，执行触发器扫描、分发展开与队列任务

pub mod components;
pub mod executors;
pub mod metrics;
pub mod service;

pub use components::{DistributionOutcome, SchedulingManager, TaskExecutionManager};
pub use executors::{build_registry, LogExecutor, ShellExecutor, ShellTaskParams};
pub use service::{WorkerService, WorkerServiceBuilder};
