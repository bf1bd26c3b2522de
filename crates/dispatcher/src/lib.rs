//! 协调器：维护工作进程通道，按负载分发消息，并按任务主题做准入控制

pub mod admission;
pub mod connection_manager;
pub mod coordinator;
pub mod metrics;
pub mod scheduler;
pub mod strategies;

pub use admission::TopicAdmission;
pub use connection_manager::{endpoint_targets, ConnectionManager};
pub use coordinator::Coordinator;
pub use scheduler::{CoordinatorService, CronClock};
pub use strategies::{DispatchStrategy, LeastLoadedStrategy, WorkerLoad};
