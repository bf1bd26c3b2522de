pub mod app_config;
pub mod coordinator_worker;
pub mod database;
pub mod observability;
pub mod queue;

pub use app_config::AppConfig;
pub use coordinator_worker::{CoordinatorConfig, RemoteEndpoint, TaskTopicConfig, WorkerConfig};
pub use database::DatabaseConfig;
pub use observability::ObservabilityConfig;
pub use queue::QueueConfig;
