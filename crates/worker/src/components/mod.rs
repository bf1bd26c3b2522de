pub mod scheduling;
pub mod task_execution;

pub use scheduling::{DistributionOutcome, SchedulingManager};
pub use task_execution::{TaskExecutionManager, UNREGISTERED_TOPIC};
