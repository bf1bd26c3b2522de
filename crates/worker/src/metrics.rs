use std::time::Duration;

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use taskq_core::models::TaskOutcome;

/// 工作进程指标
pub struct WorkerMetrics {
    commands_received: Counter,
    tasks_succeeded: Counter,
    tasks_retry_failed: Counter,
    tasks_terminal_failed: Counter,
    tasks_cancelled: Counter,
    claims_lost: Counter,
    handler_panics: Counter,
    distributors_created: Counter,
    queue_tasks_created: Counter,
    overdue_tasks_closed: Counter,
    execution_duration: Histogram,
    connections: Gauge,
}

impl WorkerMetrics {
    pub fn new(worker_id: u32) -> Self {
        let worker = worker_id.to_string();
        Self {
            commands_received: counter!("taskq_worker_commands_received_total", "worker" => worker.clone()),
            tasks_succeeded: counter!("taskq_worker_tasks_total", "worker" => worker.clone(), "outcome" => "success"),
            tasks_retry_failed: counter!("taskq_worker_tasks_total", "worker" => worker.clone(), "outcome" => "retry_fail"),
            tasks_terminal_failed: counter!("taskq_worker_tasks_total", "worker" => worker.clone(), "outcome" => "terminal_fail"),
            tasks_cancelled: counter!("taskq_worker_tasks_total", "worker" => worker.clone(), "outcome" => "cancel"),
            claims_lost: counter!("taskq_worker_claims_lost_total", "worker" => worker.clone()),
            handler_panics: counter!("taskq_worker_handler_panics_total", "worker" => worker.clone()),
            distributors_created: counter!("taskq_worker_distributors_created_total", "worker" => worker.clone()),
            queue_tasks_created: counter!("taskq_worker_queue_tasks_created_total", "worker" => worker.clone()),
            overdue_tasks_closed: counter!("taskq_worker_overdue_tasks_closed_total", "worker" => worker.clone()),
            execution_duration: histogram!("taskq_worker_task_duration_seconds", "worker" => worker.clone()),
            connections: gauge!("taskq_worker_connections", "worker" => worker),
        }
    }

    pub fn record_command(&self) {
        self.commands_received.increment(1);
    }

    pub fn record_outcome(&self, outcome: TaskOutcome, duration: Duration) {
        match outcome {
            TaskOutcome::Success => self.tasks_succeeded.increment(1),
            TaskOutcome::RetryFail => self.tasks_retry_failed.increment(1),
            TaskOutcome::TerminalFail => self.tasks_terminal_failed.increment(1),
            TaskOutcome::Cancel => self.tasks_cancelled.increment(1),
        }
        self.execution_duration.record(duration.as_secs_f64());
    }

    pub fn record_claim_lost(&self) {
        self.claims_lost.increment(1);
    }

    pub fn record_panic(&self) {
        self.handler_panics.increment(1);
    }

    pub fn record_distributors(&self, count: u64) {
        self.distributors_created.increment(count);
    }

    pub fn record_queue_tasks(&self, count: u64) {
        self.queue_tasks_created.increment(count);
    }

    pub fn record_overdue(&self, count: u64) {
        self.overdue_tasks_closed.increment(count);
    }

    pub fn set_connections(&self, count: usize) {
        self.connections.set(count as f64);
    }
}
