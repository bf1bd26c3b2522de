use metrics::{counter, gauge, Counter, Gauge};

/// 协调器指标
pub struct CoordinatorMetrics {
    messages_dispatched: Counter,
    messages_backlogged: Counter,
    tasks_admitted: Counter,
    duplicate_handshakes: Counter,
    connected_workers: Gauge,
    backlog_size: Gauge,
    untreated_size: Gauge,
    in_flight_tasks: Gauge,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self {
            messages_dispatched: counter!("taskq_coordinator_messages_dispatched_total"),
            messages_backlogged: counter!("taskq_coordinator_messages_backlogged_total"),
            tasks_admitted: counter!("taskq_coordinator_tasks_admitted_total"),
            duplicate_handshakes: counter!("taskq_coordinator_duplicate_handshakes_total"),
            connected_workers: gauge!("taskq_coordinator_connected_workers"),
            backlog_size: gauge!("taskq_coordinator_backlog_size"),
            untreated_size: gauge!("taskq_coordinator_untreated_tasks"),
            in_flight_tasks: gauge!("taskq_coordinator_in_flight_tasks"),
        }
    }

    pub fn record_dispatched(&self) {
        self.messages_dispatched.increment(1);
    }

    pub fn record_backlogged(&self) {
        self.messages_backlogged.increment(1);
    }

    pub fn record_admitted(&self) {
        self.tasks_admitted.increment(1);
    }

    pub fn record_duplicate_handshake(&self) {
        self.duplicate_handshakes.increment(1);
    }

    pub fn update_sizes(&self, workers: usize, backlog: usize, untreated: usize, in_flight: usize) {
        self.connected_workers.set(workers as f64);
        self.backlog_size.set(backlog as f64);
        self.untreated_size.set(untreated as f64);
        self.in_flight_tasks.set(in_flight as f64);
    }
}

impl Default for CoordinatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}
