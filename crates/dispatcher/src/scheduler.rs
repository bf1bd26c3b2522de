//! 协调器事件循环
//!
//! 单个任务内顺序处理：周期触发器、通道事件、拨号结果与重连。

use std::time::Duration;

use chrono::Utc;
use taskq_core::models::{CoordinatorCommand, WorkerMessage};
use taskq_core::{CoordinatorConfig, SchedulerResult};
use taskq_infrastructure::transport::{ConnectionEvent, Endpoint};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{error, info};

use crate::connection_manager::ConnectionManager;
use crate::coordinator::Coordinator;

pub struct CoordinatorService {
    coordinator: Coordinator,
    endpoints: Vec<Endpoint>,
    config: CoordinatorConfig,
}

impl CoordinatorService {
    pub fn new(coordinator: Coordinator, endpoints: Vec<Endpoint>, config: CoordinatorConfig) -> Self {
        Self {
            coordinator,
            endpoints,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Coordinator {
        let Self {
            mut coordinator,
            endpoints,
            config,
        } = self;

        info!("协调器启动，端点数: {}", endpoints.len());
        let (mut connections, mut dial_rx) = ConnectionManager::new(endpoints);
        let (events_tx, mut events_rx) =
            mpsc::unbounded_channel::<ConnectionEvent<WorkerMessage>>();

        let mut cron = optional_interval(config.cron_interval());
        let mut time_scheduler = optional_interval(config.time_scheduler_interval());
        let mut distributor = optional_interval(config.distributor_interval());
        let mut queue = optional_interval(config.queue_interval());
        let mut overdue = optional_interval(config.overdue_interval());
        let mut reconnect = new_interval(config.reconnect_interval());
        let mut cron_clock = CronClock::default();

        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => match event {
                    ConnectionEvent::Message { connection_id, message } => {
                        coordinator.handle_message(connection_id, message, now());
                    }
                    ConnectionEvent::Closed { connection_id } => {
                        coordinator.handle_closed(connection_id);
                        connections.on_closed(connection_id);
                    }
                },
                Some(outcome) = dial_rx.recv() => {
                    if let Some(handle) = connections.on_dialed(outcome, &events_tx) {
                        coordinator.register_connection(handle);
                    }
                }
                _ = reconnect.tick() => connections.dial_disconnected(),
                _ = tick(&mut cron) => {
                    for second in cron_clock.advance(now()) {
                        log_failure("cron_scheduler", coordinator.send(CoordinatorCommand::CronScheduler, second));
                    }
                }
                _ = tick(&mut time_scheduler) => {
                    log_failure("time_scheduler", coordinator.send(CoordinatorCommand::TimeScheduler, now()));
                }
                _ = tick(&mut distributor) => {
                    log_failure("task_distributor", coordinator.send(CoordinatorCommand::TaskDistributor, now()));
                }
                _ = tick(&mut queue) => {
                    log_failure("queue_scheduler", coordinator.send_queue_scheduler(now()));
                }
                _ = tick(&mut overdue) => {
                    log_failure("overdue_tasks", coordinator.send_overdue_tasks(now()));
                }
                _ = shutdown_rx.recv() => {
                    info!("协调器收到关闭信号");
                    break;
                }
            }
        }

        coordinator.close_all();
        coordinator
    }
}

/// 延迟后最多补发的秒数
const MAX_CRON_CATCH_UP: i64 = 60;

/// 保证每一秒只发送一次 CRON 触发
///
/// 定时器可能提前或推迟触发，按墙钟读取的秒数会重复或跳过。
#[derive(Debug, Default)]
pub struct CronClock {
    last_second: Option<i64>,
}

impl CronClock {
    /// 返回上次之后尚未触发的秒，按时间顺序
    pub fn advance(&mut self, now: i64) -> std::ops::RangeInclusive<i64> {
        let first = match self.last_second {
            Some(last) if now <= last => return 1..=0,
            Some(last) => (last + 1).max(now - MAX_CRON_CATCH_UP + 1),
            None => now,
        };
        self.last_second = Some(now);
        first..=now
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn new_interval(period: Duration) -> Interval {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

fn optional_interval(period: Option<Duration>) -> Option<Interval> {
    period.map(new_interval)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn log_failure(trigger: &str, result: SchedulerResult<Option<u32>>) {
    if let Err(e) = result {
        error!("发送 {} 消息失败: {}", trigger, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seconds(clock: &mut CronClock, now: i64) -> Vec<i64> {
        clock.advance(now).collect()
    }

    #[test]
    fn test_cron_clock_sends_each_second_once() {
        let mut clock = CronClock::default();
        assert_eq!(seconds(&mut clock, 100), vec![100]);
        // 同一秒内的第二次触发
        assert!(seconds(&mut clock, 100).is_empty());
        assert_eq!(seconds(&mut clock, 101), vec![101]);
        // 定时器推迟超过一秒
        assert_eq!(seconds(&mut clock, 104), vec![102, 103, 104]);
        // 墙钟回拨
        assert!(seconds(&mut clock, 90).is_empty());
        assert_eq!(seconds(&mut clock, 105), vec![105]);
    }

    #[test]
    fn test_cron_clock_caps_catch_up() {
        let mut clock = CronClock::default();
        clock.advance(1_000);
        let caught_up = seconds(&mut clock, 5_000);
        assert_eq!(caught_up.len() as i64, MAX_CRON_CATCH_UP);
        assert_eq!(caught_up.first(), Some(&(5_000 - MAX_CRON_CATCH_UP + 1)));
        assert_eq!(caught_up.last(), Some(&5_000));
    }
}
