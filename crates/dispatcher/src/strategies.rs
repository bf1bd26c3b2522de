use tracing::debug;

/// 候选工作进程的负载快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLoad {
    pub worker_id: u32,
    /// 已发送但尚未确认的消息数
    pub outstanding: i64,
}

pub trait DispatchStrategy: Send + Sync {
    fn select_worker(&self, candidates: &[WorkerLoad]) -> Option<u32>;

    fn name(&self) -> &str;
}

/// 选择未完成消息数最少的工作进程，相同时取编号较小者
#[derive(Debug, Default)]
pub struct LeastLoadedStrategy;

impl LeastLoadedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl DispatchStrategy for LeastLoadedStrategy {
    fn select_worker(&self, candidates: &[WorkerLoad]) -> Option<u32> {
        let selected = candidates
            .iter()
            .min_by_key(|load| (load.outstanding, load.worker_id))?;

        debug!(
            "负载均衡策略选择工作进程: {} (未完成消息: {})",
            selected.worker_id, selected.outstanding
        );
        Some(selected.worker_id)
    }

    fn name(&self) -> &str {
        "LeastLoaded"
    }
}
