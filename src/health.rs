/// 心跳调度器：按固定间隔输出一条日志，证明事件循环仍在运行
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, trace, warn};

/// 最小心跳间隔，零间隔会被提升到该值
const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HealthScheduler {
    interval: Duration,
    beats: Arc<AtomicU64>,
}

impl HealthScheduler {
    pub fn new(interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            warn!(
                "Health check interval must be positive, using {:?}",
                MIN_INTERVAL
            );
            MIN_INTERVAL
        } else {
            interval
        };
        Self {
            interval,
            beats: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 已发出的心跳次数
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    /// 启动心跳任务；第一次心跳在一个间隔之后，任务随进程结束
    pub fn spawn(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            trace!("Starting health checks every {:?}", scheduler.interval);

            let mut ticker = interval_at(Instant::now() + scheduler.interval, scheduler.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let beat = scheduler.beats.fetch_add(1, Ordering::Relaxed) + 1;
                info!(beat, "Health check: System is operational");
            }
        })
    }
}
