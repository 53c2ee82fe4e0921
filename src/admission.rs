/// 连接准入控制
///
/// 只在 accept 时检查 `active < max_connections`，不排队、不延迟准入。
/// 计数器是会话之间唯一共享的可变状态，全部通过原子操作访问。
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// 活跃会话计数器及其上限
#[derive(Debug, Clone)]
pub struct AdmissionController {
    active: Arc<AtomicUsize>,
    max_connections: usize,
}

impl AdmissionController {
    pub fn new(max_connections: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// 尝试准入一个会话
    ///
    /// 未达上限时计数加一并返回 `true`；否则返回 `false` 且计数不变。
    pub fn try_admit(&self) -> bool {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max_connections {
                return false;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(next) => current = next,
            }
        }
    }

    /// 释放一个已准入的会话
    ///
    /// 计数永远不会变为负数：没有可释放的会话时只记录告警。
    pub fn release(&self) {
        if self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!("Admission release without a matching admit, ignoring");
        }
    }

    /// RAII 形式的准入：守卫被丢弃时恰好释放一次
    pub fn try_acquire(&self) -> Option<AdmissionGuard> {
        if self.try_admit() {
            Some(AdmissionGuard {
                controller: self.clone(),
            })
        } else {
            None
        }
    }

    /// 当前活跃会话数
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// RAII guard to release the admission slot exactly once
#[derive(Debug)]
pub struct AdmissionGuard {
    controller: AdmissionController,
}

impl AdmissionGuard {
    /// 当前活跃会话数（仅用于日志）
    pub fn active(&self) -> usize {
        self.controller.active()
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.controller.release();
    }
}
