//! 设备共享状态
//!
//! 采样线程与发送线程只通过 [`DeviceContext`] 交互：
//! 两个上行队列是唯一的共享可变数据，其余均为无锁快照或原子计数。

use crate::hooks::HookManager;
use crate::metrics::DeviceMetrics;
use crate::queue::OutboundQueues;
use arc_swap::ArcSwap;
use gaitwatch_protocol::MotionState;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 设备状态快照（采样线程每周期发布一次）
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub state: MotionState,
    /// 当前状态持续时长（秒）
    pub state_duration_secs: f64,
    pub is_walking: bool,
    pub walking_confidence: f64,
    /// 最近一次分类器输出
    pub last_fall_probability: Option<f64>,
    /// 已处理采样数
    pub samples: u64,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            state: MotionState::Daily,
            state_duration_secs: 0.0,
            is_walking: false,
            walking_confidence: 0.0,
            last_fall_probability: None,
            samples: 0,
        }
    }
}

/// 设备上下文
pub struct DeviceContext {
    pub user_id: String,
    pub queues: OutboundQueues,
    pub metrics: DeviceMetrics,
    pub hooks: RwLock<HookManager>,
    status: ArcSwap<DeviceStatus>,
    connected: AtomicBool,
}

impl DeviceContext {
    pub fn new(user_id: impl Into<String>, queues: OutboundQueues) -> Self {
        Self {
            user_id: user_id.into(),
            queues,
            metrics: DeviceMetrics::new(),
            hooks: RwLock::new(HookManager::new()),
            status: ArcSwap::from_pointee(DeviceStatus::default()),
            connected: AtomicBool::new(false),
        }
    }

    /// 最新状态快照（无锁）
    pub fn status(&self) -> Arc<DeviceStatus> {
        self.status.load_full()
    }

    pub(crate) fn publish(&self, status: DeviceStatus) {
        self.status.store(Arc::new(status));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_load() {
        let ctx = DeviceContext::new("pi", OutboundQueues::new(4, 4));
        assert_eq!(ctx.status().state, MotionState::Daily);
        assert!(!ctx.is_connected());

        ctx.publish(DeviceStatus {
            state: MotionState::Fall,
            samples: 42,
            ..Default::default()
        });
        ctx.set_connected(true);

        let status = ctx.status();
        assert_eq!(status.state, MotionState::Fall);
        assert_eq!(status.samples, 42);
        assert!(ctx.is_connected());
    }
}
