//! 设备运行指标
//!
//! 原子计数器，任何线程都可以无锁读取。

use std::sync::atomic::{AtomicU64, Ordering};

/// 设备实时指标
///
/// # 使用示例
///
/// ```rust
/// use gaitwatch_driver::DeviceMetrics;
/// use std::sync::Arc;
/// use std::sync::atomic::Ordering;
///
/// let metrics = Arc::new(DeviceMetrics::default());
/// metrics.samples_total.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(metrics.snapshot().samples_total, 1);
/// ```
#[derive(Debug, Default)]
pub struct DeviceMetrics {
    /// 已处理的采样数
    pub samples_total: AtomicU64,
    /// 传感器读取失败次数
    pub sensor_errors: AtomicU64,
    /// 状态转换次数
    pub transitions: AtomicU64,
    /// 进入 Fall 的次数
    pub falls_detected: AtomicU64,

    /// 遥测入队数
    pub telemetry_enqueued: AtomicU64,
    /// 遥测队列溢出淘汰数（最旧的被丢弃）
    pub telemetry_evicted: AtomicU64,
    /// 遥测发送成功数
    pub telemetry_sent: AtomicU64,
    /// 断线期间丢弃的遥测数
    pub telemetry_discarded: AtomicU64,

    /// 告警入队数
    pub alerts_enqueued: AtomicU64,
    /// 告警队列满被拒绝次数（故障）
    ///
    /// 非零说明在紧急事件期间长时间断线。
    pub alerts_rejected: AtomicU64,
    /// 告警发送成功数
    pub alerts_sent: AtomicU64,
    /// 告警发送失败后重新入队次数
    pub alerts_requeued: AtomicU64,

    /// 建立连接成功次数
    pub connects: AtomicU64,
    /// 建立连接失败次数
    pub connect_failures: AtomicU64,
}

impl DeviceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// 获取指标快照
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            samples_total: self.samples_total.load(Ordering::Relaxed),
            sensor_errors: self.sensor_errors.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            falls_detected: self.falls_detected.load(Ordering::Relaxed),
            telemetry_enqueued: self.telemetry_enqueued.load(Ordering::Relaxed),
            telemetry_evicted: self.telemetry_evicted.load(Ordering::Relaxed),
            telemetry_sent: self.telemetry_sent.load(Ordering::Relaxed),
            telemetry_discarded: self.telemetry_discarded.load(Ordering::Relaxed),
            alerts_enqueued: self.alerts_enqueued.load(Ordering::Relaxed),
            alerts_rejected: self.alerts_rejected.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            alerts_requeued: self.alerts_requeued.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub samples_total: u64,
    pub sensor_errors: u64,
    pub transitions: u64,
    pub falls_detected: u64,
    pub telemetry_enqueued: u64,
    pub telemetry_evicted: u64,
    pub telemetry_sent: u64,
    pub telemetry_discarded: u64,
    pub alerts_enqueued: u64,
    pub alerts_rejected: u64,
    pub alerts_sent: u64,
    pub alerts_requeued: u64,
    pub connects: u64,
    pub connect_failures: u64,
}

impl MetricsSnapshot {
    /// 重连次数（首次连接不计）
    pub fn reconnects(&self) -> u64 {
        self.connects.saturating_sub(1)
    }

    /// 遥测投递率（%），未入队时为 0
    pub fn telemetry_delivery_rate(&self) -> f64 {
        if self.telemetry_enqueued == 0 {
            return 0.0;
        }
        (self.telemetry_sent as f64 / self.telemetry_enqueued as f64) * 100.0
    }
}
