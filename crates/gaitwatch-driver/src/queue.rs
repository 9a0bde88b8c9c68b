//! 上行事件队列
//!
//! 两个独立的有界队列，丢失策略不同：
//!
//! | 队列 | 溢出策略 | 语义 |
//! |------|----------|------|
//! | 遥测 | 淘汰最旧的 | 只关心最新状态，过期采样无价值 |
//! | 告警 | 拒绝并记录故障 | 告警不可静默丢失 |
//!
//! 发送侧总是先清空告警队列，再处理遥测（绝对优先级）。

use crate::error::DriverError;
use gaitwatch_protocol::OutboundEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::error;

/// 遥测队列（溢出时淘汰最旧）
#[derive(Debug)]
pub struct TelemetryQueue {
    capacity: usize,
    inner: Mutex<VecDeque<OutboundEvent>>,
}

impl TelemetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// 入队，返回被淘汰的最旧事件（如有）
    pub fn push(&self, event: OutboundEvent) -> Option<OutboundEvent> {
        let mut queue = self.inner.lock();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(event);
        evicted
    }

    pub fn pop(&self) -> Option<OutboundEvent> {
        self.inner.lock().pop_front()
    }

    /// 清空队列，返回丢弃的数量
    pub fn clear(&self) -> usize {
        let mut queue = self.inner.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// 告警队列（溢出时拒绝）
#[derive(Debug)]
pub struct AlertQueue {
    capacity: usize,
    inner: Mutex<VecDeque<OutboundEvent>>,
}

impl AlertQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// 入队；队列已满时拒绝并记录故障
    pub fn push(&self, event: OutboundEvent) -> Result<(), DriverError> {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            error!(
                "Alert queue full ({} pending), rejecting {} alert",
                queue.len(),
                event.wire_type()
            );
            return Err(DriverError::AlertQueueFull {
                capacity: self.capacity,
            });
        }
        queue.push_back(event);
        Ok(())
    }

    /// 发送失败后放回队首
    ///
    /// 重新入队的事件刚从本队列取出，不受容量限制。
    pub fn push_front(&self, event: OutboundEvent) {
        self.inner.lock().push_front(event);
    }

    pub fn pop(&self) -> Option<OutboundEvent> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// 一对上行队列
#[derive(Debug)]
pub struct OutboundQueues {
    pub telemetry: TelemetryQueue,
    pub alerts: AlertQueue,
}

impl OutboundQueues {
    pub fn new(telemetry_capacity: usize, alert_capacity: usize) -> Self {
        Self {
            telemetry: TelemetryQueue::new(telemetry_capacity),
            alerts: AlertQueue::new(alert_capacity),
        }
    }

    /// 下一个待发送事件：告警优先，告警队列为空时才取遥测
    pub fn pop_next(&self) -> Option<OutboundEvent> {
        self.alerts.pop().or_else(|| self.telemetry.pop())
    }

    pub fn pending(&self) -> (usize, usize) {
        (self.telemetry.len(), self.alerts.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use gaitwatch_protocol::{FallFrame, FallPayload, SensorSample, TelemetryFrame};

    pub(crate) fn telemetry(n: u32) -> OutboundEvent {
        let sample = SensorSample::from_array([n as f64, 0.0, 1.0, 0.0, 0.0, 0.0]);
        OutboundEvent::Telemetry(TelemetryFrame {
            reading: sample.to_reading("pi", format!("t{}", n)),
            state_info: None,
        })
    }

    pub(crate) fn fall(p: f64) -> OutboundEvent {
        let sample = SensorSample::default();
        OutboundEvent::AlertFall(FallFrame {
            payload: FallPayload::new("pi", p, sample.sensor_data()),
            state_info: None,
        })
    }

    fn seq(event: &OutboundEvent) -> f64 {
        match event {
            OutboundEvent::Telemetry(frame) => frame.reading.acc_x,
            _ => -1.0,
        }
    }

    #[test]
    fn test_telemetry_evicts_oldest() {
        let queue = TelemetryQueue::new(3);
        assert!(queue.push(telemetry(1)).is_none());
        assert!(queue.push(telemetry(2)).is_none());
        assert!(queue.push(telemetry(3)).is_none());
        let evicted = queue.push(telemetry(4)).unwrap();
        assert_eq!(seq(&evicted), 1.0);

        let remaining: Vec<f64> = std::iter::from_fn(|| queue.pop()).map(|e| seq(&e)).collect();
        assert_eq!(remaining, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_alert_rejects_when_full() {
        let queue = AlertQueue::new(2);
        queue.push(fall(0.9)).unwrap();
        queue.push(fall(0.8)).unwrap();
        assert!(matches!(
            queue.push(fall(0.7)),
            Err(DriverError::AlertQueueFull { capacity: 2 })
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_requeue_goes_to_front() {
        let queue = AlertQueue::new(1);
        queue.push(fall(0.6)).unwrap();
        let first = queue.pop().unwrap();
        queue.push(fall(0.95)).unwrap();
        queue.push_front(first.clone());
        assert_eq!(queue.pop().unwrap(), first);
    }

    #[test]
    fn test_alerts_drain_before_telemetry() {
        let queues = OutboundQueues::new(10, 10);
        queues.telemetry.push(telemetry(1));
        queues.telemetry.push(telemetry(2));
        queues.alerts.push(fall(0.9)).unwrap();
        queues.telemetry.push(telemetry(3));
        queues.alerts.push(fall(0.8)).unwrap();

        let order: Vec<bool> = std::iter::from_fn(|| queues.pop_next())
            .map(|e| e.is_alert())
            .collect();
        assert_eq!(order, vec![true, true, false, false, false]);
    }
}
