//! 紧急监控
//!
//! 跌倒后为用户布防一个计时器；周期扫描时，超过宽限期的计时器被移除并升级为 CRITICAL。
//! 两个外部覆盖：
//! - 用户确认无恙：撤防，永不升级
//! - 用户确认需要帮助：立即升级（即使宽限期未到）

use gaitwatch_protocol::{ArmedTimer, EmergencyLevel, timestamp};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 已布防的紧急计时器
#[derive(Debug, Clone, PartialEq)]
pub struct EmergencyTimer {
    pub armed_at: Instant,
    /// 布防时刻（线上时间戳）
    pub fall_time: String,
}

/// 升级原因
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationCause {
    /// 宽限期内未恢复
    Timeout,
    /// 用户确认需要帮助
    HelpConfirmed { help_type: String },
}

/// 升级事件
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub user_id: String,
    /// 跌倒到升级经过的时长
    pub elapsed: Duration,
    pub fall_time: String,
    pub cause: EscalationCause,
}

impl Escalation {
    pub fn duration_seconds(&self) -> u64 {
        self.elapsed.as_secs()
    }
}

/// 撤防结果
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub user_id: String,
    pub elapsed: Duration,
    pub fall_time: String,
}

/// 紧急监控
#[derive(Debug, Clone)]
pub struct EmergencyMonitor {
    grace: Duration,
    timers: HashMap<String, EmergencyTimer>,
}

impl EmergencyMonitor {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            timers: HashMap::new(),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// 布防；已布防时保留最初的跌倒时刻，返回 false
    pub fn arm_at(&mut self, user_id: &str, now: Instant) -> bool {
        if self.timers.contains_key(user_id) {
            return false;
        }
        self.timers.insert(
            user_id.to_string(),
            EmergencyTimer {
                armed_at: now,
                fall_time: timestamp::now_string(),
            },
        );
        true
    }

    /// 撤防（恢复或断线）
    pub fn disarm(&mut self, user_id: &str) -> Option<EmergencyTimer> {
        self.timers.remove(user_id)
    }

    /// 用户确认无恙：撤防，不升级
    pub fn resolve_at(&mut self, user_id: &str, now: Instant) -> Option<Resolution> {
        let timer = self.timers.remove(user_id)?;
        Some(Resolution {
            user_id: user_id.to_string(),
            elapsed: now.saturating_duration_since(timer.armed_at),
            fall_time: timer.fall_time,
        })
    }

    /// 用户确认需要帮助：立即升级并移除计时器
    ///
    /// 没有布防的计时器时也会升级，时长记为 1 秒。
    pub fn confirm_help_at(&mut self, user_id: &str, help_type: &str, now: Instant) -> Escalation {
        let (elapsed, fall_time) = match self.timers.remove(user_id) {
            Some(timer) => (now.saturating_duration_since(timer.armed_at), timer.fall_time),
            None => (Duration::from_secs(1), timestamp::now_string()),
        };
        Escalation {
            user_id: user_id.to_string(),
            elapsed,
            fall_time,
            cause: EscalationCause::HelpConfirmed {
                help_type: help_type.to_string(),
            },
        }
    }

    /// 周期扫描：移除并返回所有超过宽限期的计时器
    pub fn sweep_at(&mut self, now: Instant) -> Vec<Escalation> {
        let expired: Vec<String> = self
            .timers
            .iter()
            .filter(|(_, timer)| now.saturating_duration_since(timer.armed_at) >= self.grace)
            .map(|(user_id, _)| user_id.clone())
            .collect();

        let mut escalations = Vec::with_capacity(expired.len());
        for user_id in expired {
            if let Some(timer) = self.timers.remove(&user_id) {
                escalations.push(Escalation {
                    elapsed: now.saturating_duration_since(timer.armed_at),
                    fall_time: timer.fall_time,
                    user_id,
                    cause: EscalationCause::Timeout,
                });
            }
        }
        escalations.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        escalations
    }

    /// （已过时长，距离升级剩余时长）
    pub fn timer_at(&self, user_id: &str, now: Instant) -> Option<(Duration, Duration)> {
        let timer = self.timers.get(user_id)?;
        let elapsed = now.saturating_duration_since(timer.armed_at);
        Some((elapsed, self.grace.saturating_sub(elapsed)))
    }

    /// 所有已布防计时器的概览
    pub fn overview_at(&self, now: Instant) -> Vec<ArmedTimer> {
        let mut timers: Vec<ArmedTimer> = self
            .timers
            .iter()
            .map(|(user_id, timer)| {
                let elapsed = now.saturating_duration_since(timer.armed_at);
                ArmedTimer {
                    user_id: user_id.clone(),
                    elapsed_seconds: elapsed.as_secs_f64(),
                    time_until_critical: self.grace.saturating_sub(elapsed).as_secs_f64(),
                    emergency_level: EmergencyLevel::Monitoring,
                }
            })
            .collect();
        timers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        timers
    }

    pub fn is_armed(&self, user_id: &str) -> bool {
        self.timers.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(t0: Instant, secs: u64) -> Instant {
        t0 + Duration::from_secs(secs)
    }

    #[test]
    fn test_escalates_once_after_grace() {
        let t0 = Instant::now();
        let mut monitor = EmergencyMonitor::new(Duration::from_secs(15));
        assert!(monitor.arm_at("pi", t0));

        assert!(monitor.sweep_at(at(t0, 5)).is_empty());
        assert!(monitor.sweep_at(at(t0, 10)).is_empty());

        let escalations = monitor.sweep_at(at(t0, 16));
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].user_id, "pi");
        assert_eq!(escalations[0].duration_seconds(), 16);
        assert_eq!(escalations[0].cause, EscalationCause::Timeout);
        assert!(!monitor.is_armed("pi"));

        assert!(monitor.sweep_at(at(t0, 30)).is_empty());
    }

    #[test]
    fn test_rearm_keeps_original_time() {
        let t0 = Instant::now();
        let mut monitor = EmergencyMonitor::new(Duration::from_secs(15));
        monitor.arm_at("pi", t0);
        assert!(!monitor.arm_at("pi", at(t0, 10)));
        assert_eq!(monitor.sweep_at(at(t0, 15)).len(), 1);
    }

    #[test]
    fn test_resolved_never_escalates() {
        let t0 = Instant::now();
        let mut monitor = EmergencyMonitor::new(Duration::from_secs(15));
        monitor.arm_at("pi", t0);

        let resolution = monitor.resolve_at("pi", at(t0, 20)).unwrap();
        assert_eq!(resolution.elapsed, Duration::from_secs(20));
        assert!(monitor.sweep_at(at(t0, 60)).is_empty());
        assert!(monitor.resolve_at("pi", at(t0, 61)).is_none());
    }

    #[test]
    fn test_confirm_help_escalates_immediately() {
        let t0 = Instant::now();
        let mut monitor = EmergencyMonitor::new(Duration::from_secs(15));
        monitor.arm_at("pi", t0);

        let escalation = monitor.confirm_help_at("pi", "medical", at(t0, 3));
        assert_eq!(escalation.duration_seconds(), 3);
        assert!(matches!(
            escalation.cause,
            EscalationCause::HelpConfirmed { ref help_type } if help_type == "medical"
        ));
        assert!(monitor.sweep_at(at(t0, 30)).is_empty());
    }

    #[test]
    fn test_confirm_help_without_timer() {
        let t0 = Instant::now();
        let mut monitor = EmergencyMonitor::new(Duration::from_secs(15));
        let escalation = monitor.confirm_help_at("pi", "general_help", t0);
        assert_eq!(escalation.duration_seconds(), 1);
    }

    #[test]
    fn test_overview() {
        let t0 = Instant::now();
        let mut monitor = EmergencyMonitor::new(Duration::from_secs(15));
        monitor.arm_at("b", t0);
        monitor.arm_at("a", at(t0, 4));

        let overview = monitor.overview_at(at(t0, 10));
        assert_eq!(overview.len(), 2);
        assert_eq!(overview[0].user_id, "a");
        assert_eq!(overview[0].elapsed_seconds, 6.0);
        assert_eq!(overview[1].time_until_critical, 5.0);
        assert_eq!(monitor.timer_at("a", at(t0, 10)), Some((Duration::from_secs(6), Duration::from_secs(9))));
    }
}
