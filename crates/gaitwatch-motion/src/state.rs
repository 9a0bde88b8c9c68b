//! 运动状态机
//!
//! 状态图：
//!
//! ```text
//! Daily ──(步行持续 walking_confirm)──▶ Walking ──(无步行持续 idle_confirm)──▶ Daily
//! Daily | Walking ──(跌倒判定，冷却已过)──▶ Fall ──(fall_recovery 后自动)──▶ Daily
//! Emergency：只能由服务端升级产生，本地不做任何转换
//! ```
//!
//! 每个分类周期调用一次 [`MotionStateMachine::evaluate_at`]，跌倒判定优先于步行转换。
//! 所有 (状态, 事件) 组合要么是定义好的转换，要么是空操作。

use crate::classifier::ClassifierVerdict;
use crate::config::StateMachineConfig;
use gaitwatch_protocol::{MotionState, StateInfo, timestamp};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 触发转换的依据
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransitionEvidence {
    /// 分类器跌倒判定
    FallVerdict { probability: f64 },
    /// 步行持续确认
    WalkingConfirmed { pending_secs: f64 },
    /// 空闲持续确认
    IdleConfirmed { idle_secs: f64 },
    /// 跌倒自动恢复
    FallRecovered { elapsed_secs: f64 },
}

/// 状态转换记录（只追加，交给外部存储）
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransitionRecord {
    pub from: MotionState,
    pub to: MotionState,
    /// 单调时钟时间
    pub at: Instant,
    /// 线上时间戳（KST）
    pub timestamp: String,
    pub evidence: TransitionEvidence,
}

/// 运动状态机
#[derive(Debug, Clone)]
pub struct MotionStateMachine {
    config: StateMachineConfig,
    state: MotionState,
    state_since: Instant,
    last_fall: Option<Instant>,
    pending_walking_since: Option<Instant>,
    idle_since: Option<Instant>,
}

impl MotionStateMachine {
    pub fn new(config: StateMachineConfig) -> Self {
        Self::new_at(Instant::now(), config)
    }

    pub fn new_at(now: Instant, config: StateMachineConfig) -> Self {
        info!("Motion state machine initialized: {}", MotionState::Daily);
        Self {
            config,
            state: MotionState::Daily,
            state_since: now,
            last_fall: None,
            pending_walking_since: None,
            idle_since: None,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    /// 当前状态持续时长
    pub fn state_duration_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state_since)
    }

    /// 跌倒冷却期是否已过
    pub fn can_detect_fall_at(&self, now: Instant) -> bool {
        match self.last_fall {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.config.fall_cooldown(),
        }
    }

    /// 正在确认中的步行时长
    pub fn pending_walking_at(&self, now: Instant) -> Option<Duration> {
        self.pending_walking_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// 随报文附带的状态上报
    pub fn state_info_at(&self, now: Instant) -> StateInfo {
        let mut info = StateInfo::new(
            self.state,
            self.state_duration_at(now).as_secs_f64(),
            self.can_detect_fall_at(now),
        );
        info.pending_walking = self.pending_walking_at(now).map(|d| d.as_secs_f64());
        info
    }

    /// 评估一个分类周期（使用当前时间）
    pub fn evaluate(
        &mut self,
        is_walking: bool,
        verdict: Option<&ClassifierVerdict>,
    ) -> Option<StateTransitionRecord> {
        self.evaluate_at(Instant::now(), is_walking, verdict)
    }

    /// 评估一个分类周期
    ///
    /// 发生转换时返回转换记录。
    pub fn evaluate_at(
        &mut self,
        now: Instant,
        is_walking: bool,
        verdict: Option<&ClassifierVerdict>,
    ) -> Option<StateTransitionRecord> {
        if let Some(v) = verdict.filter(|v| v.is_fall) {
            match self.state {
                MotionState::Daily | MotionState::Walking if self.can_detect_fall_at(now) => {
                    self.last_fall = Some(now);
                    self.pending_walking_since = None;
                    self.idle_since = None;
                    warn!(
                        "Fall detected: {} -> {} (p={:.2})",
                        self.state,
                        MotionState::Fall,
                        v.probability
                    );
                    return Some(self.transition(
                        now,
                        MotionState::Fall,
                        TransitionEvidence::FallVerdict {
                            probability: v.probability,
                        },
                    ));
                },
                // 冷却期内或已处于 Fall / Emergency：忽略，继续走常规规则
                _ => {},
            }
        }

        match self.state {
            MotionState::Daily => {
                if !is_walking {
                    self.pending_walking_since = None;
                    return None;
                }
                let since = *self.pending_walking_since.get_or_insert(now);
                let pending = now.saturating_duration_since(since);
                if pending >= self.config.walking_confirm() {
                    self.pending_walking_since = None;
                    self.idle_since = None;
                    return Some(self.transition(
                        now,
                        MotionState::Walking,
                        TransitionEvidence::WalkingConfirmed {
                            pending_secs: pending.as_secs_f64(),
                        },
                    ));
                }
                None
            },
            MotionState::Walking => {
                if is_walking {
                    self.idle_since = None;
                    return None;
                }
                let since = *self.idle_since.get_or_insert(now);
                let idle = now.saturating_duration_since(since);
                if idle >= self.config.idle_confirm() {
                    self.idle_since = None;
                    return Some(self.transition(
                        now,
                        MotionState::Daily,
                        TransitionEvidence::IdleConfirmed {
                            idle_secs: idle.as_secs_f64(),
                        },
                    ));
                }
                None
            },
            MotionState::Fall => {
                let elapsed = self.state_duration_at(now);
                if elapsed >= self.config.fall_recovery() {
                    return Some(self.transition(
                        now,
                        MotionState::Daily,
                        TransitionEvidence::FallRecovered {
                            elapsed_secs: elapsed.as_secs_f64(),
                        },
                    ));
                }
                None
            },
            MotionState::Emergency => None,
        }
    }

    fn transition(
        &mut self,
        now: Instant,
        to: MotionState,
        evidence: TransitionEvidence,
    ) -> StateTransitionRecord {
        let from = self.state;
        self.state = to;
        self.state_since = now;
        if to != MotionState::Fall {
            info!("State transition: {} -> {}", from, to);
        }
        StateTransitionRecord {
            from,
            to,
            at: now,
            timestamp: timestamp::now_string(),
            evidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FALL: ClassifierVerdict = ClassifierVerdict {
        probability: 0.92,
        is_fall: true,
    };

    fn at(t0: Instant, secs: f64) -> Instant {
        t0 + Duration::from_secs_f64(secs)
    }

    fn machine(t0: Instant) -> MotionStateMachine {
        MotionStateMachine::new_at(t0, StateMachineConfig::default())
    }

    /// 以 100 ms 周期从 `from` 跑到 `to`，返回途中发生的转换
    fn run(
        sm: &mut MotionStateMachine,
        t0: Instant,
        from: f64,
        to: f64,
        walking: bool,
    ) -> Vec<StateTransitionRecord> {
        let mut out = Vec::new();
        let mut t = from;
        while t <= to + 1e-9 {
            out.extend(sm.evaluate_at(at(t0, t), walking, None));
            t += 0.1;
        }
        out
    }

    #[test]
    fn test_walking_requires_confirmation() {
        let t0 = Instant::now();
        let mut sm = machine(t0);

        // 短暂活动后中断，不进入步行
        assert!(run(&mut sm, t0, 0.0, 2.0, true).is_empty());
        assert!(run(&mut sm, t0, 2.1, 2.5, false).is_empty());
        assert_eq!(sm.state(), MotionState::Daily);
        assert!(sm.pending_walking_at(at(t0, 2.5)).is_none());

        let transitions = run(&mut sm, t0, 3.0, 6.5, true);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, MotionState::Daily);
        assert_eq!(transitions[0].to, MotionState::Walking);
        assert_eq!(sm.state(), MotionState::Walking);
    }

    #[test]
    fn test_short_pause_keeps_walking() {
        let t0 = Instant::now();
        let mut sm = machine(t0);
        run(&mut sm, t0, 0.0, 3.5, true);
        assert_eq!(sm.state(), MotionState::Walking);

        assert!(run(&mut sm, t0, 4.0, 10.0, false).is_empty());
        assert!(run(&mut sm, t0, 10.1, 11.0, true).is_empty());
        // 空闲计时从最近一次停止步行开始
        assert!(run(&mut sm, t0, 11.1, 18.9, false).is_empty());
        let back = run(&mut sm, t0, 19.0, 19.5, false);
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].to, MotionState::Daily);
        assert!(matches!(
            back[0].evidence,
            TransitionEvidence::IdleConfirmed { idle_secs } if idle_secs >= 8.0
        ));
    }

    #[test]
    fn test_fall_has_priority_and_recovers() {
        let t0 = Instant::now();
        let mut sm = machine(t0);
        run(&mut sm, t0, 0.0, 3.5, true);

        let record = sm.evaluate_at(at(t0, 4.0), true, Some(&FALL)).unwrap();
        assert_eq!(record.from, MotionState::Walking);
        assert_eq!(record.to, MotionState::Fall);
        assert!(!sm.can_detect_fall_at(at(t0, 5.0)));

        assert!(sm.evaluate_at(at(t0, 8.9), true, None).is_none());
        let recovered = sm.evaluate_at(at(t0, 9.0), true, None).unwrap();
        assert_eq!(recovered.to, MotionState::Daily);
    }

    #[test]
    fn test_fall_cooldown_accepts_once() {
        let t0 = Instant::now();
        let mut sm = machine(t0);

        let accepted: Vec<_> = [0.0, 0.5, 6.0, 9.9]
            .iter()
            .filter_map(|&t| sm.evaluate_at(at(t0, t), false, Some(&FALL)))
            .filter(|r| r.to == MotionState::Fall)
            .collect();
        assert_eq!(accepted.len(), 1);

        // 冷却期过后再次接受
        let again = sm.evaluate_at(at(t0, 10.5), false, Some(&FALL)).unwrap();
        assert_eq!(again.to, MotionState::Fall);
    }

    #[test]
    fn test_non_fall_verdict_is_ignored() {
        let t0 = Instant::now();
        let mut sm = machine(t0);
        let verdict = ClassifierVerdict {
            probability: 0.3,
            is_fall: false,
        };
        assert!(sm.evaluate_at(t0, false, Some(&verdict)).is_none());
        assert!(sm.can_detect_fall_at(t0));
    }

    #[test]
    fn test_low_confidence_for_100_cycles_stays_daily() {
        let t0 = Instant::now();
        let mut sm = machine(t0);
        for i in 0..100 {
            assert!(sm.evaluate_at(at(t0, i as f64 * 0.05), false, None).is_none());
        }
        assert_eq!(sm.state(), MotionState::Daily);
    }

    #[test]
    fn test_state_info_reports_pending() {
        let t0 = Instant::now();
        let mut sm = machine(t0);
        sm.evaluate_at(t0, true, None);
        let info = sm.state_info_at(at(t0, 1.5));
        assert_eq!(info.state, "Idle");
        assert!(info.can_detect_fall);
        assert!((info.pending_walking.unwrap() - 1.5).abs() < 1e-6);
    }
}
