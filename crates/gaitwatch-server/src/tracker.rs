//! 每用户状态跟踪
//!
//! 服务端不重新推导运动状态，只镜像设备上报的状态标签并对转换做出反应。
//! 跟踪器本身只维护状态和步行会话；计时器与广播由
//! [`ConnectionManager`](crate::manager::ConnectionManager) 根据 [`StateChange`] 执行。

use gaitwatch_protocol::{MotionState, timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 步行会话
#[derive(Debug, Clone, PartialEq)]
pub struct WalkingSession {
    pub id: u64,
    pub started_at: Instant,
    pub start_time: String,
}

/// 一次状态转换及其附带效果
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub from: MotionState,
    pub to: MotionState,
    /// 新开启的步行会话
    pub session_opened: Option<WalkingSession>,
    /// 关闭的步行会话及其时长
    pub session_closed: Option<(WalkingSession, Duration)>,
}

impl StateChange {
    pub fn entered(&self, state: MotionState) -> bool {
        self.to == state && self.from != state
    }
}

/// 每用户状态跟踪器
#[derive(Debug, Clone)]
pub struct UserTracker {
    user_id: String,
    state: MotionState,
    state_since: Instant,
    last_update: String,
    fall_detected_time: Option<String>,
    session: Option<WalkingSession>,
}

impl UserTracker {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self::new_at(Instant::now(), user_id)
    }

    pub fn new_at(now: Instant, user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            state: MotionState::Daily,
            state_since: now,
            last_update: timestamp::now_string(),
            fall_detected_time: None,
            session: None,
        }
    }

    /// 应用设备上报的状态，返回状态是否改变
    pub fn apply_reported_state(&mut self, state: MotionState, now: Instant) -> bool {
        self.transition_at(now, state).is_some()
    }

    /// 应用设备上报的状态，返回转换详情
    ///
    /// 服务端升级后的 Emergency 不会被设备上报的 Fall 覆盖。
    pub fn transition_at(&mut self, now: Instant, reported: MotionState) -> Option<StateChange> {
        self.last_update = timestamp::now_string();

        if reported == self.state
            || (self.state == MotionState::Emergency && reported == MotionState::Fall)
        {
            return None;
        }

        let from = self.state;
        info!(
            "[{}] State transition: {} -> {}",
            self.user_id,
            from.label(),
            reported.label()
        );
        self.state = reported;
        self.state_since = now;

        if reported == MotionState::Fall {
            self.fall_detected_time = Some(timestamp::now_string());
        }

        let mut change = StateChange {
            from,
            to: reported,
            session_opened: None,
            session_closed: None,
        };

        if reported == MotionState::Walking && self.session.is_none() {
            let session = WalkingSession {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                started_at: now,
                start_time: timestamp::now_string(),
            };
            info!("[{}] Walking session {} started", self.user_id, session.id);
            self.session = Some(session.clone());
            change.session_opened = Some(session);
        } else if reported != MotionState::Walking {
            change.session_closed = self.close_session_at(now);
        }

        Some(change)
    }

    /// 服务端升级为 Emergency
    pub fn escalate_at(&mut self, now: Instant) -> Option<StateChange> {
        self.transition_at(now, MotionState::Emergency)
    }

    /// 关闭进行中的步行会话（断线时调用）
    pub fn close_session_at(&mut self, now: Instant) -> Option<(WalkingSession, Duration)> {
        let session = self.session.take()?;
        let duration = now.saturating_duration_since(session.started_at);
        info!(
            "[{}] Walking session {} ended after {:.1}s",
            self.user_id,
            session.id,
            duration.as_secs_f64()
        );
        Some((session, duration))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn state_duration_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state_since)
    }

    pub fn last_update(&self) -> &str {
        &self.last_update
    }

    pub fn fall_detected_time(&self) -> Option<&str> {
        self.fall_detected_time.as_deref()
    }

    pub fn walking_session(&self) -> Option<&WalkingSession> {
        self.session.as_ref()
    }
}
