//! 连接管理器
//!
//! 持有所有会话、状态跟踪器、遥测批缓冲和紧急监控，统一放在一把互斥锁后面。
//! 每个连接线程一次处理一条报文；需要广播或写存储的效果在锁内计算，解锁后执行。
//!
//! 紧急监控线程在第一个连接注册时启动，最后一个连接断开时取消。

use crate::broadcast::{Broadcaster, Observer};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::monitor::{EmergencyMonitor, Escalation, EscalationCause};
use crate::store::{StoreRecord, StoreWriter};
use crate::tracker::{StateChange, UserTracker};
use crossbeam_channel::{RecvTimeoutError, Sender};
use gaitwatch_protocol::{
    ArmedTimer, EmergencyConfirmedCritical, EmergencyDeclared, EmergencyLevel, EmergencyResolved,
    FallAlert, FallPayload, ImuReading, InboundMessage, MotionState, Register, Role, ServerMessage,
    StateInfo, UserStatus, timestamp,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 连接处理后续动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// 一个已注册的会话
#[derive(Clone)]
pub struct Session {
    pub user_id: String,
    pub role: Role,
    pub observer: Arc<dyn Observer>,
}

struct SessionEntry {
    role: Role,
    observer: Arc<dyn Observer>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, SessionEntry>,
    trackers: HashMap<String, UserTracker>,
    batches: HashMap<String, Vec<ImuReading>>,
}

/// 在锁外执行的效果
#[derive(Default)]
struct Effects {
    records: Vec<StoreRecord>,
    broadcasts: Vec<ServerMessage>,
}

/// 触发跌倒状态的报文上下文
enum FallSource<'a> {
    Payload(&'a FallPayload),
    Reading(&'a ImuReading),
}

struct MonitorTask {
    cancel: Sender<()>,
}

/// 连接管理器
pub struct ConnectionManager {
    config: ServerConfig,
    registry: Mutex<Registry>,
    monitor: Mutex<EmergencyMonitor>,
    broadcaster: Broadcaster,
    store: StoreWriter,
    monitor_task: Mutex<Option<MonitorTask>>,
    weak_self: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(config: ServerConfig, store: StoreWriter) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            monitor: Mutex::new(EmergencyMonitor::new(config.grace_period())),
            config,
            registry: Mutex::new(Registry::default()),
            broadcaster: Broadcaster::new(),
            store,
            monitor_task: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &StoreWriter {
        &self.store
    }

    // ==================== 生命周期 ====================

    /// 注册会话
    ///
    /// 同一用户 ID 已有会话时先拆除旧会话。设备角色获得状态跟踪器；
    /// 所有会话都会接收广播。
    pub fn connect(&self, register: Register, observer: Arc<dyn Observer>) -> Session {
        let Register { user_id, role } = register;
        let now = Instant::now();
        let mut effects = Effects::default();

        // 查找旧会话与插入新会话必须在同一次加锁内完成
        let (replaced, current_state) = {
            let mut reg = self.registry.lock();
            let replaced = self.remove_session_locked(&mut reg, &user_id, now, &mut effects);
            reg.sessions.insert(
                user_id.clone(),
                SessionEntry {
                    role,
                    observer: observer.clone(),
                },
            );
            if role == Role::Device {
                reg.trackers
                    .insert(user_id.clone(), UserTracker::new_at(now, user_id.clone()));
                reg.batches.insert(user_id.clone(), Vec::new());
            }
            self.broadcaster.add(observer.clone());
            let current_state = reg
                .trackers
                .get(&user_id)
                .map(|t| t.state())
                .unwrap_or_default();
            (replaced, current_state)
        };

        if let Some(previous) = replaced {
            warn!(
                "User '{}' registered again, tearing down previous session",
                user_id
            );
            previous.observer.close();
        }
        self.store.submit_all(effects.records);
        self.ensure_monitor();
        info!("User '{}' connected as {:?}", user_id, role);

        let session = Session {
            user_id: user_id.clone(),
            role,
            observer,
        };
        self.reply(
            &session,
            &ServerMessage::ConnectionEstablished {
                user_id,
                current_state,
                message: "connection established".to_string(),
            },
        );
        session
    }

    /// 断开会话并同步清理跟踪器、批缓冲和计时器
    ///
    /// 只有 `observer_id` 与当前注册的会话一致时才生效（旧会话的迟到清理不影响新会话）。
    pub fn disconnect(&self, user_id: &str, observer_id: u64) -> bool {
        let now = Instant::now();
        let mut effects = Effects::default();

        let (entry, now_empty) = {
            let mut reg = self.registry.lock();
            match reg.sessions.get(user_id) {
                Some(entry) if entry.observer.id() == observer_id => {},
                _ => return false,
            }
            let entry = self.remove_session_locked(&mut reg, user_id, now, &mut effects);
            (entry, reg.sessions.is_empty())
        };

        if let Some(entry) = entry {
            entry.observer.close();
        }
        self.store.submit_all(effects.records);
        info!("User '{}' disconnected", user_id);

        if now_empty {
            self.stop_monitor_if_idle();
        }
        true
    }

    /// 移除会话及其广播订阅、跟踪器、批缓冲和计时器（调用方持有注册表锁）
    fn remove_session_locked(
        &self,
        reg: &mut Registry,
        user_id: &str,
        now: Instant,
        effects: &mut Effects,
    ) -> Option<SessionEntry> {
        let entry = reg.sessions.remove(user_id)?;
        self.broadcaster.remove(entry.observer.id());

        if let Some(mut tracker) = reg.trackers.remove(user_id)
            && let Some((session, duration)) = tracker.close_session_at(now)
        {
            effects.records.push(StoreRecord::WalkingSessionEnded {
                user_id: user_id.to_string(),
                session_id: session.id,
                end_time: timestamp::now_string(),
                duration_seconds: duration.as_secs(),
            });
        }
        if let Some(batch) = reg.batches.remove(user_id)
            && !batch.is_empty()
        {
            info!(
                "Flushing {} buffered telemetry record(s) for '{}'",
                batch.len(),
                user_id
            );
            effects
                .records
                .extend(batch.into_iter().map(StoreRecord::ImuData));
        }
        if self.monitor.lock().disarm(user_id).is_some() {
            info!("Emergency timer for '{}' removed with its session", user_id);
        }
        Some(entry)
    }

    /// 关闭所有会话；各连接线程读到 EOF 后自行完成清理
    pub fn close_all(&self) {
        let observers: Vec<Arc<dyn Observer>> = self
            .registry
            .lock()
            .sessions
            .values()
            .map(|entry| entry.observer.clone())
            .collect();
        for observer in observers {
            observer.close();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.registry.lock().sessions.contains_key(user_id)
    }

    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        self.registry.lock().sessions.get(user_id).map(|e| e.role)
    }

    // ==================== 紧急监控线程 ====================

    /// 监控线程是否在运行
    pub fn monitor_running(&self) -> bool {
        self.monitor_task.lock().is_some()
    }

    fn ensure_monitor(&self) {
        let mut task = self.monitor_task.lock();
        if task.is_some() {
            return;
        }

        let (cancel, cancelled) = crossbeam_channel::bounded::<()>(0);
        let weak = self.weak_self.clone();
        let interval = self.config.sweep_interval();
        let spawned = std::thread::Builder::new()
            .name("gw-monitor".into())
            .spawn(move || {
                loop {
                    match cancelled.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {},
                        // 发送端被丢弃即为取消
                        _ => break,
                    }
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    manager.run_sweep();
                }
                debug!("Emergency monitor thread exited");
            });

        match spawned {
            Ok(_) => {
                info!(
                    "Emergency monitor started (sweep {:?}, grace {:?})",
                    interval,
                    self.config.grace_period()
                );
                *task = Some(MonitorTask { cancel });
            },
            Err(e) => error!("Failed to start emergency monitor: {}", e),
        }
    }

    fn stop_monitor_if_idle(&self) {
        let mut task = self.monitor_task.lock();
        if !self.registry.lock().sessions.is_empty() {
            return;
        }
        if let Some(MonitorTask { cancel }) = task.take() {
            drop(cancel);
            info!("All connections closed, emergency monitor stopped");
        }
    }

    /// 执行一次扫描，返回升级数量
    pub fn run_sweep(&self) -> usize {
        self.run_sweep_at(Instant::now())
    }

    pub fn run_sweep_at(&self, now: Instant) -> usize {
        let escalations = self.monitor.lock().sweep_at(now);
        if escalations.is_empty() {
            return 0;
        }

        let mut effects = Effects::default();
        {
            let mut reg = self.registry.lock();
            for escalation in escalations.iter() {
                if let Some(tracker) = reg.trackers.get_mut(&escalation.user_id)
                    && let Some(change) = tracker.escalate_at(now)
                {
                    effects.records.push(state_record(&escalation.user_id, &change, None));
                }
            }
        }

        for escalation in escalations.iter() {
            error!(
                "EMERGENCY: '{}' has not recovered {}s after a fall",
                escalation.user_id,
                escalation.duration_seconds()
            );
            effects.records.push(emergency_record(escalation));
            effects
                .broadcasts
                .push(ServerMessage::EmergencyDeclared(EmergencyDeclared {
                    user_id: escalation.user_id.clone(),
                    message: format!(
                        "Emergency! user {} has not moved for {} seconds",
                        escalation.user_id,
                        escalation.duration_seconds()
                    ),
                    duration_seconds: escalation.duration_seconds(),
                    emergency_level: EmergencyLevel::Critical,
                    timestamp: timestamp::now_string(),
                }));
        }

        let count = escalations.len();
        self.apply(effects);
        count
    }

    // ==================== 报文处理 ====================

    /// 处理一行入站文本
    pub fn handle_line(&self, session: &Session, line: &str) -> Flow {
        self.handle_line_at(Instant::now(), session, line)
    }

    pub fn handle_line_at(&self, now: Instant, session: &Session, line: &str) -> Flow {
        let message = match InboundMessage::decode(line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Rejected message from '{}': {}", session.user_id, e);
                self.reply(
                    session,
                    &ServerMessage::Error {
                        message: e.to_string(),
                    },
                );
                return Flow::Continue;
            },
        };

        match message {
            InboundMessage::Ping => self.reply(session, &ServerMessage::Pong),
            InboundMessage::Disconnect => {
                self.reply(session, &ServerMessage::DisconnectAck);
                return Flow::Close;
            },
            InboundMessage::Register(_) => self.reply(
                session,
                &ServerMessage::Error {
                    message: "session already registered".to_string(),
                },
            ),
            InboundMessage::Telemetry {
                reading,
                state_info,
            } => self.handle_telemetry_at(now, session, reading, state_info),
            InboundMessage::Fall {
                payload,
                state_info,
            } => self.handle_fall_at(now, session, payload, state_info),
            InboundMessage::ResolveEmergency {
                user_id,
                resolution_type,
            } => {
                let target = user_id.unwrap_or_else(|| session.user_id.clone());
                if !self.resolve_emergency_at(now, &target, &resolution_type) {
                    self.reply(
                        session,
                        &ServerMessage::Error {
                            message: format!("no active emergency for {}", target),
                        },
                    );
                }
            },
            InboundMessage::ConfirmHelpNeeded { user_id, help_type } => {
                let target = user_id.unwrap_or_else(|| session.user_id.clone());
                self.confirm_help_needed_at(now, &target, &help_type);
            },
            InboundMessage::GetStatus { user_id } => {
                let target = user_id.unwrap_or_else(|| session.user_id.clone());
                let status = self.user_status_at(now, &target);
                self.reply(session, &ServerMessage::Status(status));
            },
            InboundMessage::MonitorOverview => {
                let overview = self.monitor_overview_at(now);
                self.reply(session, &ServerMessage::MonitorOverview(overview));
            },
        }
        Flow::Continue
    }

    fn handle_telemetry_at(
        &self,
        now: Instant,
        session: &Session,
        mut reading: ImuReading,
        state_info: Option<StateInfo>,
    ) {
        if reading.user_id.is_empty() {
            reading.user_id = session.user_id.clone();
        }
        let user_id = session.user_id.as_str();
        let mut effects = Effects::default();

        let current_state = {
            let mut reg = self.registry.lock();
            if let Some(state) = reported_state(user_id, state_info.as_ref()) {
                self.apply_state_locked(
                    &mut reg,
                    now,
                    user_id,
                    state,
                    state_info.as_ref(),
                    FallSource::Reading(&reading),
                    &mut effects,
                );
            }

            let batch_size = self.config.telemetry_batch_size;
            if let Some(batch) = reg.batches.get_mut(user_id) {
                batch.push(reading.clone());
                if batch.len() >= batch_size {
                    debug!("Flushing telemetry batch for '{}'", user_id);
                    effects
                        .records
                        .extend(batch.drain(..).map(StoreRecord::ImuData));
                }
            } else {
                effects.records.push(StoreRecord::ImuData(reading.clone()));
            }

            reg.trackers
                .get(user_id)
                .map(|t| (t.state(), t.state_duration_at(now).as_secs_f64()))
        };

        self.apply(effects);
        self.reply(
            session,
            &ServerMessage::ImuDataReceived {
                data: reading,
                sampling_rate: self.config.sampling_rate_hz,
                current_state,
            },
        );
    }

    fn handle_fall_at(
        &self,
        now: Instant,
        session: &Session,
        mut payload: FallPayload,
        state_info: Option<StateInfo>,
    ) {
        if payload.user_id.is_empty() {
            payload.user_id = session.user_id.clone();
        }
        let user_id = session.user_id.as_str();
        warn!(
            "Fall reported by '{}' (confidence {:.2})",
            user_id, payload.confidence_score
        );

        let mut effects = Effects::default();
        effects.records.push(StoreRecord::FallData(payload.clone()));

        {
            let mut reg = self.registry.lock();
            let reported = reported_state(user_id, state_info.as_ref())
                .filter(|s| matches!(s, MotionState::Fall | MotionState::Emergency))
                .unwrap_or(MotionState::Fall);
            self.apply_state_locked(
                &mut reg,
                now,
                user_id,
                reported,
                state_info.as_ref(),
                FallSource::Payload(&payload),
                &mut effects,
            );
        }

        self.apply(effects);
    }

    /// 在持锁状态下应用上报状态，并把效果累积到 `effects`
    #[allow(clippy::too_many_arguments)]
    fn apply_state_locked(
        &self,
        reg: &mut Registry,
        now: Instant,
        user_id: &str,
        state: MotionState,
        state_info: Option<&StateInfo>,
        source: FallSource<'_>,
        effects: &mut Effects,
    ) {
        let change = match reg.trackers.get_mut(user_id) {
            Some(tracker) => tracker.transition_at(now, state),
            // 未跟踪的会话（观察端）上报跌倒：仍然布防并广播
            None if state == MotionState::Fall => Some(StateChange {
                from: MotionState::Daily,
                to: MotionState::Fall,
                session_opened: None,
                session_closed: None,
            }),
            None => None,
        };
        let Some(change) = change else {
            return;
        };

        effects
            .records
            .push(state_record(user_id, &change, state_info.cloned()));
        if let Some(session) = change.session_opened.as_ref() {
            effects.records.push(StoreRecord::WalkingSessionStarted {
                user_id: user_id.to_string(),
                session_id: session.id,
                start_time: session.start_time.clone(),
            });
        }
        if let Some((session, duration)) = change.session_closed.as_ref() {
            effects.records.push(StoreRecord::WalkingSessionEnded {
                user_id: user_id.to_string(),
                session_id: session.id,
                end_time: timestamp::now_string(),
                duration_seconds: duration.as_secs(),
            });
        }

        if change.entered(MotionState::Fall) {
            if self.monitor.lock().arm_at(user_id, now) {
                warn!(
                    "Emergency timer armed for '{}' ({:?} grace)",
                    user_id,
                    self.config.grace_period()
                );
            }
            effects
                .broadcasts
                .push(ServerMessage::FallAlert(fall_alert(user_id, source)));
        } else if change.to == MotionState::Daily && self.monitor.lock().disarm(user_id).is_some() {
            info!("'{}' recovered, emergency timer disarmed", user_id);
        }
    }

    // ==================== 控制面 ====================

    /// 用户确认无恙：撤防并广播解除；没有布防的计时器时返回 false
    pub fn resolve_emergency(&self, user_id: &str, resolution_type: &str) -> bool {
        self.resolve_emergency_at(Instant::now(), user_id, resolution_type)
    }

    pub fn resolve_emergency_at(&self, now: Instant, user_id: &str, resolution_type: &str) -> bool {
        let Some(resolution) = self.monitor.lock().resolve_at(user_id, now) else {
            warn!("Resolve requested for '{}' but no emergency is active", user_id);
            return false;
        };

        let duration_seconds = resolution.elapsed.as_secs();
        info!(
            "Emergency for '{}' resolved by user response after {}s",
            user_id, duration_seconds
        );
        let effects = Effects {
            records: vec![StoreRecord::EmergencyResolution {
                user_id: user_id.to_string(),
                fall_time: resolution.fall_time,
                resolution_time: timestamp::now_string(),
                duration_seconds,
                resolution_type: resolution_type.to_string(),
            }],
            broadcasts: vec![ServerMessage::EmergencyResolved(EmergencyResolved {
                user_id: user_id.to_string(),
                message: format!("User {} responded OK, emergency cleared", user_id),
                resolution_type: resolution_type.to_string(),
                duration_seconds,
                resolved_by: "user_response".to_string(),
                timestamp: timestamp::now_string(),
            })],
        };
        self.apply(effects);
        true
    }

    /// 用户确认需要帮助：立即升级为 CRITICAL
    pub fn confirm_help_needed(&self, user_id: &str, help_type: &str) -> Escalation {
        self.confirm_help_needed_at(Instant::now(), user_id, help_type)
    }

    pub fn confirm_help_needed_at(&self, now: Instant, user_id: &str, help_type: &str) -> Escalation {
        let escalation = self.monitor.lock().confirm_help_at(user_id, help_type, now);

        let mut effects = Effects::default();
        if let Some(tracker) = self.registry.lock().trackers.get_mut(user_id)
            && let Some(change) = tracker.escalate_at(now)
        {
            effects.records.push(state_record(user_id, &change, None));
        }

        error!(
            "EMERGENCY CONFIRMED: '{}' requested help ({})",
            user_id, help_type
        );
        effects.records.push(emergency_record(&escalation));
        effects
            .broadcasts
            .push(ServerMessage::EmergencyConfirmedCritical(
                EmergencyConfirmedCritical {
                    user_id: user_id.to_string(),
                    message: format!("Urgent! user {} confirmed they need help", user_id),
                    confirmation_type: help_type.to_string(),
                    duration_seconds: escalation.duration_seconds(),
                    emergency_level: EmergencyLevel::Critical,
                    confirmed_by: "user_response".to_string(),
                    timestamp: timestamp::now_string(),
                },
            ));
        self.apply(effects);
        escalation
    }

    /// 用户状态快照
    pub fn user_status(&self, user_id: &str) -> Option<UserStatus> {
        self.user_status_at(Instant::now(), user_id)
    }

    pub fn user_status_at(&self, now: Instant, user_id: &str) -> Option<UserStatus> {
        let reg = self.registry.lock();
        let tracker = reg.trackers.get(user_id)?;
        let timer = self.monitor.lock().timer_at(user_id, now);
        let state = tracker.state();

        let (emergency_level, message) = match (timer, state) {
            (Some((elapsed, _)), _) => (
                Some(EmergencyLevel::Monitoring),
                format!("{:.1}s since fall", elapsed.as_secs_f64()),
            ),
            (None, MotionState::Emergency) => {
                (Some(EmergencyLevel::Critical), "emergency declared".to_string())
            },
            (None, MotionState::Walking) => (None, "walking".to_string()),
            (None, MotionState::Fall) => (None, "fall detected".to_string()),
            (None, MotionState::Daily) => (None, "normal".to_string()),
        };

        Some(UserStatus {
            user_id: user_id.to_string(),
            current_state: state,
            is_connected: reg.sessions.contains_key(user_id),
            state_duration: tracker.state_duration_at(now).as_secs_f64(),
            last_update: tracker.last_update().to_string(),
            fall_detected_time: tracker.fall_detected_time().map(str::to_string),
            walking_session_id: tracker.walking_session().map(|s| s.id),
            emergency_timer: timer.map(|(elapsed, _)| elapsed.as_secs_f64()),
            emergency_level,
            time_until_critical: timer.map(|(_, remaining)| remaining.as_secs_f64()),
            message,
        })
    }

    /// 所有已布防计时器
    pub fn monitor_overview(&self) -> Vec<ArmedTimer> {
        self.monitor_overview_at(Instant::now())
    }

    pub fn monitor_overview_at(&self, now: Instant) -> Vec<ArmedTimer> {
        self.monitor.lock().overview_at(now)
    }

    pub fn armed_timers(&self) -> usize {
        self.monitor.lock().len()
    }

    // ==================== 输出 ====================

    /// 直接回复某个会话
    pub fn reply(&self, session: &Session, message: &ServerMessage) {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {} reply: {}", message.wire_type(), e);
                return;
            },
        };
        if let Err(e) = session.observer.send_text(&text) {
            warn!("Reply to '{}' failed: {}", session.user_id, e);
            session.observer.close();
        }
    }

    /// 广播，返回成功投递数量
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        self.broadcaster.broadcast(message)
    }

    /// 执行锁外效果：先广播（告警投递优先），再写存储
    fn apply(&self, effects: Effects) {
        for message in effects.broadcasts.iter() {
            self.broadcaster.broadcast(message);
        }
        self.store.submit_all(effects.records);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.monitor_task.get_mut().take();
    }
}

fn reported_state(user_id: &str, state_info: Option<&StateInfo>) -> Option<MotionState> {
    let info = state_info?;
    match info.motion_state() {
        Ok(state) => Some(state),
        Err(e) => {
            warn!("Ignoring state report from '{}': {}", user_id, e);
            None
        },
    }
}

fn state_record(user_id: &str, change: &StateChange, metadata: Option<StateInfo>) -> StoreRecord {
    StoreRecord::UserState {
        user_id: user_id.to_string(),
        state: change.to,
        start_time: timestamp::now_string(),
        metadata,
    }
}

fn emergency_record(escalation: &Escalation) -> StoreRecord {
    let emergency_type = match escalation.cause {
        EscalationCause::Timeout => "fall_emergency",
        EscalationCause::HelpConfirmed { .. } => "user_confirmed_help_needed",
    };
    StoreRecord::EmergencyEvent {
        user_id: escalation.user_id.clone(),
        emergency_type: emergency_type.to_string(),
        start_time: escalation.fall_time.clone(),
        duration_seconds: escalation.duration_seconds(),
    }
}

fn fall_alert(user_id: &str, source: FallSource<'_>) -> FallAlert {
    let (timestamp, confidence_score, sensor_data) = match source {
        FallSource::Payload(payload) => (
            payload.timestamp.clone(),
            payload.confidence_score,
            payload.sensor_data.clone(),
        ),
        FallSource::Reading(reading) => (
            reading.timestamp.clone(),
            0.0,
            serde_json::to_value(reading).unwrap_or_default(),
        ),
    };
    FallAlert {
        user_id: user_id.to_string(),
        timestamp,
        confidence_score,
        message: format!("Fall detected for user {}!", user_id),
        sensor_data,
        emergency_level: EmergencyLevel::High,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::tests::MemoryObserver;
    use crate::store::MockStore;

    fn manager(grace_secs: f64) -> Arc<ConnectionManager> {
        let config = ServerConfig {
            grace_period_secs: grace_secs,
            sweep_interval_secs: 3600.0,
            ..Default::default()
        };
        let store = StoreWriter::spawn(Box::new(MockStore::new()), 64).unwrap();
        ConnectionManager::new(config, store)
    }

    fn device(mgr: &ConnectionManager, user_id: &str) -> (Session, Arc<MemoryObserver>) {
        let observer = MemoryObserver::new(user_id);
        let session = mgr.connect(
            Register {
                user_id: user_id.to_string(),
                role: Role::Device,
            },
            observer.clone(),
        );
        (session, observer)
    }

    fn telemetry_line(state: &str) -> String {
        format!(
            r#"{{"type":"imu_data","data":{{"user_id":"","timestamp":"T","acc_x":0.1,"acc_y":0.2,"acc_z":0.9,"gyr_x":1.0,"gyr_y":2.0,"gyr_z":3.0}},"state_info":{{"state":"{}","duration":1.0,"can_detect_fall":true}}}}"#,
            state
        )
    }

    const FALL_LINE: &str = r#"{"type":"fall_detection","data":{"user_id":"pi","timestamp":"T","fall_detected":true,"confidence_score":0.93,"sensor_data":{"acceleration":{"x":1,"y":2,"z":3},"gyroscope":{"x":0,"y":0,"z":0}}},"state_info":{"state":"Fall","duration":0.0,"can_detect_fall":false}}"#;

    #[test]
    fn test_connect_replies_and_starts_monitor() {
        let mgr = manager(15.0);
        let (_session, observer) = device(&mgr, "pi");
        assert_eq!(observer.types(), vec!["connection_established"]);
        assert!(mgr.monitor_running());
        assert_eq!(mgr.connection_count(), 1);
    }

    #[test]
    fn test_last_disconnect_stops_monitor() {
        let mgr = manager(15.0);
        let (a, _) = device(&mgr, "a");
        let (b, _) = device(&mgr, "b");
        assert!(mgr.disconnect("a", a.observer.id()));
        assert!(mgr.monitor_running());
        assert!(mgr.disconnect("b", b.observer.id()));
        assert!(!mgr.monitor_running());
    }

    #[test]
    fn test_fall_arms_timer_and_broadcasts() {
        let t0 = Instant::now();
        let mgr = manager(15.0);
        let (session, observer) = device(&mgr, "pi");

        assert_eq!(mgr.handle_line_at(t0, &session, FALL_LINE), Flow::Continue);
        assert_eq!(mgr.armed_timers(), 1);
        assert_eq!(observer.types(), vec!["connection_established", "fall_alert"]);

        let alert: serde_json::Value =
            serde_json::from_str(&observer.lines.lock()[1]).unwrap();
        assert_eq!(alert["data"]["emergency_level"], "HIGH");
        assert_eq!(alert["data"]["confidence_score"], 0.93);

        // 重复的跌倒报文不会重复广播
        mgr.handle_line_at(t0, &session, FALL_LINE);
        assert_eq!(observer.types().len(), 2);
    }

    #[test]
    fn test_recovery_disarms_timer() {
        let t0 = Instant::now();
        let mgr = manager(15.0);
        let (session, _) = device(&mgr, "pi");
        mgr.handle_line_at(t0, &session, FALL_LINE);

        mgr.handle_line_at(t0 + Duration::from_secs(6), &session, &telemetry_line("Idle"));
        assert_eq!(mgr.armed_timers(), 0);
        assert_eq!(mgr.run_sweep_at(t0 + Duration::from_secs(30)), 0);
    }

    #[test]
    fn test_telemetry_ack_carries_state() {
        let t0 = Instant::now();
        let mgr = manager(15.0);
        let (session, observer) = device(&mgr, "pi");
        mgr.handle_line_at(t0, &session, &telemetry_line("걷기"));

        let ack: serde_json::Value =
            serde_json::from_str(observer.lines.lock().last().unwrap()).unwrap();
        assert_eq!(ack["type"], "imu_data_received");
        assert_eq!(ack["data"]["user_id"], "pi");
        assert_eq!(ack["user_state"]["current_state"], "Walking");
        assert_eq!(ack["sampling_rate"], 10);

        let status = mgr.user_status_at(t0, "pi").unwrap();
        assert!(status.walking_session_id.is_some());
    }

    #[test]
    fn test_malformed_line_keeps_connection() {
        let mgr = manager(15.0);
        let (session, observer) = device(&mgr, "pi");
        assert_eq!(mgr.handle_line(&session, "{not json"), Flow::Continue);
        assert_eq!(mgr.handle_line(&session, r#"{"type":"mystery"}"#), Flow::Continue);
        assert_eq!(
            observer.types(),
            vec!["connection_established", "error", "error"]
        );
    }

    #[test]
    fn test_ping_and_disconnect() {
        let mgr = manager(15.0);
        let (session, observer) = device(&mgr, "pi");
        assert_eq!(mgr.handle_line(&session, "ping"), Flow::Continue);
        assert_eq!(mgr.handle_line(&session, "disconnect"), Flow::Close);
        assert_eq!(
            observer.types(),
            vec!["connection_established", "pong", "disconnect_ack"]
        );
    }

    #[test]
    fn test_duplicate_registration_replaces_session() {
        let mgr = manager(15.0);
        let (old, old_observer) = device(&mgr, "pi");
        let (_new, new_observer) = device(&mgr, "pi");

        assert!(!old_observer.is_open());
        assert!(new_observer.is_open());
        assert_eq!(mgr.connection_count(), 1);

        // 旧会话迟到的清理不影响新会话
        assert!(!mgr.disconnect("pi", old.observer.id()));
        assert!(mgr.is_connected("pi"));
    }

    #[test]
    fn test_concurrent_duplicate_registration_keeps_one_observer() {
        let mgr = manager(15.0);
        let observers: Vec<Arc<MemoryObserver>> =
            (0..8).map(|i| MemoryObserver::new(&format!("pi#{}", i))).collect();
        let barrier = Arc::new(std::sync::Barrier::new(observers.len()));

        let handles: Vec<_> = observers
            .iter()
            .cloned()
            .map(|observer| {
                let mgr = mgr.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    mgr.connect(
                        Register {
                            user_id: "pi".to_string(),
                            role: Role::Device,
                        },
                        observer,
                    )
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(mgr.connection_count(), 1);
        assert_eq!(mgr.broadcaster.len(), 1);
        let open: Vec<_> = observers.iter().filter(|o| o.is_open()).collect();
        assert_eq!(open.len(), 1);

        // 留下的会话可以正常断开，之后不残留任何观察端
        assert!(mgr.disconnect("pi", open[0].id()));
        assert!(mgr.broadcaster.is_empty());
        assert!(!mgr.monitor_running());
    }

    #[test]
    fn test_disconnect_tears_down_timer() {
        let t0 = Instant::now();
        let mgr = manager(15.0);
        let (session, _) = device(&mgr, "pi");
        mgr.handle_line_at(t0, &session, FALL_LINE);
        assert_eq!(mgr.armed_timers(), 1);

        mgr.disconnect("pi", session.observer.id());
        assert_eq!(mgr.armed_timers(), 0);
        assert!(mgr.user_status("pi").is_none());
    }

    #[test]
    fn test_status_while_monitoring() {
        let t0 = Instant::now();
        let mgr = manager(15.0);
        let (session, observer) = device(&mgr, "pi");
        mgr.handle_line_at(t0, &session, FALL_LINE);

        let status = mgr.user_status_at(t0 + Duration::from_secs(4), "pi").unwrap();
        assert_eq!(status.current_state, MotionState::Fall);
        assert_eq!(status.emergency_level, Some(EmergencyLevel::Monitoring));
        assert_eq!(status.emergency_timer, Some(4.0));
        assert_eq!(status.time_until_critical, Some(11.0));

        mgr.handle_line_at(t0, &session, r#"{"type":"get_monitor"}"#);
        let overview: serde_json::Value =
            serde_json::from_str(observer.lines.lock().last().unwrap()).unwrap();
        assert_eq!(overview["type"], "emergency_monitor");
        assert_eq!(overview["data"]["total_emergencies"], 1);
    }
}
