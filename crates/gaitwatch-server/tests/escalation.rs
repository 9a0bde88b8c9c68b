//! 紧急升级流程

use gaitwatch_protocol::{EmergencyLevel, MotionState, Register, Role};
use gaitwatch_server::{
    ConnectionManager, MockStore, Observer, ServerConfig, ServerError, Session, StoreWriter,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_ID: AtomicU64 = AtomicU64::new(10_000);

struct RecordingObserver {
    id: u64,
    label: String,
    lines: Mutex<Vec<String>>,
    open: AtomicBool,
    fail: bool,
}

impl RecordingObserver {
    fn new(label: &str, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            label: label.to_string(),
            lines: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            fail,
        })
    }

    fn count(&self, kind: &str) -> usize {
        self.messages().iter().filter(|m| m["type"] == kind).count()
    }

    fn messages(&self) -> Vec<serde_json::Value> {
        self.lines
            .lock()
            .iter()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}

impl Observer for RecordingObserver {
    fn id(&self) -> u64 {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send_text(&self, text: &str) -> Result<(), ServerError> {
        if self.fail {
            return Err(ServerError::ObserverClosed(self.id));
        }
        self.lines.lock().push(text.to_string());
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

fn manager() -> Arc<ConnectionManager> {
    let config = ServerConfig {
        grace_period_secs: 15.0,
        // 测试中手动驱动扫描
        sweep_interval_secs: 3600.0,
        ..Default::default()
    };
    let store = StoreWriter::spawn(Box::new(MockStore::new()), 256).unwrap();
    ConnectionManager::new(config, store)
}

fn join(
    mgr: &ConnectionManager,
    user_id: &str,
    role: Role,
    observer: Arc<RecordingObserver>,
) -> Session {
    mgr.connect(
        Register {
            user_id: user_id.to_string(),
            role,
        },
        observer,
    )
}

const FALL: &str = r#"{"type":"fall_detection","data":{"user_id":"pi","timestamp":"T","fall_detected":true,"confidence_score":0.9,"sensor_data":{}},"state_info":{"state":"Fall","duration":0.0,"can_detect_fall":false}}"#;

fn at(t0: Instant, secs: u64) -> Instant {
    t0 + Duration::from_secs(secs)
}

#[test]
fn unresolved_fall_escalates_exactly_once() {
    let t0 = Instant::now();
    let mgr = manager();
    let device = RecordingObserver::new("pi", false);
    let panel = RecordingObserver::new("panel", false);
    let session = join(&mgr, "pi", Role::Device, device.clone());
    join(&mgr, "panel", Role::Observer, panel.clone());

    mgr.handle_line_at(t0, &session, FALL);
    assert_eq!(panel.count("fall_alert"), 1);

    assert_eq!(mgr.run_sweep_at(at(t0, 5)), 0);
    assert_eq!(mgr.run_sweep_at(at(t0, 10)), 0);
    assert_eq!(mgr.run_sweep_at(at(t0, 16)), 1);
    assert_eq!(mgr.run_sweep_at(at(t0, 21)), 0);

    assert_eq!(panel.count("emergency_declared"), 1);
    assert_eq!(device.count("emergency_declared"), 1);
    assert_eq!(mgr.armed_timers(), 0);

    let declared = panel
        .messages()
        .into_iter()
        .find(|m| m["type"] == "emergency_declared")
        .unwrap();
    assert_eq!(declared["data"]["emergency_level"], "CRITICAL");
    assert_eq!(declared["data"]["duration_seconds"], 16);

    let status = mgr.user_status_at(at(t0, 22), "pi").unwrap();
    assert_eq!(status.current_state, MotionState::Emergency);
    assert_eq!(status.emergency_level, Some(EmergencyLevel::Critical));
}

#[test]
fn user_ok_never_escalates() {
    let t0 = Instant::now();
    let mgr = manager();
    let panel = RecordingObserver::new("panel", false);
    let session = join(&mgr, "pi", Role::Device, RecordingObserver::new("pi", false));
    join(&mgr, "panel", Role::Observer, panel.clone());

    mgr.handle_line_at(t0, &session, FALL);
    mgr.handle_line_at(
        at(t0, 4),
        &session,
        r#"{"type":"emergency_resolved","data":{"resolution_type":"user_ok"}}"#,
    );

    assert_eq!(mgr.run_sweep_at(at(t0, 60)), 0);
    assert_eq!(panel.count("emergency_resolved"), 1);
    assert_eq!(panel.count("emergency_declared"), 0);

    let resolved = panel
        .messages()
        .into_iter()
        .find(|m| m["type"] == "emergency_resolved")
        .unwrap();
    assert_eq!(resolved["data"]["resolved_by"], "user_response");
    assert_eq!(resolved["data"]["duration_seconds"], 4);
}

#[test]
fn resolve_without_emergency_is_rejected() {
    let mgr = manager();
    let device = RecordingObserver::new("pi", false);
    let session = join(&mgr, "pi", Role::Device, device.clone());

    mgr.handle_line(&session, r#"{"type":"resolve_emergency"}"#);
    assert_eq!(device.count("error"), 1);
    assert_eq!(device.count("emergency_resolved"), 0);
}

#[test]
fn help_confirmation_escalates_immediately() {
    let t0 = Instant::now();
    let mgr = manager();
    let panel = RecordingObserver::new("panel", false);
    let session = join(&mgr, "pi", Role::Device, RecordingObserver::new("pi", false));
    join(&mgr, "panel", Role::Observer, panel.clone());

    mgr.handle_line_at(t0, &session, FALL);
    mgr.handle_line_at(
        at(t0, 3),
        &session,
        r#"{"type":"confirm_help_needed","data":{"help_type":"medical"}}"#,
    );

    assert_eq!(panel.count("emergency_confirmed_critical"), 1);
    assert_eq!(mgr.armed_timers(), 0);
    // 已确认的紧急情况不会被扫描再次升级
    assert_eq!(mgr.run_sweep_at(at(t0, 30)), 0);
    assert_eq!(panel.count("emergency_declared"), 0);
}

#[test]
fn observer_can_act_on_behalf_of_user() {
    let t0 = Instant::now();
    let mgr = manager();
    let panel = RecordingObserver::new("panel", false);
    let device_session = join(&mgr, "pi", Role::Device, RecordingObserver::new("pi", false));
    let panel_session = join(&mgr, "panel", Role::Observer, panel.clone());

    mgr.handle_line_at(t0, &device_session, FALL);
    mgr.handle_line_at(
        at(t0, 2),
        &panel_session,
        r#"{"type":"get_status","data":{"user_id":"pi"}}"#,
    );
    let status = panel.messages().into_iter().last().unwrap();
    assert_eq!(status["type"], "status");
    assert_eq!(status["data"]["emergency_level"], "MONITORING");

    mgr.handle_line_at(
        at(t0, 5),
        &panel_session,
        r#"{"type":"resolve_emergency","data":{"user_id":"pi","resolution_type":"caregiver_checked"}}"#,
    );
    assert_eq!(panel.count("emergency_resolved"), 1);
    assert_eq!(mgr.armed_timers(), 0);
}

#[test]
fn failing_observer_does_not_block_alerts() {
    let t0 = Instant::now();
    let mgr = manager();
    let good = RecordingObserver::new("good", false);
    let bad = RecordingObserver::new("bad", true);
    let session = join(&mgr, "pi", Role::Device, RecordingObserver::new("pi", false));
    join(&mgr, "bad", Role::Observer, bad.clone());
    join(&mgr, "good", Role::Observer, good.clone());

    mgr.handle_line_at(t0, &session, FALL);
    assert_eq!(good.count("fall_alert"), 1);
    assert!(!bad.is_open());

    mgr.run_sweep_at(at(t0, 16));
    assert_eq!(good.count("emergency_declared"), 1);
}
