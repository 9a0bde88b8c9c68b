//! # 报文定义
//!
//! - [`OutboundEvent`]: 设备上行事件（遥测 / 跌倒告警 / 用户应答）
//! - [`InboundMessage`]: 服务端入站解码结果（在入口处一次性解码为强类型）
//! - [`ServerMessage`]: 服务端下发/广播报文
//!
//! 上行报文布局：
//!
//! ```text
//! {"type":"imu_data","data":{"user_id":..,"timestamp":..,"acc_x":..,..,"gyr_z":..},"state_info":{..}}
//! {"type":"fall_detection","data":{"user_id":..,"timestamp":..,"fall_detected":true,
//!     "confidence_score":..,"sensor_data":{"acceleration":{"x","y","z"},"gyroscope":{"x","y","z"}}}}
//! {"type":"emergency_declared","data":{"user_id","message","duration_seconds",
//!     "emergency_level":"CRITICAL","timestamp"}}
//! ```

use crate::state::{MotionState, StateInfo};
use crate::{ProtocolError, timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ==================== 报文体 ====================

/// 遥测报文体（`imu_data`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuReading {
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "timestamp::now_string")]
    pub timestamp: String,
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
    pub gyr_x: f64,
    pub gyr_y: f64,
    pub gyr_z: f64,
}

/// 三轴向量
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Axis3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// 跌倒报文中的原始传感器快照
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorData {
    pub acceleration: Axis3,
    pub gyroscope: Axis3,
}

/// 跌倒报文体（`fall_detection`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallPayload {
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "timestamp::now_string")]
    pub timestamp: String,
    #[serde(default = "default_fall_detected")]
    pub fall_detected: bool,
    #[serde(default = "default_confidence")]
    pub confidence_score: f64,
    /// 旧版报文可能携带任意结构，按原样保留
    #[serde(default)]
    pub sensor_data: Value,
}

fn default_fall_detected() -> bool {
    true
}

/// 旧版设备缺省置信度
fn default_confidence() -> f64 {
    0.8
}

impl FallPayload {
    pub fn new(user_id: &str, probability: f64, sensor_data: SensorData) -> Self {
        Self {
            user_id: user_id.to_string(),
            timestamp: timestamp::now_string(),
            fall_detected: true,
            confidence_score: probability,
            sensor_data: serde_json::to_value(sensor_data).unwrap_or(Value::Null),
        }
    }
}

/// 用户应答：没事（`emergency_resolved`，设备 → 服务端）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_resolution_type")]
    pub resolution_type: String,
    #[serde(default = "timestamp::now_string")]
    pub timestamp: String,
}

fn default_resolution_type() -> String {
    "user_ok".to_string()
}

/// 用户应答：需要帮助（`emergency_confirmed_critical`，设备 → 服务端）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpReport {
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_help_type", alias = "confirmation_type")]
    pub help_type: String,
    #[serde(default = "timestamp::now_string")]
    pub timestamp: String,
}

fn default_help_type() -> String {
    "general_help".to_string()
}

// ==================== 上行事件（设备侧） ====================

/// 遥测帧（报文体 + 状态上报）
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    pub reading: ImuReading,
    pub state_info: Option<StateInfo>,
}

/// 跌倒告警帧
#[derive(Debug, Clone, PartialEq)]
pub struct FallFrame {
    pub payload: FallPayload,
    pub state_info: Option<StateInfo>,
}

/// 设备上行事件
///
/// 所有权从生产者转移到队列，再转移到传输层。仅告警类事件在发送失败时重新入队。
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    /// 周期遥测（可丢弃）
    Telemetry(TelemetryFrame),
    /// 跌倒告警
    AlertFall(FallFrame),
    /// 用户确认无恙
    AlertEmergencyResolved(ResolutionReport),
    /// 用户确认需要帮助
    AlertEmergencyCritical(HelpReport),
}

/// 上行事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Telemetry,
    Alert,
}

impl OutboundEvent {
    /// 线上 `type` 字段
    pub fn wire_type(&self) -> &'static str {
        match self {
            OutboundEvent::Telemetry(_) => "imu_data",
            OutboundEvent::AlertFall(_) => "fall_detection",
            OutboundEvent::AlertEmergencyResolved(_) => "emergency_resolved",
            OutboundEvent::AlertEmergencyCritical(_) => "emergency_confirmed_critical",
        }
    }

    pub fn class(&self) -> EventClass {
        match self {
            OutboundEvent::Telemetry(_) => EventClass::Telemetry,
            _ => EventClass::Alert,
        }
    }

    pub fn is_alert(&self) -> bool {
        self.class() == EventClass::Alert
    }

    /// 编码为单行 JSON
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let kind = self.wire_type();
        let line = match self {
            OutboundEvent::Telemetry(frame) => serde_json::to_string(&Envelope {
                kind,
                data: &frame.reading,
                state_info: frame.state_info.as_ref(),
            })?,
            OutboundEvent::AlertFall(frame) => serde_json::to_string(&Envelope {
                kind,
                data: &frame.payload,
                state_info: frame.state_info.as_ref(),
            })?,
            OutboundEvent::AlertEmergencyResolved(report) => serde_json::to_string(&Envelope {
                kind,
                data: report,
                state_info: None,
            })?,
            OutboundEvent::AlertEmergencyCritical(report) => serde_json::to_string(&Envelope {
                kind,
                data: report,
                state_info: None,
            })?,
        };
        Ok(line)
    }
}

/// `{"type", "data", "state_info"?}` 外壳（字段顺序固定）
#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a T,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_info: Option<&'a StateInfo>,
}

// ==================== 入站解码（服务端侧） ====================

/// 连接角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// 佩戴设备（拥有状态跟踪器）
    #[default]
    Device,
    /// 仅接收广播的观察端（看护面板）
    Observer,
}

/// 注册报文体（连接首行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub user_id: String,
    #[serde(default)]
    pub role: Role,
}

/// 服务端入站报文
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// 文本 `ping`
    Ping,
    /// 文本 `disconnect`
    Disconnect,
    /// 注册身份
    Register(Register),
    /// 遥测
    Telemetry {
        reading: ImuReading,
        state_info: Option<StateInfo>,
    },
    /// 跌倒
    Fall {
        payload: FallPayload,
        state_info: Option<StateInfo>,
    },
    /// 解除紧急状态（`None` 表示发送者本人）
    ResolveEmergency {
        user_id: Option<String>,
        resolution_type: String,
    },
    /// 确认需要帮助（`None` 表示发送者本人）
    ConfirmHelpNeeded {
        user_id: Option<String>,
        help_type: String,
    },
    /// 查询某用户状态快照
    GetStatus { user_id: Option<String> },
    /// 查询所有已布防的紧急计时器
    MonitorOverview,
}

#[derive(Deserialize)]
struct TargetedControl {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    resolution_type: Option<String>,
    #[serde(default, alias = "confirmation_type")]
    help_type: Option<String>,
}

impl InboundMessage {
    /// 解码一行入站文本
    ///
    /// 未知 `type` 时按旧版报文特征识别（跌倒 / 遥测），都不匹配则返回
    /// [`ProtocolError::UnknownType`]。
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let trimmed = line.trim();
        match trimmed {
            "ping" => return Ok(InboundMessage::Ping),
            "disconnect" => return Ok(InboundMessage::Disconnect),
            _ => {},
        }

        let mut root: Value = serde_json::from_str(trimmed)?;
        let kind = root.get("type").and_then(Value::as_str).map(str::to_string);
        let state_info = match root.get_mut("state_info").map(Value::take) {
            Some(Value::Null) | None => None,
            Some(v) => Some(serde_json::from_value::<StateInfo>(v)?),
        };

        match kind.as_deref() {
            Some("register") => Ok(InboundMessage::Register(take_data(&mut root)?)),
            Some("imu_data") => Ok(InboundMessage::Telemetry {
                reading: take_data(&mut root)?,
                state_info,
            }),
            Some("fall_detection") => Ok(InboundMessage::Fall {
                payload: take_data(&mut root)?,
                state_info,
            }),
            Some("emergency_resolved") | Some("resolve_emergency") => {
                let control: TargetedControl = take_data_or_empty(&mut root)?;
                Ok(InboundMessage::ResolveEmergency {
                    user_id: control.user_id.filter(|s| !s.is_empty()),
                    resolution_type: control
                        .resolution_type
                        .unwrap_or_else(default_resolution_type),
                })
            },
            Some("emergency_confirmed_critical") | Some("confirm_help_needed") => {
                let control: TargetedControl = take_data_or_empty(&mut root)?;
                Ok(InboundMessage::ConfirmHelpNeeded {
                    user_id: control.user_id.filter(|s| !s.is_empty()),
                    help_type: control.help_type.unwrap_or_else(default_help_type),
                })
            },
            Some("get_status") => {
                let control: TargetedControl = take_data_or_empty(&mut root)?;
                Ok(InboundMessage::GetStatus {
                    user_id: control.user_id.filter(|s| !s.is_empty()),
                })
            },
            Some("get_monitor") => Ok(InboundMessage::MonitorOverview),
            other => decode_legacy(&root)
                .ok_or_else(|| ProtocolError::UnknownType(other.unwrap_or("<none>").to_string())),
        }
    }
}

fn take_data<T: serde::de::DeserializeOwned>(root: &mut Value) -> Result<T, ProtocolError> {
    let data = root
        .get_mut("data")
        .map(Value::take)
        .ok_or(ProtocolError::MissingField("data"))?;
    Ok(serde_json::from_value(data)?)
}

fn take_data_or_empty<T: serde::de::DeserializeOwned>(
    root: &mut Value,
) -> Result<T, ProtocolError> {
    let data = root.get_mut("data").map(Value::take).unwrap_or_else(|| json!({}));
    Ok(serde_json::from_value(data)?)
}

/// 旧版设备报文识别
fn decode_legacy(root: &Value) -> Option<InboundMessage> {
    let obj = root.as_object()?;

    let is_fall = obj.get("event").and_then(Value::as_str) == Some("fall_detected")
        || obj.get("fall_detected").and_then(Value::as_bool) == Some(true)
        || obj.contains_key("fall_alert")
        || obj.contains_key("emergency");

    if is_fall {
        let confidence = obj
            .get("probability")
            .or_else(|| obj.get("confidence_score"))
            .and_then(Value::as_f64)
            .unwrap_or_else(default_confidence);
        return Some(InboundMessage::Fall {
            payload: FallPayload {
                user_id: String::new(),
                timestamp: timestamp::now_string(),
                fall_detected: true,
                confidence_score: confidence,
                sensor_data: root.clone(),
            },
            state_info: None,
        });
    }

    let axis = |key: &str| -> Option<[f64; 3]> {
        let v = obj.get(key)?;
        Some([
            v.get("x")?.as_f64()?,
            v.get("y")?.as_f64()?,
            v.get("z")?.as_f64()?,
        ])
    };
    let acc = axis("accel")?;
    let gyr = axis("gyro")?;
    Some(InboundMessage::Telemetry {
        reading: ImuReading {
            user_id: String::new(),
            timestamp: timestamp::now_string(),
            acc_x: acc[0],
            acc_y: acc[1],
            acc_z: acc[2],
            gyr_x: gyr[0],
            gyr_y: gyr[1],
            gyr_z: gyr[2],
        },
        state_info: None,
    })
}

// ==================== 服务端下发 ====================

/// 紧急级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EmergencyLevel {
    /// 跌倒告警（尚未升级）
    High,
    /// 宽限期内监控中
    Monitoring,
    /// 已升级
    Critical,
}

/// 跌倒广播（`fall_alert`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallAlert {
    pub user_id: String,
    pub timestamp: String,
    pub confidence_score: f64,
    pub message: String,
    pub sensor_data: Value,
    pub emergency_level: EmergencyLevel,
}

/// 超时升级广播（`emergency_declared`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyDeclared {
    pub user_id: String,
    pub message: String,
    pub duration_seconds: u64,
    pub emergency_level: EmergencyLevel,
    pub timestamp: String,
}

/// 解除广播（`emergency_resolved`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyResolved {
    pub user_id: String,
    pub message: String,
    pub resolution_type: String,
    pub duration_seconds: u64,
    pub resolved_by: String,
    pub timestamp: String,
}

/// 人工确认升级广播（`emergency_confirmed_critical`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyConfirmedCritical {
    pub user_id: String,
    pub message: String,
    pub confirmation_type: String,
    pub duration_seconds: u64,
    pub emergency_level: EmergencyLevel,
    pub confirmed_by: String,
    pub timestamp: String,
}

/// 用户状态快照（`get-status`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatus {
    pub user_id: String,
    pub current_state: MotionState,
    pub is_connected: bool,
    pub state_duration: f64,
    /// 最近一次上报的时间戳
    pub last_update: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fall_detected_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub walking_session_id: Option<u64>,
    /// 跌倒后已经过的秒数（仅在计时器布防时存在）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency_timer: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency_level: Option<EmergencyLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_until_critical: Option<f64>,
    pub message: String,
}

/// 紧急计时器概览条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmedTimer {
    pub user_id: String,
    pub elapsed_seconds: f64,
    pub time_until_critical: f64,
    pub emergency_level: EmergencyLevel,
}

/// 服务端报文
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ConnectionEstablished {
        user_id: String,
        current_state: MotionState,
        message: String,
    },
    ImuDataReceived {
        data: ImuReading,
        sampling_rate: u32,
        current_state: Option<(MotionState, f64)>,
    },
    FallAlert(FallAlert),
    EmergencyDeclared(EmergencyDeclared),
    EmergencyResolved(EmergencyResolved),
    EmergencyConfirmedCritical(EmergencyConfirmedCritical),
    Status(Option<UserStatus>),
    MonitorOverview(Vec<ArmedTimer>),
    Pong,
    DisconnectAck,
    Error { message: String },
}

impl ServerMessage {
    /// 线上 `type` 字段
    pub fn wire_type(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionEstablished { .. } => "connection_established",
            ServerMessage::ImuDataReceived { .. } => "imu_data_received",
            ServerMessage::FallAlert(_) => "fall_alert",
            ServerMessage::EmergencyDeclared(_) => "emergency_declared",
            ServerMessage::EmergencyResolved(_) => "emergency_resolved",
            ServerMessage::EmergencyConfirmedCritical(_) => "emergency_confirmed_critical",
            ServerMessage::Status(_) => "status",
            ServerMessage::MonitorOverview(_) => "emergency_monitor",
            ServerMessage::Pong => "pong",
            ServerMessage::DisconnectAck => "disconnect_ack",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// 是否为 CRITICAL 级别广播
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ServerMessage::EmergencyDeclared(_) | ServerMessage::EmergencyConfirmedCritical(_)
        )
    }

    /// 编码为单行文本
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let kind = self.wire_type();
        let value = match self {
            ServerMessage::Pong => return Ok("pong".to_string()),
            ServerMessage::ConnectionEstablished {
                user_id,
                current_state,
                message,
            } => json!({
                "type": kind,
                "data": {
                    "user_id": user_id,
                    "current_state": current_state,
                    "message": message,
                },
            }),
            ServerMessage::ImuDataReceived {
                data,
                sampling_rate,
                current_state,
            } => {
                let mut value = json!({
                    "type": kind,
                    "data": data,
                    "sampling_rate": sampling_rate,
                });
                if let Some((state, duration)) = current_state {
                    value["user_state"] = json!({
                        "current_state": state,
                        "state_duration": duration,
                    });
                }
                value
            },
            ServerMessage::FallAlert(alert) => json!({ "type": kind, "data": alert }),
            ServerMessage::EmergencyDeclared(body) => json!({ "type": kind, "data": body }),
            ServerMessage::EmergencyResolved(body) => json!({ "type": kind, "data": body }),
            ServerMessage::EmergencyConfirmedCritical(body) => json!({ "type": kind, "data": body }),
            ServerMessage::Status(Some(status)) => json!({ "type": kind, "data": status }),
            ServerMessage::Status(None) => json!({
                "type": kind,
                "data": { "status": "unknown", "message": "no tracking information" },
            }),
            ServerMessage::MonitorOverview(timers) => json!({
                "type": kind,
                "data": {
                    "total_emergencies": timers.len(),
                    "emergencies": timers,
                },
            }),
            ServerMessage::DisconnectAck => json!({
                "type": kind,
                "message": "connection closing",
            }),
            ServerMessage::Error { message } => json!({
                "type": kind,
                "message": message,
                "timestamp": timestamp::now_string(),
            }),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SensorSample;

    fn sample() -> SensorSample {
        SensorSample::from_array([0.12, -0.03, 0.98, 1.25, -0.5, 3.0])
    }

    #[test]
    fn test_telemetry_wire_shape() {
        let reading = sample().to_reading("raspberry_pi_01", "2025-01-27T10:00:00+09:00".into());
        let event = OutboundEvent::Telemetry(TelemetryFrame {
            reading,
            state_info: None,
        });
        let line = event.encode().unwrap();
        assert_eq!(
            line,
            r#"{"type":"imu_data","data":{"user_id":"raspberry_pi_01","timestamp":"2025-01-27T10:00:00+09:00","acc_x":0.12,"acc_y":-0.03,"acc_z":0.98,"gyr_x":1.25,"gyr_y":-0.5,"gyr_z":3.0}}"#
        );
    }

    #[test]
    fn test_fall_wire_shape() {
        let mut payload = FallPayload::new("pi", 0.91, sample().sensor_data());
        payload.timestamp = "T".into();
        let line = OutboundEvent::AlertFall(FallFrame {
            payload,
            state_info: None,
        })
        .encode()
        .unwrap();
        assert_eq!(
            line,
            r#"{"type":"fall_detection","data":{"user_id":"pi","timestamp":"T","fall_detected":true,"confidence_score":0.91,"sensor_data":{"acceleration":{"x":0.12,"y":-0.03,"z":0.98},"gyroscope":{"x":1.25,"y":-0.5,"z":3.0}}}}"#
        );
    }

    #[test]
    fn test_emergency_declared_wire_shape() {
        let msg = ServerMessage::EmergencyDeclared(EmergencyDeclared {
            user_id: "pi".into(),
            message: "m".into(),
            duration_seconds: 16,
            emergency_level: EmergencyLevel::Critical,
            timestamp: "T".into(),
        });
        assert!(msg.is_critical());
        let decoded: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded["type"], "emergency_declared");
        assert_eq!(decoded["data"]["emergency_level"], "CRITICAL");
        assert_eq!(decoded["data"]["duration_seconds"], 16);
        assert_eq!(decoded["data"]["user_id"], "pi");
    }

    #[test]
    fn test_state_info_is_sibling_of_data() {
        let reading = sample().to_reading("pi", "T".into());
        let event = OutboundEvent::Telemetry(TelemetryFrame {
            reading,
            state_info: Some(StateInfo::new(MotionState::Walking, 4.5, true)),
        });
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(value["state_info"]["state"], "Walking");
        assert!(value["data"].get("state_info").is_none());
    }

    #[test]
    fn test_decode_telemetry_with_state_info() {
        let line = r#"{"type":"imu_data","data":{"user_id":"pi","timestamp":"T","acc_x":1.0,"acc_y":2.0,"acc_z":3.0,"gyr_x":4.0,"gyr_y":5.0,"gyr_z":6.0},"state_info":{"state":"Walking","duration":3.2,"can_detect_fall":true}}"#;
        match InboundMessage::decode(line).unwrap() {
            InboundMessage::Telemetry { reading, state_info } => {
                assert_eq!(SensorSample::from(&reading).to_array(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
                assert_eq!(
                    state_info.unwrap().motion_state().unwrap(),
                    MotionState::Walking
                );
            },
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_fall_defaults() {
        let line = r#"{"type":"fall_detection","data":{"user_id":"pi"}}"#;
        match InboundMessage::decode(line).unwrap() {
            InboundMessage::Fall { payload, .. } => {
                assert!(payload.fall_detected);
                assert_eq!(payload.confidence_score, 0.8);
                assert!(payload.timestamp.ends_with("+09:00"));
            },
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_text_commands() {
        assert_eq!(InboundMessage::decode("ping").unwrap(), InboundMessage::Ping);
        assert_eq!(
            InboundMessage::decode(" disconnect\n").unwrap(),
            InboundMessage::Disconnect
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            InboundMessage::decode("{not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            InboundMessage::decode(r#"{"type":"imu_data"}"#),
            Err(ProtocolError::MissingField("data"))
        ));
        assert!(matches!(
            InboundMessage::decode(r#"{"type":"imu_data","data":{"acc_x":1.0}}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            InboundMessage::decode(r#"{"type":"weather"}"#),
            Err(ProtocolError::UnknownType(t)) if t == "weather"
        ));
    }

    #[test]
    fn test_decode_legacy_fall() {
        let line = r#"{"event":"fall_detected","probability":0.93}"#;
        match InboundMessage::decode(line).unwrap() {
            InboundMessage::Fall { payload, .. } => {
                assert_eq!(payload.confidence_score, 0.93);
                assert_eq!(payload.sensor_data["event"], "fall_detected");
            },
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_legacy_telemetry() {
        let line = r#"{"accel":{"x":0.1,"y":0.2,"z":0.3},"gyro":{"x":1.0,"y":2.0,"z":3.0}}"#;
        match InboundMessage::decode(line).unwrap() {
            InboundMessage::Telemetry { reading, .. } => {
                assert_eq!(reading.acc_z, 0.3);
                assert_eq!(reading.gyr_x, 1.0);
            },
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_control_plane() {
        let resolve = InboundMessage::decode(
            r#"{"type":"resolve_emergency","data":{"user_id":"pi","resolution_type":"caregiver_check"}}"#,
        )
        .unwrap();
        assert_eq!(
            resolve,
            InboundMessage::ResolveEmergency {
                user_id: Some("pi".into()),
                resolution_type: "caregiver_check".into(),
            }
        );

        let own = InboundMessage::decode(r#"{"type":"emergency_confirmed_critical"}"#).unwrap();
        assert_eq!(
            own,
            InboundMessage::ConfirmHelpNeeded {
                user_id: None,
                help_type: "general_help".into(),
            }
        );

        let status =
            InboundMessage::decode(r#"{"type":"get_status","data":{"user_id":"pi"}}"#).unwrap();
        assert_eq!(status, InboundMessage::GetStatus { user_id: Some("pi".into()) });
    }

    #[test]
    fn test_device_reports_decode_as_overrides() {
        let ok = OutboundEvent::AlertEmergencyResolved(ResolutionReport {
            user_id: "pi".into(),
            resolution_type: "user_ok".into(),
            timestamp: "T".into(),
        });
        assert!(ok.is_alert());
        assert_eq!(
            InboundMessage::decode(&ok.encode().unwrap()).unwrap(),
            InboundMessage::ResolveEmergency {
                user_id: Some("pi".into()),
                resolution_type: "user_ok".into(),
            }
        );
    }

    #[test]
    fn test_pong_is_plain_text() {
        assert_eq!(ServerMessage::Pong.encode().unwrap(), "pong");
    }

    #[test]
    fn test_imu_ack_carries_user_state() {
        let msg = ServerMessage::ImuDataReceived {
            data: sample().to_reading("pi", "T".into()),
            sampling_rate: 10,
            current_state: Some((MotionState::Walking, 2.0)),
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "imu_data_received");
        assert_eq!(value["user_state"]["current_state"], "Walking");
        assert_eq!(value["sampling_rate"], 10);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::SensorSample;
    use proptest::prelude::*;

    fn finite() -> impl Strategy<Value = f64> {
        -2000.0f64..2000.0
    }

    #[test]
    fn test_telemetry_float_is_bit_exact() {
        let sample = SensorSample::from_array([1439.1764831232663, -0.1, 1.0 / 3.0, 0.0, 9.80665, 1e-7]);
        let event = OutboundEvent::Telemetry(TelemetryFrame {
            reading: sample.to_reading("pi", "T".into()),
            state_info: None,
        });
        let line = event.encode().unwrap();
        let InboundMessage::Telemetry { reading, .. } = InboundMessage::decode(&line).unwrap() else {
            panic!("expected telemetry");
        };
        let decoded = SensorSample::from(&reading).to_array();
        for (got, want) in decoded.iter().zip(sample.to_array()) {
            assert_eq!(got.to_bits(), want.to_bits(), "{} != {}", got, want);
        }
    }

    proptest! {
        #[test]
        fn telemetry_preserves_six_axes(
            ax in finite(), ay in finite(), az in finite(),
            gx in finite(), gy in finite(), gz in finite(),
        ) {
            let sample = SensorSample::from_array([ax, ay, az, gx, gy, gz]);
            let event = OutboundEvent::Telemetry(TelemetryFrame {
                reading: sample.to_reading("pi", "T".into()),
                state_info: None,
            });
            let line = event.encode().unwrap();
            match InboundMessage::decode(&line).unwrap() {
                InboundMessage::Telemetry { reading, .. } => {
                    let decoded = SensorSample::from(&reading).to_array();
                    for (got, want) in decoded.iter().zip(sample.to_array()) {
                        prop_assert_eq!(got.to_bits(), want.to_bits(), "{} != {}", got, want);
                    }
                },
                other => prop_assert!(false, "unexpected: {:?}", other),
            }
        }
    }
}
