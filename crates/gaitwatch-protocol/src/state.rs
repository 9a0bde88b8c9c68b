//! # 用户运动状态
//!
//! 设备端状态机与服务端跟踪器共用的状态枚举，以及随报文附带的 `state_info`。

use crate::ProtocolError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 用户运动状态
///
/// | 状态 | 标签 | 说明 |
/// |------|------|------|
/// | Daily | `Idle` | 日常（静止/零散活动） |
/// | Walking | `Walking` | 持续步行 |
/// | Fall | `Fall` | 刚检测到跌倒（本地会自动恢复） |
/// | Emergency | `Emergency` | 服务端升级后的紧急状态 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MotionState {
    #[default]
    Daily,
    Walking,
    Fall,
    Emergency,
}

impl MotionState {
    /// 设备端使用的线上标签
    pub fn label(&self) -> &'static str {
        match self {
            MotionState::Daily => "Idle",
            MotionState::Walking => "Walking",
            MotionState::Fall => "Fall",
            MotionState::Emergency => "Emergency",
        }
    }

    /// 解析状态标签
    ///
    /// 同时接受设备端英文标签与服务端旧版韩文标签（`일상/걷기/낙상/응급`）。
    pub fn from_label(label: &str) -> Result<Self, ProtocolError> {
        match label.trim() {
            "Idle" | "Daily" | "idle" | "daily" | "일상" => Ok(MotionState::Daily),
            "Walking" | "walking" | "걷기" => Ok(MotionState::Walking),
            "Fall" | "fall" | "낙상" => Ok(MotionState::Fall),
            "Emergency" | "emergency" | "응급" => Ok(MotionState::Emergency),
            other => Err(ProtocolError::UnknownState(other.to_string())),
        }
    }
}

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for MotionState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s)
    }
}

impl Serialize for MotionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for MotionState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        MotionState::from_label(&label).map_err(serde::de::Error::custom)
    }
}

/// 随报文附带的状态上报（`state_info`）
///
/// 服务端不重新推导运动状态，只信任设备上报的 `state` 并对转换做出反应。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInfo {
    /// 状态标签（保留原始字符串，解析延迟到服务端）
    pub state: String,
    /// 当前状态持续时长（秒）
    #[serde(default)]
    pub duration: f64,
    /// 跌倒冷却期是否已过
    #[serde(default = "default_true")]
    pub can_detect_fall: bool,
    /// 正在确认中的步行时长（秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_walking: Option<f64>,
}

fn default_true() -> bool {
    true
}

impl StateInfo {
    pub fn new(state: MotionState, duration: f64, can_detect_fall: bool) -> Self {
        Self {
            state: state.label().to_string(),
            duration,
            can_detect_fall,
            pending_walking: None,
        }
    }

    /// 解析上报的状态
    pub fn motion_state(&self) -> Result<MotionState, ProtocolError> {
        MotionState::from_label(&self.state)
    }
}
