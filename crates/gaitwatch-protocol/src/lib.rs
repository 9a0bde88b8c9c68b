//! # gaitwatch Protocol
//!
//! 设备端与监控服务端之间的报文定义（无 IO 依赖）
//!
//! ## 模块
//!
//! - `sample`: 六轴 IMU 采样
//! - `state`: 用户运动状态与状态上报（`state_info`）
//! - `message`: 上行事件（设备 → 服务端）、入站解码、服务端推送
//! - `timestamp`: KST（UTC+9）ISO-8601 时间戳
//!
//! ## 报文格式
//!
//! 每条报文是一个 JSON 对象 `{"type": ..., "data": {...}}`，按行分隔传输。
//! 字段名与顺序与既有部署保持一致，不可随意修改。

pub mod message;
pub mod sample;
pub mod state;
pub mod timestamp;

pub use message::*;
pub use sample::SensorSample;
pub use state::{MotionState, StateInfo};

use thiserror::Error;

/// 协议层错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON 语法错误或字段类型不匹配
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// 缺少必需字段
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// 未知的报文类型（且不符合旧版报文特征）
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// 无法识别的状态标签
    #[error("Unknown state label: {0}")]
    UnknownState(String),
}
