//! 驱动层错误类型定义

use gaitwatch_motion::MotionError;
use gaitwatch_protocol::ProtocolError;
use thiserror::Error;

/// 传输层错误类型
#[derive(Error, Debug)]
pub enum TransportError {
    /// 建立连接失败
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// 读写错误
    #[error("Transport IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 对端关闭连接
    #[error("Connection closed by peer")]
    Closed,

    /// 当前没有连接
    #[error("Not connected")]
    NotConnected,

    /// 报文编码失败
    #[error("Encode error: {0}")]
    Encode(#[from] ProtocolError),
}

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 传输层错误
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 协议错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 运动分析配置错误
    #[error("Motion error: {0}")]
    Motion(#[from] MotionError),

    /// 告警队列已满（告警被拒绝，不会静默丢弃）
    #[error("Alert queue full (capacity: {capacity})")]
    AlertQueueFull { capacity: usize },

    /// 传感器读取失败
    #[error("Sensor error: {0}")]
    Sensor(String),

    /// 线程创建失败
    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// 配置不合法
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}
