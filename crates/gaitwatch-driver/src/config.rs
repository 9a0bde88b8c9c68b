//! 设备运行时配置

use gaitwatch_motion::MotionConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::DriverError;

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// 设备运行时配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// 用户（设备）标识
    pub user_id: String,
    /// 步行状态下的遥测发送频率（Hz）
    pub telemetry_rate_hz: f64,
    /// 非步行状态下的心跳遥测间隔（秒），0 表示关闭
    pub idle_heartbeat_secs: f64,
    pub queues: QueueConfig,
    pub transport: TransportConfig,
    pub motion: MotionConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            user_id: "raspberry_pi_01".to_string(),
            telemetry_rate_hz: 10.0,
            idle_heartbeat_secs: 1.0,
            queues: QueueConfig::default(),
            transport: TransportConfig::default(),
            motion: MotionConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// 传感器采样率（与步行检测窗口共用）
    pub fn sample_rate_hz(&self) -> f64 {
        self.motion.walking.sample_rate_hz
    }

    /// 采样周期
    pub fn sample_period(&self) -> Duration {
        secs(1.0 / self.sample_rate_hz())
    }

    /// 步行状态下每隔多少个采样发送一次遥测
    pub fn telemetry_every(&self) -> u64 {
        ((self.sample_rate_hz() / self.telemetry_rate_hz).round() as u64).max(1)
    }

    /// 心跳间隔（采样数），`None` 表示关闭
    pub fn heartbeat_every(&self) -> Option<u64> {
        if self.idle_heartbeat_secs <= 0.0 {
            return None;
        }
        Some(((self.idle_heartbeat_secs * self.sample_rate_hz()).round() as u64).max(1))
    }

    pub fn validate(&self) -> Result<(), DriverError> {
        self.motion.validate()?;
        if self.user_id.trim().is_empty() {
            return Err(DriverError::InvalidConfig("user_id must not be empty".into()));
        }
        if !(self.telemetry_rate_hz > 0.0) || self.telemetry_rate_hz > self.sample_rate_hz() {
            return Err(DriverError::InvalidConfig(
                "telemetry_rate_hz must be within (0, sample_rate_hz]".into(),
            ));
        }
        if self.queues.telemetry_capacity == 0 || self.queues.alert_capacity == 0 {
            return Err(DriverError::InvalidConfig("queue capacities must be > 0".into()));
        }
        self.transport.validate()
    }
}

/// 队列容量
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub telemetry_capacity: usize,
    pub alert_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            telemetry_capacity: 50,
            alert_capacity: 100,
        }
    }
}

/// 传输会话配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// 监控服务地址（`host:port`）
    pub server_addr: String,
    /// 首次重连等待（秒）
    pub initial_backoff_secs: f64,
    /// 重连等待上限（秒）
    pub max_backoff_secs: f64,
    /// 发送循环周期（毫秒）
    pub drain_tick_ms: u64,
    pub connect_timeout_secs: f64,
    pub write_timeout_secs: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:8000".to_string(),
            initial_backoff_secs: 1.0,
            max_backoff_secs: 30.0,
            drain_tick_ms: 100,
            connect_timeout_secs: 5.0,
            write_timeout_secs: 5.0,
        }
    }
}

impl TransportConfig {
    pub fn initial_backoff(&self) -> Duration {
        secs(self.initial_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        secs(self.max_backoff_secs)
    }

    pub fn drain_tick(&self) -> Duration {
        Duration::from_millis(self.drain_tick_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        secs(self.write_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), DriverError> {
        if self.initial_backoff_secs <= 0.0 || self.max_backoff_secs < self.initial_backoff_secs {
            return Err(DriverError::InvalidConfig(
                "transport backoff must satisfy 0 < initial <= max".into(),
            ));
        }
        if self.server_addr.trim().is_empty() {
            return Err(DriverError::InvalidConfig("transport.server_addr must not be empty".into()));
        }
        Ok(())
    }
}
