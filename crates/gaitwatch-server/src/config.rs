//! 服务端配置

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// 服务端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub bind_addr: String,
    /// 紧急监控扫描周期（秒）
    pub sweep_interval_secs: f64,
    /// 跌倒后升级前的宽限期（秒）
    pub grace_period_secs: f64,
    /// 遥测批量写入存储的条数
    pub telemetry_batch_size: usize,
    /// 回执中声明的遥测采样率（Hz）
    pub sampling_rate_hz: u32,
    /// 连接首行（注册）的等待上限（秒）
    pub register_timeout_secs: f64,
    /// 向单个观察端写入的超时（秒）
    pub write_timeout_secs: f64,
    /// 单行入站报文的字节上限
    pub max_line_bytes: usize,
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            sweep_interval_secs: 5.0,
            grace_period_secs: 15.0,
            telemetry_batch_size: 5,
            sampling_rate_hz: 10,
            register_timeout_secs: 10.0,
            write_timeout_secs: 2.0,
            max_line_bytes: 64 * 1024,
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn sweep_interval(&self) -> Duration {
        secs(self.sweep_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        secs(self.grace_period_secs)
    }

    pub fn register_timeout(&self) -> Duration {
        secs(self.register_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        secs(self.write_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if !(self.sweep_interval_secs > 0.0) {
            return Err(ServerError::InvalidConfig("sweep_interval_secs must be > 0".into()));
        }
        if !(self.grace_period_secs >= 0.0) {
            return Err(ServerError::InvalidConfig("grace_period_secs must be >= 0".into()));
        }
        if self.telemetry_batch_size == 0 {
            return Err(ServerError::InvalidConfig("telemetry_batch_size must be > 0".into()));
        }
        if self.max_line_bytes == 0 {
            return Err(ServerError::InvalidConfig("max_line_bytes must be > 0".into()));
        }
        if self.store.channel_capacity == 0 {
            return Err(ServerError::InvalidConfig("store.channel_capacity must be > 0".into()));
        }
        if self.store.kind == StoreKind::Jsonl && self.store.path.is_none() {
            return Err(ServerError::InvalidConfig("store.path is required for jsonl store".into()));
        }
        Ok(())
    }
}

/// 存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// 只记日志，返回 mockAck
    #[default]
    Mock,
    /// 追加写 JSON Lines 文件
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub path: Option<PathBuf>,
    /// 异步写入通道容量，满时丢弃
    pub channel_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Mock,
            path: None,
            channel_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.grace_period(), Duration::from_secs(15));
        assert_eq!(config.telemetry_batch_size, 5);
    }

    #[test]
    fn test_jsonl_requires_path() {
        let mut config = ServerConfig::default();
        config.store.kind = StoreKind::Jsonl;
        assert!(config.validate().is_err());
        config.store.path = Some("records.jsonl".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"grace_period_secs": 30.0, "store": {"kind": "jsonl", "path": "/tmp/x.jsonl"}}"#,
        )
        .unwrap();
        assert_eq!(config.grace_period_secs, 30.0);
        assert_eq!(config.sweep_interval_secs, 5.0);
        assert_eq!(config.store.kind, StoreKind::Jsonl);
        assert_eq!(config.store.channel_capacity, 1024);
    }
}
