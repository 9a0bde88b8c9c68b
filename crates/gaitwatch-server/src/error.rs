//! 服务端错误类型定义

use gaitwatch_protocol::ProtocolError;
use thiserror::Error;

/// 数据存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// 后端不可用（降级为丢弃）
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// 服务端错误
#[derive(Error, Debug)]
pub enum ServerError {
    /// 监听地址绑定失败
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// 连接首行不是注册报文
    #[error("Expected register message, got: {0}")]
    RegistrationRequired(String),

    /// 观察端已关闭
    #[error("Observer {0} is closed")]
    ObserverClosed(u64),

    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ServerError::RegistrationRequired("ping".into());
        assert_eq!(err.to_string(), "Expected register message, got: ping");

        let err: ServerError = StoreError::Unavailable("disk full".into()).into();
        assert!(err.to_string().contains("disk full"));
    }
}
