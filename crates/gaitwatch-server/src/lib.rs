//! # Gaitwatch Server
//!
//! 监控服务端：镜像每个设备上报的运动状态，跌倒后布防紧急计时器，
//! 宽限期内未恢复则升级为 CRITICAL 并广播给所有已连接的观察端。
//!
//! ## 线程模型
//!
//! - `gw-accept`：非阻塞 accept 循环
//! - `gw-conn-*`：每连接一个，逐行处理入站报文
//! - `gw-monitor`：周期扫描紧急计时器（首个连接时启动，最后一个断开时停止）
//! - `gw-store`：存储写入（fire-and-forget）
//!
//! ## 使用示例
//!
//! ```no_run
//! use gaitwatch_server::{MockStore, MonitorServer, ServerConfig, StoreWriter};
//!
//! let store = StoreWriter::spawn(Box::new(MockStore::new()), 1024).unwrap();
//! let server = MonitorServer::bind(ServerConfig::default(), store).unwrap();
//! server.serve().unwrap();
//! ```

pub mod broadcast;
pub mod config;
mod error;
pub mod manager;
pub mod monitor;
pub mod server;
pub mod store;
pub mod tracker;

pub use broadcast::{Broadcaster, Observer, TcpObserver};
pub use config::{ServerConfig, StoreConfig, StoreKind};
pub use error::{ServerError, StoreError};
pub use manager::{ConnectionManager, Flow, Session};
pub use monitor::{EmergencyMonitor, Escalation, EscalationCause, Resolution};
pub use server::{MonitorServer, ServerHandle};
pub use store::{DataStore, JsonlStore, MockStore, StoreAck, StoreRecord, StoreWriter, open_store};
pub use tracker::{StateChange, UserTracker, WalkingSession};
