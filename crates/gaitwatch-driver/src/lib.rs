//! # Gaitwatch Driver
//!
//! 设备侧运行时：采样循环、两个不同丢失策略的上行队列、自动重连的传输会话。
//!
//! ## 线程模型
//!
//! - `gw-sampling`：固定周期读取传感器，运行运动分析，产生上行事件
//! - `gw-transport`：连接 / 退避 / 按优先级清空队列
//!
//! 两者只通过 [`OutboundQueues`] 交互，采样线程从不等待网络。
//!
//! ## 使用示例
//!
//! ```no_run
//! use gaitwatch_driver::DeviceBuilder;
//!
//! let device = DeviceBuilder::new().user_id("pi_01").build().unwrap();
//! println!("{:?}", device.status());
//! ```

mod builder;
pub mod config;
mod device;
mod error;
pub mod hooks;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod sensor;
pub mod state;
pub mod transport;

pub use builder::DeviceBuilder;
pub use config::{DeviceConfig, QueueConfig, TransportConfig};
pub use device::Device;
pub use error::{DriverError, TransportError};
pub use hooks::{ChannelTransitionHook, HookManager, TransitionCallback};
pub use metrics::{DeviceMetrics, MetricsSnapshot};
pub use pipeline::{SampleProcessor, drain_once, sampling_loop, transport_loop};
pub use queue::{AlertQueue, OutboundQueues, TelemetryQueue};
pub use sensor::{Phase, ScriptedSource, SensorSource, SyntheticSource};
pub use state::{DeviceContext, DeviceStatus};
pub use transport::{Backoff, Connector, Link, TcpConnector, TcpLink};
