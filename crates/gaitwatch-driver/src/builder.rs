//! Builder 模式实现
//!
//! 提供链式构造 [`Device`] 的便捷方式。

use crate::config::DeviceConfig;
use crate::device::Device;
use crate::error::DriverError;
use crate::hooks::TransitionCallback;
use crate::pipeline::SampleProcessor;
use crate::queue::OutboundQueues;
use crate::sensor::{SensorSource, SyntheticSource};
use crate::state::DeviceContext;
use crate::transport::{Connector, TcpConnector};
use gaitwatch_motion::{FallClassifier, ImpactClassifier};
use std::sync::Arc;

/// Device Builder（链式构造）
///
/// 未指定的部分使用默认实现：
/// - 数据源：[`SyntheticSource`]
/// - 连接：按 `config.transport` 创建的 [`TcpConnector`]
/// - 分类器：[`ImpactClassifier`]
///
/// # Example
///
/// ```no_run
/// use gaitwatch_driver::{DeviceBuilder, DeviceConfig};
///
/// let mut config = DeviceConfig::default();
/// config.transport.server_addr = "10.0.0.5:8000".into();
///
/// let device = DeviceBuilder::new()
///     .config(config)
///     .user_id("pi_kitchen")
///     .build()
///     .unwrap();
/// device.report_ok().unwrap();
/// ```
#[derive(Default)]
pub struct DeviceBuilder {
    config: DeviceConfig,
    user_id: Option<String>,
    source: Option<Box<dyn SensorSource>>,
    connector: Option<Box<dyn Connector>>,
    classifier: Option<Box<dyn FallClassifier>>,
    hooks: Vec<Arc<dyn TransitionCallback>>,
}

impl DeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// 覆盖配置中的 `user_id`
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn source(mut self, source: impl SensorSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Box::new(connector));
        self
    }

    pub fn classifier(mut self, classifier: impl FallClassifier + 'static) -> Self {
        self.classifier = Some(Box::new(classifier));
        self
    }

    pub fn hook(mut self, callback: Arc<dyn TransitionCallback>) -> Self {
        self.hooks.push(callback);
        self
    }

    /// 校验配置并启动后台线程
    pub fn build(self) -> Result<Device, DriverError> {
        let mut config = self.config;
        if let Some(user_id) = self.user_id {
            config.user_id = user_id;
        }
        config.validate()?;

        let ctx = Arc::new(DeviceContext::new(
            config.user_id.clone(),
            OutboundQueues::new(
                config.queues.telemetry_capacity,
                config.queues.alert_capacity,
            ),
        ));
        {
            let mut hooks = ctx.hooks.write();
            for hook in self.hooks {
                hooks.add_callback(hook);
            }
        }

        let classifier = self
            .classifier
            .unwrap_or_else(|| Box::new(ImpactClassifier::default()));
        let processor = SampleProcessor::new(&config, classifier, ctx.clone())?;

        let source = self
            .source
            .unwrap_or_else(|| Box::new(SyntheticSource::new(config.sample_rate_hz())));
        let connector = match self.connector {
            Some(connector) => connector,
            None => Box::new(
                TcpConnector::new(config.transport.server_addr.clone(), config.user_id.clone())
                    .with_timeouts(
                        config.transport.connect_timeout(),
                        config.transport.write_timeout(),
                    ),
            ),
        };

        Device::spawn(&config, ctx, processor, source, connector)
    }
}
