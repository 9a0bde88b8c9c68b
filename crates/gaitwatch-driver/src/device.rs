//! 设备运行时
//!
//! 对外的 [`Device`]，封装采样线程与发送线程。

use crate::config::DeviceConfig;
use crate::error::DriverError;
use crate::hooks::TransitionCallback;
use crate::metrics::MetricsSnapshot;
use crate::pipeline::{SampleProcessor, enqueue_alert, sampling_loop, transport_loop};
use crate::sensor::SensorSource;
use crate::state::{DeviceContext, DeviceStatus};
use crate::transport::Connector;
use gaitwatch_protocol::{HelpReport, OutboundEvent, ResolutionReport, timestamp};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

/// 带超时的线程 join
trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            let _ = tx.send(self.join());
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => result.map(|_| ()),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(Box::new(
                std::io::Error::new(std::io::ErrorKind::TimedOut, "Thread join timeout"),
            )),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Box::new(
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "Thread panicked during join"),
            )),
        }
    }
}

/// 设备运行时
///
/// 创建后立即启动两个后台线程（`gw-sampling` / `gw-transport`），Drop 时停止。
pub struct Device {
    ctx: Arc<DeviceContext>,
    is_running: Arc<AtomicBool>,
    sampling_thread: Option<JoinHandle<()>>,
    transport_thread: Option<JoinHandle<()>>,
}

impl Device {
    pub(crate) fn spawn(
        config: &DeviceConfig,
        ctx: Arc<DeviceContext>,
        processor: SampleProcessor,
        source: Box<dyn SensorSource>,
        connector: Box<dyn Connector>,
    ) -> Result<Self, DriverError> {
        let is_running = Arc::new(AtomicBool::new(true));

        let period = config.sample_period();
        let running = is_running.clone();
        let sampling_thread = std::thread::Builder::new()
            .name("gw-sampling".into())
            .spawn(move || sampling_loop(source, processor, period, running))
            .map_err(|source| DriverError::ThreadSpawn {
                name: "gw-sampling",
                source,
            })?;

        let transport = config.transport.clone();
        let running = is_running.clone();
        let transport_ctx = ctx.clone();
        let transport_thread = match std::thread::Builder::new()
            .name("gw-transport".into())
            .spawn(move || transport_loop(connector, transport_ctx, transport, running))
        {
            Ok(handle) => handle,
            Err(source) => {
                is_running.store(false, Ordering::Release);
                let _ = sampling_thread.join();
                return Err(DriverError::ThreadSpawn {
                    name: "gw-transport",
                    source,
                });
            },
        };

        info!(
            "Device '{}' started ({} Hz sampling)",
            ctx.user_id,
            config.sample_rate_hz()
        );

        Ok(Self {
            ctx,
            is_running,
            sampling_thread: Some(sampling_thread),
            transport_thread: Some(transport_thread),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.ctx.user_id
    }

    /// 用户确认无恙（`emergency_resolved` 告警）
    pub fn report_ok(&self) -> Result<(), DriverError> {
        let report = ResolutionReport {
            user_id: self.ctx.user_id.clone(),
            resolution_type: "user_ok".to_string(),
            timestamp: timestamp::now_string(),
        };
        info!("User reported OK");
        enqueue_alert(&self.ctx, OutboundEvent::AlertEmergencyResolved(report))
    }

    /// 用户请求帮助（`emergency_confirmed_critical` 告警）
    pub fn request_help(&self, help_type: &str) -> Result<(), DriverError> {
        let report = HelpReport {
            user_id: self.ctx.user_id.clone(),
            help_type: help_type.to_string(),
            timestamp: timestamp::now_string(),
        };
        info!("User requested help: {}", help_type);
        enqueue_alert(&self.ctx, OutboundEvent::AlertEmergencyCritical(report))
    }

    /// 注册状态转换回调
    pub fn add_hook(&self, callback: Arc<dyn TransitionCallback>) {
        self.ctx.hooks.write().add_callback(callback);
    }

    pub fn status(&self) -> Arc<DeviceStatus> {
        self.ctx.status()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_connected()
    }

    /// 待发送的（遥测，告警）数量
    pub fn pending(&self) -> (usize, usize) {
        self.ctx.queues.pending()
    }

    /// 两个后台线程是否都还在运行
    pub fn is_healthy(&self) -> bool {
        let alive = |h: &Option<JoinHandle<()>>| h.as_ref().is_some_and(|h| !h.is_finished());
        alive(&self.sampling_thread) && alive(&self.transport_thread)
    }

    /// 停止后台线程并等待退出
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.is_running.store(false, Ordering::Release);

        let join_timeout = Duration::from_secs(2);
        for (name, handle) in [
            ("sampling", self.sampling_thread.take()),
            ("transport", self.transport_thread.take()),
        ] {
            if let Some(handle) = handle
                && handle.join_timeout(join_timeout).is_err()
            {
                error!(
                    "{} thread panicked or failed to shut down within {:?}",
                    name, join_timeout
                );
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop();
    }
}
