//! 采样循环与发送循环
//!
//! 两个循环运行在各自的线程中，只通过 [`OutboundQueues`](crate::queue::OutboundQueues) 交互：
//!
//! - 采样循环：固定周期（传感器原生采样率），从不因网络而阻塞
//! - 发送循环：固定短周期，负责连接、退避、按优先级清空队列

use crate::config::{DeviceConfig, TransportConfig};
use crate::error::DriverError;
use crate::metrics::DeviceMetrics;
use crate::sensor::SensorSource;
use crate::state::{DeviceContext, DeviceStatus};
use crate::transport::{Backoff, Connector, Link};
use gaitwatch_motion::{FallClassifier, MotionEngine, MotionUpdate};
use gaitwatch_protocol::{
    FallFrame, FallPayload, MotionState, OutboundEvent, SensorSample, TelemetryFrame, timestamp,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 告警入队（队列满时拒绝并计入故障）
pub(crate) fn enqueue_alert(ctx: &DeviceContext, event: OutboundEvent) -> Result<(), DriverError> {
    match ctx.queues.alerts.push(event) {
        Ok(()) => {
            DeviceMetrics::incr(&ctx.metrics.alerts_enqueued);
            Ok(())
        },
        Err(e) => {
            DeviceMetrics::incr(&ctx.metrics.alerts_rejected);
            Err(e)
        },
    }
}

/// 单个采样的处理器
///
/// 运行运动分析引擎，并把结果转换成上行事件：
/// - 进入 Fall：一条 `AlertFall`（无论队列压力如何都尝试入队）
/// - Walking：每 `telemetry_every` 个采样一条遥测
/// - 其他状态：每 `heartbeat_every` 个采样一条心跳遥测
pub struct SampleProcessor {
    engine: MotionEngine,
    ctx: Arc<DeviceContext>,
    telemetry_every: u64,
    heartbeat_every: Option<u64>,
    samples: u64,
    last_fall_probability: Option<f64>,
}

impl SampleProcessor {
    pub fn new(
        config: &DeviceConfig,
        classifier: Box<dyn FallClassifier>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self, DriverError> {
        Self::new_at(Instant::now(), config, classifier, ctx)
    }

    pub fn new_at(
        now: Instant,
        config: &DeviceConfig,
        classifier: Box<dyn FallClassifier>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self, DriverError> {
        Ok(Self {
            engine: MotionEngine::new_at(now, config.motion.clone(), classifier)?,
            ctx,
            telemetry_every: config.telemetry_every(),
            heartbeat_every: config.heartbeat_every(),
            samples: 0,
            last_fall_probability: None,
        })
    }

    pub fn process(&mut self, sample: &SensorSample) -> MotionUpdate {
        self.process_at(Instant::now(), sample)
    }

    pub fn process_at(&mut self, now: Instant, sample: &SensorSample) -> MotionUpdate {
        let update = self.engine.process_at(now, sample);
        self.samples += 1;
        DeviceMetrics::incr(&self.ctx.metrics.samples_total);

        if let Some(verdict) = &update.verdict {
            self.last_fall_probability = Some(verdict.probability);
        }

        if let Some(record) = &update.transition {
            DeviceMetrics::incr(&self.ctx.metrics.transitions);
            info!(
                "State transition: {} -> {} ({:?})",
                record.from.label(),
                record.to.label(),
                record.evidence
            );
            self.ctx.hooks.read().trigger_all(record);
        }

        if update.entered_fall() {
            DeviceMetrics::incr(&self.ctx.metrics.falls_detected);
            let probability = update.verdict.map(|v| v.probability).unwrap_or(1.0);
            let event = OutboundEvent::AlertFall(FallFrame {
                payload: FallPayload::new(&self.ctx.user_id, probability, sample.sensor_data()),
                state_info: Some(update.state_info.clone()),
            });
            // 拒绝已在队列内记录为故障
            let _ = enqueue_alert(&self.ctx, event);
        } else if self.telemetry_due(update.state) {
            self.enqueue_telemetry(&update);
        }

        self.ctx.publish(DeviceStatus {
            state: update.state,
            state_duration_secs: update.state_info.duration,
            is_walking: update.is_walking,
            walking_confidence: update.walking_confidence,
            last_fall_probability: self.last_fall_probability,
            samples: self.samples,
        });

        update
    }

    fn telemetry_due(&self, state: MotionState) -> bool {
        if state == MotionState::Walking {
            return self.samples % self.telemetry_every == 0;
        }
        self.heartbeat_every
            .is_some_and(|every| self.samples % every == 0)
    }

    fn enqueue_telemetry(&self, update: &MotionUpdate) {
        let event = OutboundEvent::Telemetry(TelemetryFrame {
            reading: update
                .sample
                .to_reading(&self.ctx.user_id, timestamp::now_string()),
            state_info: Some(update.state_info.clone()),
        });
        DeviceMetrics::incr(&self.ctx.metrics.telemetry_enqueued);
        if self.ctx.queues.telemetry.push(event).is_some() {
            DeviceMetrics::incr(&self.ctx.metrics.telemetry_evicted);
        }
    }

    pub fn state(&self) -> MotionState {
        self.engine.state()
    }

    pub fn classifier_failures(&self) -> u64 {
        self.engine.classifier_failures()
    }
}

/// 采样循环
///
/// 按固定周期读取传感器；读取失败只记录并计数，数据源耗尽时退出。
pub fn sampling_loop(
    mut source: Box<dyn SensorSource>,
    mut processor: SampleProcessor,
    period: Duration,
    is_running: Arc<AtomicBool>,
) {
    let ctx = processor.ctx.clone();
    let mut deadline = Instant::now();

    while is_running.load(Ordering::Acquire) {
        match source.read() {
            Ok(Some(sample)) => {
                processor.process(&sample);
            },
            Ok(None) => {
                info!("Sensor source exhausted, sampling loop exiting");
                break;
            },
            Err(e) => {
                DeviceMetrics::incr(&ctx.metrics.sensor_errors);
                warn!("Sensor read failed: {}", e);
            },
        }

        deadline += period;
        let now = Instant::now();
        if deadline > now {
            spin_sleep::sleep(deadline - now);
        } else {
            // 处理超时，不追赶
            trace!("Sampling loop overran by {:?}", now - deadline);
            deadline = now;
        }
    }
}

/// 发送循环
///
/// 维持至多一条连接：断线时按指数退避重连，期间丢弃遥测；
/// 连接时每个周期先清空告警再清空遥测。
pub fn transport_loop(
    mut connector: Box<dyn Connector>,
    ctx: Arc<DeviceContext>,
    config: TransportConfig,
    is_running: Arc<AtomicBool>,
) {
    let mut backoff = Backoff::new(config.initial_backoff(), config.max_backoff());
    let tick = config.drain_tick();
    let mut link: Option<Box<dyn Link>> = None;

    while is_running.load(Ordering::Acquire) {
        if link.is_none() {
            match connector.connect() {
                Ok(new_link) => {
                    backoff.reset();
                    DeviceMetrics::incr(&ctx.metrics.connects);
                    discard_telemetry(&ctx);
                    ctx.set_connected(true);
                    info!(
                        "Transport connected to {} ({} alert(s) pending)",
                        connector.target(),
                        ctx.queues.alerts.len()
                    );
                    link = Some(new_link);
                },
                Err(e) => {
                    DeviceMetrics::incr(&ctx.metrics.connect_failures);
                    let delay = backoff.next_delay();
                    warn!("{}; retrying in {:?}", e, delay);
                    wait_disconnected(&ctx, delay, tick, &is_running);
                    continue;
                },
            }
        }

        if let Some(active) = link.as_mut() {
            let alive = drain_once(active.as_mut(), &ctx) && poll_server(active.as_mut());
            if !alive {
                ctx.set_connected(false);
                link = None;
                continue;
            }
        }

        std::thread::sleep(tick);
    }

    ctx.set_connected(false);
    debug!("Transport loop exited");
}

/// 断线等待：分片睡眠，每片检查退出标志并丢弃新产生的遥测
fn wait_disconnected(ctx: &DeviceContext, delay: Duration, tick: Duration, is_running: &AtomicBool) {
    let until = Instant::now() + delay;
    loop {
        discard_telemetry(ctx);
        let now = Instant::now();
        if now >= until || !is_running.load(Ordering::Acquire) {
            break;
        }
        std::thread::sleep(tick.min(until - now));
    }
}

fn discard_telemetry(ctx: &DeviceContext) {
    let dropped = ctx.queues.telemetry.clear();
    if dropped > 0 {
        DeviceMetrics::add(&ctx.metrics.telemetry_discarded, dropped as u64);
        trace!("Discarded {} stale telemetry event(s)", dropped);
    }
}

/// 按优先级清空队列，返回连接是否仍可用
///
/// 告警发送失败时放回告警队首；遥测发送失败直接丢弃。
pub fn drain_once(link: &mut dyn Link, ctx: &DeviceContext) -> bool {
    while let Some(event) = ctx.queues.pop_next() {
        let line = match event.encode() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode {} event, dropping: {}", event.wire_type(), e);
                continue;
            },
        };

        match link.send_line(&line) {
            Ok(()) => {
                if event.is_alert() {
                    DeviceMetrics::incr(&ctx.metrics.alerts_sent);
                    info!("Delivered {} alert", event.wire_type());
                } else {
                    DeviceMetrics::incr(&ctx.metrics.telemetry_sent);
                }
            },
            Err(e) => {
                if event.is_alert() {
                    warn!("Send of {} failed, requeueing: {}", event.wire_type(), e);
                    ctx.queues.alerts.push_front(event);
                    DeviceMetrics::incr(&ctx.metrics.alerts_requeued);
                } else {
                    DeviceMetrics::incr(&ctx.metrics.telemetry_discarded);
                    warn!("Telemetry send failed: {}", e);
                }
                return false;
            },
        }
    }
    true
}

/// 读取服务端回执（只做日志）
fn poll_server(link: &mut dyn Link) -> bool {
    match link.poll_incoming() {
        Ok(lines) => {
            for line in lines {
                log_server_line(&line);
            }
            true
        },
        Err(e) => {
            warn!("Transport link lost: {}", e);
            false
        },
    }
}

fn log_server_line(line: &str) {
    if line == "pong" {
        trace!("pong");
        return;
    }
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) => match value.get("type").and_then(|t| t.as_str()) {
            Some("emergency_declared") | Some("error") => warn!("Server: {}", line),
            Some(kind) => debug!("Server message: {}", kind),
            None => debug!("Server message without type: {}", line),
        },
        Err(_) => debug!("Non-JSON server line: {}", line),
    }
}
