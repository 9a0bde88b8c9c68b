//! 设备端入口
//!
//! 用合成 IMU 数据驱动完整的设备流水线，并从标准输入接收用户响应：
//! `ok` 确认无恙，`help [type]` 请求帮助，`status` 打印当前状态。

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{RecvTimeoutError, Sender};
use gaitwatch_driver::{Device, DeviceBuilder, DeviceConfig, SyntheticSource};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// gaitwatch 设备端
#[derive(Parser, Debug)]
#[command(name = "gaitwatch-device")]
#[command(about = "Wearable fall detection runtime (synthetic IMU)", long_about = None)]
struct Args {
    /// 配置文件路径（默认：<config_dir>/gaitwatch/device.toml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 用户 ID（覆盖配置文件）
    #[arg(long)]
    user_id: Option<String>,

    /// 服务端地址 HOST:PORT（覆盖配置文件）
    #[arg(long)]
    server: Option<String>,

    /// 合成数据随机种子
    #[arg(long)]
    seed: Option<u64>,

    /// 状态日志间隔（秒）
    #[arg(long, default_value = "5")]
    status_interval: u64,
}

enum Command {
    Ok,
    Help(String),
    Status,
    Quit,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gaitwatch=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config: DeviceConfig =
        gaitwatch_tools::load_or_default(args.config.as_deref(), "device")
            .context("Failed to load device config")?;
    if let Some(user_id) = args.user_id {
        config.user_id = user_id;
    }
    if let Some(server) = args.server {
        config.transport.server_addr = server;
    }

    let mut source = SyntheticSource::new(config.sample_rate_hz());
    if let Some(seed) = args.seed {
        source = source.seeded(seed);
    }

    info!(
        "Starting device '{}' -> {} ({} Hz)",
        config.user_id,
        config.transport.server_addr,
        config.sample_rate_hz()
    );
    let device = DeviceBuilder::new()
        .config(config)
        .source(source)
        .build()
        .context("Failed to start device runtime")?;

    let (tx, rx) = crossbeam_channel::bounded::<Command>(16);

    let quit = tx.clone();
    ctrlc::set_handler(move || {
        let _ = quit.try_send(Command::Quit);
    })
    .context("Failed to set signal handler")?;

    spawn_stdin_reader(tx)?;

    let interval = Duration::from_secs(args.status_interval.max(1));
    loop {
        match rx.recv_timeout(interval) {
            Ok(Command::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Command::Ok) => {
                if let Err(e) = device.report_ok() {
                    warn!("Failed to report OK: {}", e);
                }
            },
            Ok(Command::Help(help_type)) => {
                if let Err(e) = device.request_help(&help_type) {
                    warn!("Failed to request help: {}", e);
                }
            },
            Ok(Command::Status) | Err(RecvTimeoutError::Timeout) => log_status(&device),
        }
    }

    info!("Shutting down...");
    device.shutdown();
    Ok(())
}

fn log_status(device: &Device) {
    let status = device.status();
    let metrics = device.metrics();
    let (telemetry, alerts) = device.pending();
    info!(
        "state={} ({:.1}s) walking={} conf={:.2} connected={} pending=alerts:{}/telemetry:{} sent=alerts:{}/telemetry:{} evicted={}",
        status.state.label(),
        status.state_duration_secs,
        status.is_walking,
        status.walking_confidence,
        device.is_connected(),
        alerts,
        telemetry,
        metrics.alerts_sent,
        metrics.telemetry_sent,
        metrics.telemetry_evicted,
    );
    if !device.is_healthy() {
        warn!("Device runtime threads are not healthy");
    }
}

fn spawn_stdin_reader(tx: Sender<Command>) -> Result<()> {
    std::thread::Builder::new()
        .name("gw-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let mut words = line.split_whitespace();
                let command = match words.next() {
                    Some("ok") => Command::Ok,
                    Some("help") => {
                        Command::Help(words.next().unwrap_or("general_help").to_string())
                    },
                    Some("status") => Command::Status,
                    Some("quit") | Some("exit") => Command::Quit,
                    Some(other) => {
                        warn!("Unknown command '{}' (ok | help [type] | status | quit)", other);
                        continue;
                    },
                    None => continue,
                };
                if tx.send(command).is_err() {
                    break;
                }
            }
        })
        .context("Failed to spawn stdin reader")?;
    Ok(())
}
