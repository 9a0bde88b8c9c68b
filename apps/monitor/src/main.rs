//! 监控服务端入口

use anyhow::{Context, Result};
use clap::Parser;
use gaitwatch_server::{MonitorServer, ServerConfig, StoreKind, StoreWriter, open_store};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// gaitwatch 监控服务端
///
/// 接收设备上报，跌倒后在宽限期内未恢复则升级为紧急状态并广播给所有观察端
#[derive(Parser, Debug)]
#[command(name = "gaitwatch-monitor")]
#[command(about = "Fall alert monitoring server", long_about = None)]
struct Args {
    /// 配置文件路径（默认：<config_dir>/gaitwatch/monitor.toml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 监听地址（覆盖配置文件），例如 0.0.0.0:8000
    #[arg(long)]
    bind: Option<String>,

    /// 跌倒后升级前的宽限期（秒）
    #[arg(long)]
    grace: Option<f64>,

    /// JSON Lines 存储文件（不指定时使用配置文件中的存储，默认仅记日志）
    #[arg(long)]
    store: Option<PathBuf>,

    /// 日志目录（启用每日轮转的文件日志）
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn init_logging(log_dir: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env().add_directive("gaitwatch=info".parse()?);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "gaitwatch-monitor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

fn run(args: Args) -> Result<()> {
    let mut config: ServerConfig =
        gaitwatch_tools::load_or_default(args.config.as_deref(), "monitor")
            .context("Failed to load monitor config")?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(grace) = args.grace {
        config.grace_period_secs = grace;
    }
    if let Some(path) = args.store {
        config.store.kind = StoreKind::Jsonl;
        config.store.path = Some(path);
    }

    let store = open_store(&config.store).context("Failed to open data store")?;
    let writer = StoreWriter::spawn(store, config.store.channel_capacity)?;
    let server = MonitorServer::bind(config, writer).context("Failed to start server")?;

    let running = server.running_flag();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        running.store(false, std::sync::atomic::Ordering::Release);
    })
    .context("Failed to set signal handler")?;

    info!(
        "Monitor ready on {} (grace {:?}). Press Ctrl+C to stop.",
        server.local_addr()?,
        server.manager().config().grace_period()
    );
    server.serve()?;
    info!("Monitor stopped");
    Ok(())
}

fn main() {
    let args = Args::parse();
    let guard = match init_logging(args.log_dir.as_ref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            process::exit(1);
        },
    };

    let result = run(args);
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    // 退出前刷新文件日志
    drop(guard);
    if result.is_err() {
        process::exit(1);
    }
}
