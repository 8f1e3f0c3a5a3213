use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use im_relay::config;
use im_relay::repo::{MemoryMessageRepository, MemoryUserRepository};
use im_relay::server::RelayContext;
use im_relay::service::HmacAuthenticator;
use im_relay::store;
use im_relay::tasks::presence_sweep;

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "im-relay WebSocket delivery server", long_about = None)]
struct Args {
    /// 指定配置文件路径（TOML/JSON/YAML自动识别）
    /// Specify config file path (auto-detect TOML/JSON/YAML)
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
}

/// 初始化日志 / Initialize logging
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::SubscriberBuilder::default()
        .with_env_filter(filter)
        .compact()
        .with_target(false)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = config::load(args.config.as_deref().map(Path::new))?;
    init_tracing(&config.logging.level);

    info!("🎯 Starting im-relay server...");
    if let Some(path) = &args.config {
        info!("🔧 Loaded config file: {}", path);
    }

    let store = store::build(&config).await?;
    let users = Arc::new(MemoryUserRepository::new());
    let messages = Arc::new(MemoryMessageRepository::new());
    let authenticator = Arc::new(HmacAuthenticator::new(config.auth.secret.clone()));

    let ctx = Arc::new(RelayContext::new(
        config.clone(),
        store,
        users,
        messages,
        authenticator,
    ));

    // 后台清扫到期的在线记录 / Background sweep of expired presence records
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    presence_sweep::spawn_sweep_task(
        ctx.presence.clone(),
        config.presence.sweep_interval(),
        shutdown_rx,
    );

    let host = config.server.host.clone();
    let port = config.server.port;
    let server = ctx.clone();
    tokio::select! {
        result = server.run(&host, port) => {
            if let Err(err) = result {
                error!("❌ WebSocket server error: {:#}", err);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    info!("✅ Server shutdown successfully");

    Ok(())
}
