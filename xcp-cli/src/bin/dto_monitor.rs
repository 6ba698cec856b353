use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use xcp_lib::{ConnectMode, MasterConfig, ParameterRegistry, TcpTransport, XcpMaster};

/// Print unsolicited DTO packets from an XCP slave until Ctrl+C
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Slave address
    #[arg(short, long, default_value = "127.0.0.1:5555")]
    slave: String,

    /// Polling interval in milliseconds
    #[arg(short, long, default_value_t = 10)]
    interval_ms: u64,

    /// Response timeout in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    timeout_ms: u64,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(args.verbose.tracing_level_filter().into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    let timeout = Duration::from_millis(args.timeout_ms);
    let transport = TcpTransport::connect(&args.slave, timeout)
        .await
        .with_context(|| format!("Failed to reach slave at {}", args.slave))?;
    let config = MasterConfig::default()
        .with_timeout(timeout)
        .with_poll_interval(Duration::from_millis(args.interval_ms));
    let master = XcpMaster::new(Arc::new(transport), config, Arc::new(ParameterRegistry::empty()));

    let info = master
        .connect(ConnectMode::Normal)
        .await
        .context("XCP CONNECT failed")?;
    info!(max_dto = info.max_dto, "Session open, waiting for DTO packets");

    let count = Arc::new(AtomicU64::new(0));
    let seen = count.clone();
    master.register_dto_callback(move |packet| {
        let n = seen.fetch_add(1, Ordering::Relaxed) + 1;
        println!(
            "[{}] #{:<6} {:>3} bytes  {}",
            packet.arrival_time.format("%H:%M:%S%.3f"),
            n,
            packet.data.len(),
            packet.hex_string()
        );
    });
    master.start_dto_reception()?;

    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Ctrl+C received, shutting down gracefully.");

    if let Err(e) = master.disconnect().await {
        warn!(error = %e, "DISCONNECT failed");
    }
    info!(packets = count.load(Ordering::Relaxed), "Monitor stopped");
    Ok(())
}
