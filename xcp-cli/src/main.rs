use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use xcp_lib::{
    Bridge, BridgeObserver, BridgeServer, Config, ConnectMode, Framing, ParameterRegistry, ParameterValue,
    SimulatedSlave, TcpTransport, Transport, XcpMaster,
};

/// JSON-over-TCP bridge between UI clients and an XCP slave.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Slave address (host:port). Without it the bridge simulates values.
    #[arg(short, long)]
    slave: Option<String>,
    /// Attach a master over the in-process simulated slave
    #[arg(long, conflicts_with = "slave")]
    simulate: bool,
    /// Parameter catalog (JSON). Defaults to the built-in charger catalog.
    #[arg(short, long)]
    catalog: Option<PathBuf>,
    /// Configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Address to listen on
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn setup_logging(log_file_path: Option<&PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false);

    let (file_layer, guard) = if let Some(path) = log_file_path {
        let log_file =
            File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Logs what the bridge publishes
struct LogObserver;

impl BridgeObserver for LogObserver {
    fn on_value_update(&self, values: &BTreeMap<String, f64>) {
        debug!(?values, "Values updated");
    }

    fn on_connection_change(&self, connected: bool) {
        info!(connected, "Client connection changed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_ref(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("Bridge failed: {:?}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    if let Some(host) = cli.host {
        config.bridge.host = host;
    }
    if let Some(port) = cli.port {
        config.bridge.port = port;
    }
    if cli.slave.is_some() {
        config.slave = cli.slave;
    }
    if cli.catalog.is_some() {
        config.catalog = cli.catalog;
    }

    let registry = Arc::new(match &config.catalog {
        Some(path) => ParameterRegistry::from_json_file(path)
            .with_context(|| format!("Failed to load catalog from {:?}", path))?,
        None => ParameterRegistry::default_catalog(),
    });
    info!(parameters = registry.len(), "Parameter catalog loaded");

    if cli.simulate {
        let slave = Arc::new(SimulatedSlave::new(Framing::Stream));
        seed_simulated_memory(&slave, &registry);
        let master = XcpMaster::new(slave, config.master.clone(), registry.clone());
        return serve_with_master(master, registry, &config).await;
    }

    match config.slave.clone() {
        Some(addr) => {
            info!(%addr, "Connecting to XCP slave");
            let transport = TcpTransport::connect(&addr, config.master.timeout())
                .await
                .with_context(|| format!("Failed to reach slave at {}", addr))?;
            let master = XcpMaster::new(Arc::new(transport), config.master.clone(), registry.clone());
            serve_with_master(master, registry, &config).await
        }
        None => {
            warn!("No slave configured, serving simulated values");
            serve(Bridge::<SimulatedSlave>::new(None, registry), &config).await
        }
    }
}

/// Put every catalogued parameter at the middle of its range
fn seed_simulated_memory(slave: &SimulatedSlave, registry: &ParameterRegistry) {
    for param in registry.iter() {
        let mid = (param.min + param.max) / 2.0;
        let value = if param.is_float() {
            ParameterValue::Float(mid as f32)
        } else {
            ParameterValue::Unsigned(mid.round() as u32)
        };
        match value.encode(param.size, param.kind) {
            Ok(bytes) => slave.write_memory(param.address, &bytes),
            Err(e) => warn!(name = %param.name, error = %e, "Cannot seed parameter"),
        }
    }
}

async fn serve_with_master<T: Transport>(
    master: XcpMaster<T>,
    registry: Arc<ParameterRegistry>,
    config: &Config,
) -> Result<()> {
    let info = master
        .connect(ConnectMode::Normal)
        .await
        .context("XCP CONNECT failed")?;
    info!(max_cto = info.max_cto, max_dto = info.max_dto, "Session open");

    let master = Arc::new(master);
    let result = serve(Bridge::new(Some(master.clone()), registry), config).await;

    if let Err(e) = master.disconnect().await {
        warn!(error = %e, "DISCONNECT failed");
    }
    result
}

async fn serve<T: Transport>(bridge: Bridge<T>, config: &Config) -> Result<()> {
    let bridge = Arc::new(bridge);
    bridge.register_observer(Arc::new(LogObserver));

    let addr = config.bridge.bind_addr();
    let listener = BridgeServer::<T>::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let server = Arc::new(BridgeServer::new(bridge));

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Ctrl+C received, shutting down gracefully.");
    server.stop();
    serving.await??;
    Ok(())
}
