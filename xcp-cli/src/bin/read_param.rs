use anyhow::{Context, Result, bail};
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use xcp_lib::{ConnectMode, MasterConfig, ParameterRegistry, TcpTransport, XcpMaster};

/// Read one parameter from an XCP slave and print it
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Parameter name from the catalog, or an address (0x20000000 or decimal)
    target: String,

    /// Slave address
    #[arg(short, long, default_value = "127.0.0.1:5555")]
    slave: String,

    /// Transfer size in bytes; defaults to the catalog entry, else 4
    #[arg(long)]
    size: Option<usize>,

    /// Parameter catalog (JSON)
    #[arg(short, long)]
    catalog: Option<PathBuf>,

    /// Response timeout in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    timeout_ms: u64,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

fn parse_address(text: &str) -> Option<u32> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
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

    let registry = match &args.catalog {
        Some(path) => ParameterRegistry::from_json_file(path)
            .with_context(|| format!("Failed to load catalog from {:?}", path))?,
        None => ParameterRegistry::default_catalog(),
    };

    let (name, address, catalog_size) = match registry.lookup_by_name(&args.target) {
        Some(param) => (param.name.clone(), param.address, Some(param.size)),
        None => match parse_address(&args.target) {
            Some(address) => {
                let param = registry.lookup_by_address(address);
                (
                    param.map(|p| p.name.clone()).unwrap_or_else(|| args.target.clone()),
                    address,
                    param.map(|p| p.size),
                )
            }
            None => bail!("'{}' is neither a catalogued name nor an address", args.target),
        },
    };
    let size = args.size.or(catalog_size).unwrap_or(4);
    let unit = registry
        .lookup_by_address(address)
        .map(|p| p.unit.clone())
        .unwrap_or_default();

    let timeout = Duration::from_millis(args.timeout_ms);
    let transport = TcpTransport::connect(&args.slave, timeout)
        .await
        .with_context(|| format!("Failed to reach slave at {}", args.slave))?;
    let master = XcpMaster::new(
        Arc::new(transport),
        MasterConfig::default().with_timeout(timeout),
        Arc::new(registry),
    );

    master
        .connect(ConnectMode::Normal)
        .await
        .context("XCP CONNECT failed")?;
    let result = master.read_parameter(address, size).await;
    master.disconnect().await.context("XCP DISCONNECT failed")?;

    let value = result.with_context(|| format!("Failed to read 0x{:08X}", address))?;
    println!("{} (0x{:08X}, {} bytes): {} {}", name, address, size, value, unit);
    Ok(())
}
