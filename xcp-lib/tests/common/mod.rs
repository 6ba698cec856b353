//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use hex;
#[allow(unused_imports)]
pub use std::sync::Arc;
#[allow(unused_imports)]
pub use std::time::Duration;
#[allow(unused_imports)]
pub use xcp_lib::{
    Bridge, BridgeObserver, BridgeResponse, ConnectMode, ConnectionState, ErrorCode, Framing, MasterConfig,
    ParameterRegistry, ParameterValue, ProtocolError, Scripted, SimulatedSlave, TraceEntry, TransportError,
    ValidationError, XcpError, XcpMaster,
};

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Route library logs to the test output; honours RUST_LOG
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// INPUT_VOLTAGE in the default catalog
#[allow(dead_code)]
pub const INPUT_VOLTAGE: u32 = 0x2000_0000;

/// TEMPERATURE in the default catalog
#[allow(dead_code)]
pub const TEMPERATURE: u32 = 0x2000_0010;

/// Uncatalogued address, decoded as unsigned integers
#[allow(dead_code)]
pub const SCRATCH: u32 = 0x3000_0000;

/// Master over a simulated slave with the default catalog and a short timeout
#[allow(dead_code)]
pub fn simulated_master(framing: Framing) -> (Arc<SimulatedSlave>, XcpMaster<SimulatedSlave>) {
    init_tracing();
    let slave = Arc::new(SimulatedSlave::new(framing));
    let master = master_over(slave.clone());
    (slave, master)
}

#[allow(dead_code)]
pub fn master_over(slave: Arc<SimulatedSlave>) -> XcpMaster<SimulatedSlave> {
    let config = MasterConfig::default()
        .with_timeout(Duration::from_millis(200))
        .with_poll_interval(Duration::from_millis(5));
    XcpMaster::new(slave, config, Arc::new(ParameterRegistry::default_catalog()))
}

/// Simulated master that has already completed CONNECT
#[allow(dead_code)]
pub async fn connected_master(framing: Framing) -> (Arc<SimulatedSlave>, XcpMaster<SimulatedSlave>) {
    let (slave, master) = simulated_master(framing);
    master
        .connect(ConnectMode::Normal)
        .await
        .expect("CONNECT against the simulated slave failed");
    (slave, master)
}
