pub mod bridge;
pub mod config;
pub mod constants;
pub mod error;
pub mod master;
pub mod memory;
pub mod message;
pub mod packet;
pub mod receiver;
pub mod registry;
pub mod server;
pub mod slave;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export the main types for easy access
pub use bridge::{Bridge, BridgeObserver, BridgeResponse};
pub use config::{BridgeConfig, Config, MasterConfig};
pub use error::{ProtocolError, Result, TransportError, ValidationError, XcpError};
pub use master::{CommandGuard, ConnectionState, XcpMaster};
pub use memory::{Mta, ParameterValue};
pub use message::{Command, ConnectInfo, ConnectMode, StatusInfo};
pub use packet::{CommandCode, CommandRequest, CommandResponse, ErrorCode, Framing, Pid, ResponseKind};
pub use receiver::{DtoDispatcher, DtoPacket};
pub use registry::{ParameterDefinition, ParameterRegistry, ValueKind};
pub use server::BridgeServer;
pub use slave::{Scripted, SimulatedSlave, TraceEntry};
pub use transport::{TcpTransport, Transport};
