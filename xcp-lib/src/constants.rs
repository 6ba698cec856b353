// Protocol constants for the XCP master

use std::time::Duration;

/// Size of a request or response frame on the fixed-frame (byte-serial) link
pub const FIXED_FRAME_SIZE: usize = 8;

/// Largest payload a single command may carry on the fixed-frame link
pub const MAX_FIXED_PAYLOAD: usize = FIXED_FRAME_SIZE - 1;

/// SHORT_DOWNLOAD parameters ahead of the data: size, reserved, extension, address
pub const SHORT_DOWNLOAD_HEADER: usize = 7;

/// Receive buffer size for stream transports
pub const STREAM_BUFFER_SIZE: usize = 1024;

/// Default time to wait for a command response
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default interval between DTO polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Minimum CONNECT payload: resource, comm mode, max CTO, max DTO (2 bytes)
pub const CONNECT_MIN_PAYLOAD: usize = 5;

/// Full CONNECT payload including protocol and transport layer versions
pub const CONNECT_PAYLOAD_SIZE: usize = 7;

/// GET_STATUS payload: session status, resource protection, protection
pub const GET_STATUS_PAYLOAD_SIZE: usize = 3;

/// Default port of the JSON bridge
pub const DEFAULT_BRIDGE_PORT: u16 = 8000;

/// Default port of a TCP slave
pub const DEFAULT_SLAVE_PORT: u16 = 5555;
