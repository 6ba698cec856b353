use crate::constants::{CONNECT_MIN_PAYLOAD, CONNECT_PAYLOAD_SIZE, GET_STATUS_PAYLOAD_SIZE};
use crate::error::{ProtocolError, ValidationError};
use crate::packet::{CommandCode, CommandRequest};
use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Resource availability (CONNECT) or protection (GET_STATUS) bits.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceMask {
    pub cal_pag: bool,
    #[skip]
    unused0: bool,
    pub daq: bool,
    pub stim: bool,
    pub pgm: bool,
    #[skip]
    unused1: B3,
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommModeBasic {
    /// false = Intel (little endian), true = Motorola
    pub byte_order: bool,
    pub address_granularity: B2,
    #[skip]
    unused: B3,
    pub slave_block_mode: bool,
    pub optional: bool,
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionStatus {
    pub store_cal_req: bool,
    #[skip]
    unused0: bool,
    pub store_daq_req: bool,
    pub clear_daq_req: bool,
    #[skip]
    unused1: B2,
    pub daq_running: bool,
    pub resume: bool,
}

/// CONNECT positive payload as laid out on the wire
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ConnectResponseRaw {
    pub resource: u8,
    pub comm_mode_basic: u8,
    pub max_cto: u8,
    pub max_dto: U16,
    pub protocol_version: u8,
    pub transport_version: u8,
}

/// Session parameters reported by the slave on CONNECT
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectInfo {
    pub resource: ResourceMask,
    pub comm_mode_basic: CommModeBasic,
    pub max_cto: u8,
    pub max_dto: u16,
    pub protocol_version: u8,
    pub transport_version: u8,
}

impl ConnectInfo {
    /// Decode a CONNECT payload. Slaves that omit the trailing version
    /// bytes are accepted; the missing versions read as 0.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < CONNECT_MIN_PAYLOAD {
            return Err(ProtocolError::ShortResponse {
                expected: CONNECT_MIN_PAYLOAD,
                actual: payload.len(),
            });
        }
        let mut padded = [0u8; CONNECT_PAYLOAD_SIZE];
        let n = payload.len().min(CONNECT_PAYLOAD_SIZE);
        padded[..n].copy_from_slice(&payload[..n]);

        let raw = ConnectResponseRaw::ref_from_bytes(&padded[..]).map_err(|_| ProtocolError::ShortResponse {
            expected: CONNECT_PAYLOAD_SIZE,
            actual: payload.len(),
        })?;
        Ok(Self::from(*raw))
    }
}

impl From<ConnectResponseRaw> for ConnectInfo {
    fn from(raw: ConnectResponseRaw) -> Self {
        Self {
            resource: ResourceMask::from_bytes([raw.resource]),
            comm_mode_basic: CommModeBasic::from_bytes([raw.comm_mode_basic]),
            max_cto: raw.max_cto,
            max_dto: raw.max_dto.get(),
            protocol_version: raw.protocol_version,
            transport_version: raw.transport_version,
        }
    }
}

/// GET_STATUS answer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusInfo {
    pub session_status: SessionStatus,
    /// Resources currently protected by seed/key
    pub resource: ResourceMask,
    pub protection: u8,
}

impl StatusInfo {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload {
            [session, resource, protection, ..] => Ok(Self {
                session_status: SessionStatus::from_bytes([*session]),
                resource: ResourceMask::from_bytes([*resource]),
                protection: *protection,
            }),
            _ => Err(ProtocolError::ShortResponse {
                expected: GET_STATUS_PAYLOAD_SIZE,
                actual: payload.len(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnectMode {
    #[default]
    Normal = 0x00,
    UserDefined = 0x01,
}

/// Commands the master issues
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect { mode: ConnectMode },
    Disconnect,
    GetStatus,
    SetMta { address: u32, extension: u8 },
    Upload { size: usize },
    Download { data: Bytes },
    ShortUpload { address: u32, extension: u8, size: usize },
    ShortDownload { address: u32, extension: u8, data: Bytes },
}

impl Command {
    pub fn code(&self) -> CommandCode {
        match self {
            Command::Connect { .. } => CommandCode::Connect,
            Command::Disconnect => CommandCode::Disconnect,
            Command::GetStatus => CommandCode::GetStatus,
            Command::SetMta { .. } => CommandCode::SetMta,
            Command::Upload { .. } => CommandCode::Upload,
            Command::Download { .. } => CommandCode::Download,
            Command::ShortUpload { .. } => CommandCode::ShortUpload,
            Command::ShortDownload { .. } => CommandCode::ShortDownload,
        }
    }

    /// Encode the command parameters. Element counts travel in a single
    /// byte, so transfers of 0 or more than 255 bytes are rejected.
    pub fn to_request(&self) -> Result<CommandRequest, ValidationError> {
        let mut payload = BytesMut::new();
        match self {
            Command::Connect { mode } => payload.put_u8((*mode).into()),
            Command::Disconnect | Command::GetStatus => {}
            Command::SetMta { address, extension } => {
                payload.put_slice(&[0, 0, *extension]);
                payload.put_u32_le(*address);
            }
            Command::Upload { size } => payload.put_u8(transfer_len(*size)?),
            Command::Download { data } => {
                payload.put_u8(transfer_len(data.len())?);
                payload.put_slice(data);
            }
            Command::ShortUpload {
                address,
                extension,
                size,
            } => {
                payload.put_slice(&[transfer_len(*size)?, 0, *extension]);
                payload.put_u32_le(*address);
            }
            Command::ShortDownload {
                address,
                extension,
                data,
            } => {
                payload.put_slice(&[transfer_len(data.len())?, 0, *extension]);
                payload.put_u32_le(*address);
                payload.put_slice(data);
            }
        }
        Ok(CommandRequest::new(self.code(), payload.freeze()))
    }
}

fn transfer_len(size: usize) -> Result<u8, ValidationError> {
    match u8::try_from(size) {
        Ok(0) => Err(ValidationError::BadSize {
            size,
            reason: "transfer must move at least one byte",
        }),
        Ok(n) => Ok(n),
        Err(_) => Err(ValidationError::BadSize {
            size,
            reason: "transfer length must fit in one byte",
        }),
    }
}
