use crate::constants::{FIXED_FRAME_SIZE, MAX_FIXED_PAYLOAD};
use crate::error::{ProtocolError, ValidationError};
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::IntoStaticStr;

/// Command codes of the protocol family. The engine only issues the
/// session and memory subset; the rest are kept for decoding traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CommandCode {
    // standard
    Connect = 0xFF,
    Disconnect = 0xFE,
    GetStatus = 0xFD,
    Synch = 0xFC,
    GetId = 0xFA,
    GetSeed = 0xF8,
    Unlock = 0xF7,
    SetMta = 0xF6,
    Upload = 0xF5,
    ShortUpload = 0xF4,
    BuildChecksum = 0xF3,
    TransportLayerCmd = 0xF2,
    UserCmd = 0xF1,

    // calibration
    Download = 0xF0,
    DownloadNext = 0xEF,
    DownloadMax = 0xEE,
    ShortDownload = 0xED,
    ModifyBits = 0xEC,

    // paging
    SetCalPage = 0xEB,
    GetCalPage = 0xEA,
    GetPagProcessorInfo = 0xE9,
    GetSegmentInfo = 0xE8,
    GetPageInfo = 0xE7,
    SetSegmentMode = 0xE6,
    GetSegmentMode = 0xE5,
    CopyCalPage = 0xE4,

    // data acquisition
    ClearDaqList = 0xE3,
    SetDaqPtr = 0xE2,
    WriteDaq = 0xE1,
    SetDaqListMode = 0xE0,
    GetDaqListMode = 0xDF,
    StartStopDaqList = 0xDE,
    StartStopSynch = 0xDD,
    GetDaqClock = 0xDC,
    ReadDaq = 0xDB,
    GetDaqProcessorInfo = 0xDA,
    GetDaqResolutionInfo = 0xD9,
    GetDaqListInfo = 0xD8,
    GetDaqEventInfo = 0xD7,
    FreeDaq = 0xD6,
    AllocDaq = 0xD5,
    AllocOdt = 0xD4,
    AllocOdtEntry = 0xD3,

    // programming
    ProgramStart = 0xD2,
    ProgramClear = 0xD1,
    Program = 0xD0,
    ProgramReset = 0xCF,
    GetPgmProcessorInfo = 0xCE,
    GetSectorInfo = 0xCD,
    ProgramPrepare = 0xCC,
    ProgramFormat = 0xCB,
    ProgramNext = 0xCA,
    ProgramMax = 0xC9,
    ProgramVerify = 0xC8,

    // 0x00 is not a command code
    #[num_enum(catch_all)]
    Unknown(u8) = 0x00,
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandCode::Unknown(code) => write!(f, "0x{:02X}", code),
            other => f.write_str(<&'static str>::from(*other)),
        }
    }
}

/// Packet identifier, the first byte of every slave-to-master packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Pid {
    Res = 0xFF,
    Err = 0xFE,
    Ev = 0xFD,
    Serv = 0xFC,

    // 0x00..=0xFB carry DAQ data
    #[num_enum(catch_all)]
    Dto(u8) = 0x00,
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        match self {
            Pid::Res => write!(f, "0x{:02X} (RES)", value),
            Pid::Err => write!(f, "0x{:02X} (ERR)", value),
            Pid::Ev => write!(f, "0x{:02X} (EV)", value),
            Pid::Serv => write!(f, "0x{:02X} (SERV)", value),
            Pid::Dto(_) => write!(f, "0x{:02X}", value),
        }
    }
}

/// Error codes reported by the slave in an ERR packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ErrorCode {
    CmdSync = 0x00,
    CmdBusy = 0x10,
    DaqActive = 0x11,
    PgmActive = 0x12,
    CmdUnknown = 0x20,
    CmdSyntax = 0x21,
    OutOfRange = 0x22,
    WriteProtected = 0x23,
    AccessDenied = 0x24,
    AccessLocked = 0x25,
    PageNotValid = 0x26,
    PageModeNotValid = 0x27,
    SegmentNotValid = 0x28,
    Sequence = 0x29,
    DaqConfig = 0x2A,
    MemoryOverflow = 0x30,
    Generic = 0x31,
    Verify = 0x32,
    ResourceTempNotAccessible = 0x33,

    #[num_enum(catch_all)]
    Unknown(u8) = 0xFF,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Unknown(code) => write!(f, "0x{:02x}", code),
            other => f.write_str(<&'static str>::from(*other)),
        }
    }
}

/// Classification of a packet received in answer to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Positive,
    Error,
    Event,
    ServiceRequest,
}

/// A command code plus its parameter bytes, before framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub code: CommandCode,
    pub payload: Bytes,
}

impl CommandRequest {
    pub fn new(code: CommandCode, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Request without parameters
    pub fn bare(code: CommandCode) -> Self {
        Self::new(code, Bytes::new())
    }

    /// Encoded length before any padding
    pub fn encoded_len(&self) -> usize {
        1 + self.payload.len()
    }
}

/// A decoded slave answer. The PID byte is stripped from `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub kind: ResponseKind,
    pub pid: Pid,
    pub payload: Bytes,
}

impl CommandResponse {
    /// Error code of an ERR packet
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self.kind {
            ResponseKind::Error => self.payload.first().map(|b| ErrorCode::from_primitive(*b)),
            _ => None,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.kind == ResponseKind::Positive
    }

    /// Payload of a positive response, or the reason there is none
    pub fn into_positive(self) -> Result<Bytes, ProtocolError> {
        match self.kind {
            ResponseKind::Positive => Ok(self.payload),
            ResponseKind::Error => {
                let code = self.error_code().ok_or(ProtocolError::ShortResponse {
                    expected: 2,
                    actual: 1,
                })?;
                Err(ProtocolError::Device(code))
            }
            ResponseKind::Event | ResponseKind::ServiceRequest => Err(ProtocolError::UnexpectedResponse(self.pid)),
        }
    }
}

impl TryFrom<Bytes> for CommandResponse {
    type Error = ProtocolError;

    fn try_from(mut bytes: Bytes) -> Result<Self, Self::Error> {
        let pid_byte = *bytes
            .first()
            .ok_or(ProtocolError::ShortResponse { expected: 1, actual: 0 })?;
        let pid = Pid::from_primitive(pid_byte);
        let kind = match pid {
            Pid::Res => ResponseKind::Positive,
            Pid::Err => ResponseKind::Error,
            Pid::Serv => ResponseKind::ServiceRequest,
            Pid::Ev | Pid::Dto(_) => ResponseKind::Event,
        };
        let payload = bytes.split_off(1);
        Ok(Self { kind, pid, payload })
    }
}

/// How a request is laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Byte-serial link: every request and response is exactly 8 bytes.
    FixedFrame,
    /// Socket link: opcode followed by the payload, length implied by the packet.
    #[default]
    Stream,
}

impl Framing {
    /// Largest payload a single request may carry, if the framing bounds it
    pub fn max_payload(&self) -> Option<usize> {
        match self {
            Framing::FixedFrame => Some(MAX_FIXED_PAYLOAD),
            Framing::Stream => None,
        }
    }

    pub fn encode(&self, request: &CommandRequest) -> Result<Bytes, ValidationError> {
        match self {
            Framing::FixedFrame => {
                if request.encoded_len() > FIXED_FRAME_SIZE {
                    return Err(ValidationError::FrameOverflow {
                        len: request.encoded_len(),
                        max: FIXED_FRAME_SIZE,
                    });
                }
                let mut frame = BytesMut::zeroed(FIXED_FRAME_SIZE);
                frame[0] = request.code.into();
                frame[1..request.encoded_len()].copy_from_slice(&request.payload);
                Ok(frame.freeze())
            }
            Framing::Stream => {
                let mut frame = BytesMut::with_capacity(request.encoded_len());
                frame.put_u8(request.code.into());
                frame.put_slice(&request.payload);
                Ok(frame.freeze())
            }
        }
    }
}
