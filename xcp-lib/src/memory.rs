use crate::constants::SHORT_DOWNLOAD_HEADER;
use crate::error::{ProtocolError, Result, ValidationError};
use crate::master::XcpMaster;
use crate::message::Command;
use crate::registry::ValueKind;
use crate::transport::Transport;
use bytes::Bytes;
use serde_json::{Number, Value};
use std::fmt;
use tracing::debug;

/// Memory transfer address: the pointer UPLOAD and DOWNLOAD work from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mta {
    pub address: u32,
    pub extension: u8,
}

/// A value read from or written to slave memory
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Unsigned(u32),
    Float(f32),
    /// Bytes of a transfer whose size is not 1, 2 or 4
    Raw(Bytes),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Unsigned(v) => Some(f64::from(*v)),
            ParameterValue::Float(v) => Some(f64::from(*v)),
            ParameterValue::Raw(_) => None,
        }
    }

    /// JSON form; raw buffers become hex strings
    pub fn to_json(&self) -> Value {
        match self {
            ParameterValue::Unsigned(v) => Value::from(*v),
            ParameterValue::Float(v) => Number::from_f64(f64::from(*v))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ParameterValue::Raw(bytes) => Value::String(hex::encode(bytes)),
        }
    }

    /// Interpret a JSON number. Non-negative integers that fit 32 bits stay
    /// integers, everything else becomes a float. Numbers beyond the `f32`
    /// range give `None`.
    pub fn from_json(number: &Number) -> Option<Self> {
        if let Some(v) = number.as_u64().and_then(|v| u32::try_from(v).ok()) {
            return Some(ParameterValue::Unsigned(v));
        }
        number
            .as_f64()
            .map(|v| v as f32)
            .filter(|v| v.is_finite())
            .map(ParameterValue::Float)
    }

    /// Little-endian bytes for a transfer of `size` bytes
    pub fn encode(&self, size: usize, kind: ValueKind) -> std::result::Result<Bytes, ValidationError> {
        match (self, size, kind) {
            (ParameterValue::Raw(bytes), _, _) => {
                if bytes.len() != size {
                    return Err(ValidationError::BadSize {
                        size,
                        reason: "raw buffer length differs from transfer size",
                    });
                }
                Ok(bytes.clone())
            }
            (ParameterValue::Float(v), 4, ValueKind::Float) if !v.is_finite() => Err(self.out_of_range(size)),
            (ParameterValue::Float(v), 4, ValueKind::Float) => Ok(Bytes::copy_from_slice(&v.to_le_bytes())),
            (ParameterValue::Unsigned(v), 4, ValueKind::Float) => {
                Ok(Bytes::copy_from_slice(&(*v as f32).to_le_bytes()))
            }
            (_, _, ValueKind::Float) => Err(ValidationError::BadSize {
                size,
                reason: "float parameters are 4 bytes",
            }),
            (_, 1 | 2 | 4, ValueKind::Uint) => {
                let v = self.as_integer().ok_or_else(|| self.out_of_range(size))?;
                if size < 4 && v >> (size * 8) != 0 {
                    return Err(self.out_of_range(size));
                }
                Ok(Bytes::copy_from_slice(&v.to_le_bytes()[..size]))
            }
            _ => Err(ValidationError::BadSize {
                size,
                reason: "only 1, 2 or 4 byte values; pass a raw buffer for other sizes",
            }),
        }
    }

    /// Inverse of [`encode`](Self::encode)
    pub fn decode(data: &[u8], size: usize, kind: ValueKind) -> std::result::Result<Self, ProtocolError> {
        if data.len() < size {
            return Err(ProtocolError::ShortResponse {
                expected: size,
                actual: data.len(),
            });
        }
        let value = match size {
            1 => ParameterValue::Unsigned(u32::from(data[0])),
            2 => ParameterValue::Unsigned(u32::from(u16::from_le_bytes([data[0], data[1]]))),
            4 => {
                let bytes = [data[0], data[1], data[2], data[3]];
                match kind {
                    ValueKind::Float => ParameterValue::Float(f32::from_le_bytes(bytes)),
                    ValueKind::Uint => ParameterValue::Unsigned(u32::from_le_bytes(bytes)),
                }
            }
            _ => ParameterValue::Raw(Bytes::copy_from_slice(&data[..size])),
        };
        Ok(value)
    }

    fn as_integer(&self) -> Option<u32> {
        match self {
            ParameterValue::Unsigned(v) => Some(*v),
            // 2^32 is the first float past u32::MAX
            ParameterValue::Float(v) if v.fract() == 0.0 && *v >= 0.0 && *v < 4_294_967_296.0 => Some(*v as u32),
            _ => None,
        }
    }

    fn out_of_range(&self, size: usize) -> ValidationError {
        ValidationError::OutOfRange {
            value: self.to_string(),
            size,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Unsigned(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::Raw(bytes) => write!(f, "0x{}", hex::encode(bytes)),
        }
    }
}

impl From<u32> for ParameterValue {
    fn from(v: u32) -> Self {
        ParameterValue::Unsigned(v)
    }
}

impl From<f32> for ParameterValue {
    fn from(v: f32) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<Bytes> for ParameterValue {
    fn from(v: Bytes) -> Self {
        ParameterValue::Raw(v)
    }
}

impl<T: Transport> XcpMaster<T> {
    pub async fn set_mta(&self, address: u32, extension: u8) -> Result<()> {
        self.execute(&Command::SetMta { address, extension }).await?;
        self.track_mta(Some(Mta { address, extension }));
        Ok(())
    }

    /// Read `size` bytes from the MTA; the slave advances the MTA.
    pub async fn upload(&self, size: usize) -> Result<Bytes> {
        let payload = self.execute(&Command::Upload { size }).await?;
        let data = take_exact(payload, size)?;
        self.advance_mta(size);
        Ok(data)
    }

    /// Write `data` at the MTA; the slave advances the MTA.
    pub async fn download(&self, data: Bytes) -> Result<()> {
        let len = data.len();
        self.execute(&Command::Download { data }).await?;
        self.advance_mta(len);
        Ok(())
    }

    pub async fn short_upload(&self, address: u32, extension: u8, size: usize) -> Result<Bytes> {
        let payload = self
            .execute(&Command::ShortUpload {
                address,
                extension,
                size,
            })
            .await?;
        take_exact(payload, size)
    }

    pub async fn short_download(&self, address: u32, extension: u8, data: Bytes) -> Result<()> {
        self.execute(&Command::ShortDownload {
            address,
            extension,
            data,
        })
        .await?;
        Ok(())
    }

    /// SET_MTA then UPLOAD, with no other command between them
    pub async fn upload_from(&self, address: u32, extension: u8, size: usize) -> Result<Bytes> {
        let guard = self.lock().await;
        self.execute_locked(&guard, &Command::SetMta { address, extension })
            .await?;
        self.track_mta(Some(Mta { address, extension }));
        let payload = self.execute_locked(&guard, &Command::Upload { size }).await?;
        let data = take_exact(payload, size)?;
        self.advance_mta(size);
        Ok(data)
    }

    /// SET_MTA then DOWNLOAD, with no other command between them
    pub async fn download_to(&self, address: u32, extension: u8, data: Bytes) -> Result<()> {
        let guard = self.lock().await;
        self.execute_locked(&guard, &Command::SetMta { address, extension })
            .await?;
        self.track_mta(Some(Mta { address, extension }));
        let len = data.len();
        self.execute_locked(&guard, &Command::Download { data }).await?;
        self.advance_mta(len);
        Ok(())
    }

    /// Read a value with SHORT_UPLOAD. Whether 4 bytes are a float is
    /// decided by the parameter registry entry for `address`.
    pub async fn read_parameter(&self, address: u32, size: usize) -> Result<ParameterValue> {
        let kind = self.registry().kind_of(address);
        let data = self
            .short_upload(address, self.config().address_extension, size)
            .await?;
        let value = ParameterValue::decode(&data, size, kind)?;
        debug!(address = format_args!("0x{:08X}", address), %value, "Read parameter");
        Ok(value)
    }

    /// Write a value with SHORT_DOWNLOAD, or with SET_MTA + DOWNLOAD under
    /// one lock when the link's frame cannot hold the single-shot command.
    pub async fn write_parameter(&self, address: u32, value: &ParameterValue, size: usize) -> Result<()> {
        let kind = self.registry().kind_of(address);
        let data = value.encode(size, kind)?;
        let extension = self.config().address_extension;

        let fits = self
            .transport()
            .framing()
            .max_payload()
            .is_none_or(|max| SHORT_DOWNLOAD_HEADER + data.len() <= max);
        if fits {
            self.short_download(address, extension, data).await?;
        } else {
            self.download_to(address, extension, data).await?;
        }
        debug!(address = format_args!("0x{:08X}", address), %value, "Wrote parameter");
        Ok(())
    }

    pub async fn read_named(&self, name: &str) -> Result<ParameterValue> {
        let param = self
            .registry()
            .lookup_by_name(name)
            .ok_or_else(|| ValidationError::UnknownParameter(name.to_string()))?;
        let (address, size) = (param.address, param.size);
        self.read_parameter(address, size).await
    }

    pub async fn write_named(&self, name: &str, value: &ParameterValue) -> Result<()> {
        let param = self
            .registry()
            .lookup_by_name(name)
            .ok_or_else(|| ValidationError::UnknownParameter(name.to_string()))?;
        let (address, size) = (param.address, param.size);
        self.write_parameter(address, value, size).await
    }
}

fn take_exact(mut payload: Bytes, size: usize) -> Result<Bytes> {
    if payload.len() < size {
        return Err(ProtocolError::ShortResponse {
            expected: size,
            actual: payload.len(),
        }
        .into());
    }
    payload.truncate(size);
    Ok(payload)
}
