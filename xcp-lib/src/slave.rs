//! In-process slave for development without hardware and for tests.
//!
//! `SimulatedSlave` implements [`Transport`]: every frame sent to it is
//! answered from a sparse byte memory, and the answer is queued on the same
//! channel that unsolicited DTO packets use, like a single shared socket.

use crate::constants::FIXED_FRAME_SIZE;
use crate::error::TransportError;
use crate::packet::{CommandCode, ErrorCode, Framing, Pid};
use crate::transport::Transport;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::FromPrimitive;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// One frame crossing the simulated link, in the order it crossed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEntry {
    Request(Bytes),
    Response(Bytes),
}

/// Scripted replacement for the next computed answer
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(Bytes),
    /// Swallow the request so the master times out
    Silence,
}

struct SlaveState {
    memory: HashMap<u32, u8>,
    mta: u32,
    connected: bool,
    connect_payload: Bytes,
    script: VecDeque<Scripted>,
    trace: Vec<TraceEntry>,
    sent_frames: usize,
}

pub struct SimulatedSlave {
    framing: Framing,
    response_delay: Duration,
    state: Mutex<SlaveState>,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl SimulatedSlave {
    pub fn new(framing: Framing) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            framing,
            response_delay: Duration::ZERO,
            state: Mutex::new(SlaveState {
                memory: HashMap::new(),
                mta: 0,
                connected: false,
                // CAL/PAG + DAQ + PGM, Intel byte order, max CTO 8, max DTO 8, v1/v1
                connect_payload: Bytes::from_static(&[0x15, 0x00, 0x08, 0x08, 0x00, 0x01, 0x01]),
                script: VecDeque::new(),
                trace: Vec::new(),
                sent_frames: 0,
            }),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Delay every response by `delay` before it is handed to the master
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Payload (after the RES byte) answered to CONNECT
    pub fn set_connect_payload(&self, payload: &[u8]) {
        self.with_state(|s| s.connect_payload = Bytes::copy_from_slice(payload));
    }

    /// Answer the next request with `reply` instead of the computed response
    pub fn script(&self, reply: Scripted) {
        self.with_state(|s| s.script.push_back(reply));
    }

    /// Queue an unsolicited packet as if the slave had emitted it
    pub fn inject_dto(&self, packet: &[u8]) {
        let _ = self.tx.send(Bytes::copy_from_slice(packet));
    }

    pub fn write_memory(&self, address: u32, data: &[u8]) {
        self.with_state(|s| s.write(address, data));
    }

    pub fn read_memory(&self, address: u32, len: usize) -> Vec<u8> {
        self.with_state(|s| s.read(address, len))
    }

    pub fn is_session_open(&self) -> bool {
        self.with_state(|s| s.connected)
    }

    /// Number of frames the master has sent
    pub fn sent_frames(&self) -> usize {
        self.with_state(|s| s.sent_frames)
    }

    pub fn trace(&self) -> Vec<TraceEntry> {
        self.with_state(|s| s.trace.clone())
    }

    /// Compute the answer to one request frame. `None` means no answer.
    pub fn respond(&self, frame: &[u8]) -> Option<Bytes> {
        let reply = self.with_state(|s| {
            s.sent_frames += 1;
            s.trace.push(TraceEntry::Request(Bytes::copy_from_slice(frame)));
            match s.script.pop_front() {
                Some(Scripted::Reply(reply)) => Some(reply),
                Some(Scripted::Silence) => None,
                None => Some(s.handle(frame, self.framing)),
            }
        })?;

        Some(match self.framing {
            Framing::FixedFrame => {
                let mut padded = BytesMut::zeroed(FIXED_FRAME_SIZE.max(reply.len()));
                padded[..reply.len()].copy_from_slice(&reply);
                padded.truncate(FIXED_FRAME_SIZE);
                padded.freeze()
            }
            Framing::Stream => reply,
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SlaveState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }
}

impl SlaveState {
    fn write(&mut self, address: u32, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            self.memory.insert(address.wrapping_add(offset as u32), *byte);
        }
    }

    fn read(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|offset| {
                self.memory
                    .get(&address.wrapping_add(offset as u32))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    fn handle(&mut self, frame: &[u8], framing: Framing) -> Bytes {
        let Some((&code, params)) = frame.split_first() else {
            return error_reply(ErrorCode::CmdSyntax);
        };
        let code = CommandCode::from_primitive(code);

        if !self.connected && code != CommandCode::Connect {
            return error_reply(ErrorCode::Sequence);
        }
        let max_reply = framing.max_payload().unwrap_or(usize::MAX);

        match code {
            CommandCode::Connect => {
                self.connected = true;
                positive(&self.connect_payload.clone())
            }
            CommandCode::Disconnect => {
                self.connected = false;
                positive(&[])
            }
            CommandCode::GetStatus => positive(&[0x00, 0x00, 0x00, 0x00, 0x00]),
            CommandCode::SetMta => match address_at(params, 3) {
                Some(address) => {
                    self.mta = address;
                    positive(&[])
                }
                None => error_reply(ErrorCode::CmdSyntax),
            },
            CommandCode::Upload => match params.first() {
                Some(&n) if usize::from(n) <= max_reply => {
                    let data = self.read(self.mta, n.into());
                    self.mta = self.mta.wrapping_add(n.into());
                    positive(&data)
                }
                Some(_) => error_reply(ErrorCode::OutOfRange),
                None => error_reply(ErrorCode::CmdSyntax),
            },
            CommandCode::Download => match params.split_first() {
                Some((&n, data)) if data.len() >= usize::from(n) => {
                    let data = data[..usize::from(n)].to_vec();
                    self.write(self.mta, &data);
                    self.mta = self.mta.wrapping_add(n.into());
                    positive(&[])
                }
                _ => error_reply(ErrorCode::CmdSyntax),
            },
            CommandCode::ShortUpload => match (params.first(), address_at(params, 3)) {
                (Some(&n), Some(address)) if usize::from(n) <= max_reply => {
                    let data = self.read(address, n.into());
                    positive(&data)
                }
                (Some(_), Some(_)) => error_reply(ErrorCode::OutOfRange),
                _ => error_reply(ErrorCode::CmdSyntax),
            },
            CommandCode::ShortDownload => match (params.first(), address_at(params, 3)) {
                (Some(&n), Some(address)) if params.len() >= 7 + usize::from(n) => {
                    let data = params[7..7 + usize::from(n)].to_vec();
                    self.write(address, &data);
                    positive(&[])
                }
                _ => error_reply(ErrorCode::CmdSyntax),
            },
            _ => error_reply(ErrorCode::CmdUnknown),
        }
    }
}

fn address_at(params: &[u8], offset: usize) -> Option<u32> {
    let bytes = params.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn positive(data: &[u8]) -> Bytes {
    let mut reply = BytesMut::with_capacity(1 + data.len());
    reply.put_u8(Pid::Res.into());
    reply.put_slice(data);
    reply.freeze()
}

fn error_reply(code: ErrorCode) -> Bytes {
    Bytes::from(vec![Pid::Err.into(), code.into()])
}

impl Transport for SimulatedSlave {
    fn framing(&self) -> Framing {
        self.framing
    }

    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        trace!(frame = %hex::encode(&frame), "Slave RX");
        if let Some(reply) = self.respond(&frame) {
            self.tx.send(reply).map_err(|_| TransportError::Closed)?;
        } else {
            debug!("Slave stays silent");
        }
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Bytes, TransportError> {
        let mut rx = self.rx.lock().await;
        let packet = tokio::time::timeout(wait, rx.recv())
            .await?
            .ok_or(TransportError::Closed)?;
        if !self.response_delay.is_zero() {
            tokio::time::sleep(self.response_delay).await;
        }
        self.with_state(|s| s.trace.push(TraceEntry::Response(packet.clone())));
        Ok(packet)
    }
}
