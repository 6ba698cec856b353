//! Command engine: one outstanding command at a time over a shared transport.
//!
//! Every command goes through [`XcpMaster::send_command`] or, for multi-step
//! sequences, through a held [`CommandGuard`]. The guard is the same lock the
//! DTO receiver takes before it polls, so command responses are never consumed
//! by the receiver and two commands never interleave on the link.
//!
//! No command is retried here. A timeout is returned to the caller as
//! [`TransportError::Timeout`]; callers that want to retry (for example
//! repeated CONNECT attempts while a slave boots) must loop themselves.

use crate::config::MasterConfig;
use crate::error::{Result, TransportError, XcpError};
use crate::memory::Mta;
use crate::message::{Command, ConnectInfo, ConnectMode, StatusInfo};
use crate::packet::{CommandCode, CommandRequest, CommandResponse, ResponseKind};
use crate::receiver::{DtoDispatcher, DtoPacket, EventReceiver};
use crate::registry::ParameterRegistry;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::Arc;
use strum_macros::Display;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Session state as seen by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    #[strum(to_string = "DISCONNECTED")]
    Disconnected,
    #[strum(to_string = "CONNECTING")]
    Connecting,
    #[strum(to_string = "CONNECTED")]
    Connected,
}

/// Proof that the caller holds the command lock. Only [`XcpMaster::lock`]
/// hands these out.
pub struct CommandGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

pub struct XcpMaster<T: Transport> {
    transport: Arc<T>,
    config: MasterConfig,
    registry: Arc<ParameterRegistry>,
    command_lock: Arc<Mutex<()>>,
    state: watch::Sender<ConnectionState>,
    connect_info: std::sync::Mutex<Option<ConnectInfo>>,
    mta: std::sync::Mutex<Option<Mta>>,
    dto: Arc<DtoDispatcher>,
    receiver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> XcpMaster<T> {
    pub fn new(transport: Arc<T>, config: MasterConfig, registry: Arc<ParameterRegistry>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            config,
            registry,
            command_lock: Arc::new(Mutex::new(())),
            state,
            connect_info: std::sync::Mutex::new(None),
            mta: std::sync::Mutex::new(None),
            dto: Arc::new(DtoDispatcher::new()),
            receiver: std::sync::Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ParameterRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Session parameters from the last successful CONNECT
    pub fn connect_info(&self) -> Option<ConnectInfo> {
        *lock_unpoisoned(&self.connect_info)
    }

    /// Last MTA set by this master, advanced by UPLOAD and DOWNLOAD
    pub fn mta(&self) -> Option<Mta> {
        *lock_unpoisoned(&self.mta)
    }

    pub(crate) fn track_mta(&self, mta: Option<Mta>) {
        *lock_unpoisoned(&self.mta) = mta;
    }

    pub(crate) fn advance_mta(&self, len: usize) {
        if let Some(mta) = lock_unpoisoned(&self.mta).as_mut() {
            mta.address = mta.address.wrapping_add(len as u32);
        }
    }

    /// Take the command lock for a multi-step sequence
    pub async fn lock(&self) -> CommandGuard<'_> {
        CommandGuard {
            _guard: self.command_lock.lock().await,
        }
    }

    /// Send one request and wait for its response, holding the command lock
    /// for the whole round trip.
    pub async fn send_command(&self, request: CommandRequest) -> Result<CommandResponse> {
        let guard = self.lock().await;
        self.transact(&guard, request).await
    }

    /// Round trip under a lock the caller already holds
    pub async fn transact(&self, _guard: &CommandGuard<'_>, request: CommandRequest) -> Result<CommandResponse> {
        if request.code != CommandCode::Connect && self.state() != ConnectionState::Connected {
            debug!(command = %request.code, "Rejected: not connected");
            return Err(TransportError::NotConnected.into());
        }

        let frame = self.transport.framing().encode(&request)?;
        debug!(command = %request.code, frame = %hex::encode(&frame), "TX");
        self.transport.send(frame).await?;

        let raw = match self.transport.receive(self.config.timeout()).await {
            Ok(raw) => raw,
            Err(TransportError::Timeout) => {
                error!(command = %request.code, "Timeout waiting for slave response");
                return Err(TransportError::Timeout.into());
            }
            Err(e) => return Err(e.into()),
        };
        debug!(command = %request.code, frame = %hex::encode(&raw), "RX");

        let response = CommandResponse::try_from(raw)?;
        match response.kind {
            ResponseKind::Positive => {}
            ResponseKind::Error => {
                if let Some(code) = response.error_code() {
                    error!(command = %request.code, error = %code, "XCP error");
                }
            }
            ResponseKind::Event | ResponseKind::ServiceRequest => {
                warn!(command = %request.code, pid = %response.pid, "Unexpected response PID");
            }
        }
        Ok(response)
    }

    /// Send a command and return the payload of its positive response
    pub async fn execute(&self, command: &Command) -> Result<Bytes> {
        let request = command.to_request()?;
        Ok(self.send_command(request).await?.into_positive()?)
    }

    /// [`execute`](Self::execute) under a lock the caller already holds
    pub async fn execute_locked(&self, guard: &CommandGuard<'_>, command: &Command) -> Result<Bytes> {
        let request = command.to_request()?;
        Ok(self.transact(guard, request).await?.into_positive()?)
    }

    /// Open a session. On any failure the previous state is restored.
    pub async fn connect(&self, mode: ConnectMode) -> Result<ConnectInfo> {
        let previous = self.state.send_replace(ConnectionState::Connecting);

        let result = async {
            let payload = self.execute(&Command::Connect { mode }).await?;
            Ok::<_, XcpError>(ConnectInfo::parse(&payload)?)
        }
        .await;

        match result {
            Ok(info) => {
                *lock_unpoisoned(&self.connect_info) = Some(info);
                self.state.send_replace(ConnectionState::Connected);
                info!(
                    resource = format_args!("0x{:02X}", info.resource.into_bytes()[0]),
                    max_cto = info.max_cto,
                    max_dto = info.max_dto,
                    "XCP Connected"
                );
                debug!(
                    protocol_version = info.protocol_version,
                    transport_version = info.transport_version,
                    "Versions"
                );
                Ok(info)
            }
            Err(e) => {
                self.state.send_replace(previous);
                warn!(error = %e, "XCP CONNECT failed");
                Err(e)
            }
        }
    }

    /// End the session. The master is DISCONNECTED afterwards whatever the
    /// slave answered; a failed DISCONNECT is still reported. Calling this
    /// while already disconnected sends nothing and succeeds.
    pub async fn disconnect(&self) -> Result<()> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        let result = self.execute(&Command::Disconnect).await;
        self.state.send_replace(ConnectionState::Disconnected);
        *lock_unpoisoned(&self.connect_info) = None;
        self.track_mta(None);
        self.join_receiver().await;

        match result {
            Ok(_) => {
                info!("XCP Disconnected");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "DISCONNECT not acknowledged, session dropped anyway");
                Err(e)
            }
        }
    }

    pub async fn get_status(&self) -> Result<StatusInfo> {
        let payload = self.execute(&Command::GetStatus).await?;
        Ok(StatusInfo::parse(&payload)?)
    }

    /// Deliver DTO packets to `callback` instead of the queue
    pub fn register_dto_callback<F>(&self, callback: F)
    where
        F: Fn(&DtoPacket) + Send + Sync + 'static,
    {
        self.dto.register_callback(callback);
    }

    /// Return to queued delivery
    pub fn clear_dto_callback(&self) {
        self.dto.clear_callback();
    }

    /// Take every queued DTO packet, oldest first
    pub fn drain_dto_queue(&self) -> Vec<DtoPacket> {
        self.dto.drain()
    }

    /// Start the background DTO receiver for the current session. It stops
    /// by itself when the session becomes DISCONNECTED.
    pub fn start_dto_reception(&self) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected.into());
        }
        let mut slot = lock_unpoisoned(&self.receiver);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("DTO receiver already running");
            return Ok(());
        }

        let receiver = EventReceiver::new(
            self.transport.clone(),
            self.command_lock.clone(),
            self.state.subscribe(),
            self.dto.clone(),
            self.config.poll_interval(),
        );
        *slot = Some(tokio::spawn(receiver.run()));
        Ok(())
    }

    pub fn is_receiving(&self) -> bool {
        lock_unpoisoned(&self.receiver)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn join_receiver(&self) {
        let handle = lock_unpoisoned(&self.receiver).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "DTO receiver task failed");
            }
        }
    }
}

/// Lock a bookkeeping mutex, recovering the data if a holder panicked
pub(crate) fn lock_unpoisoned<V>(mutex: &std::sync::Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
