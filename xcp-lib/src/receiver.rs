use crate::error::TransportError;
use crate::master::ConnectionState;
use crate::packet::Pid;
use crate::transport::Transport;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use num_enum::FromPrimitive;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

/// Back-off after a transport fault before polling again
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Packet sent by the slave outside the command/response cycle
#[derive(Debug, Clone, PartialEq)]
pub struct DtoPacket {
    pub data: Bytes,
    pub arrival_time: DateTime<Utc>,
}

impl DtoPacket {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            arrival_time: Utc::now(),
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.data.first().map(|b| Pid::from_primitive(*b))
    }

    pub fn hex_string(&self) -> String {
        hex::encode(&self.data)
    }
}

type DtoCallback = Arc<dyn Fn(&DtoPacket) + Send + Sync>;

#[derive(Default)]
struct Sink {
    queue: VecDeque<DtoPacket>,
    callback: Option<DtoCallback>,
}

/// Routes received packets to the registered callback, or to an unbounded
/// queue when none is registered. Only one path is active at a time.
#[derive(Default)]
pub struct DtoDispatcher {
    sink: Mutex<Sink>,
}

impl DtoDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&DtoPacket) + Send + Sync + 'static,
    {
        if let Ok(mut sink) = self.sink.lock() {
            sink.callback = Some(Arc::new(callback));
        }
    }

    pub fn clear_callback(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            sink.callback = None;
        }
    }

    pub fn deliver(&self, packet: DtoPacket) {
        let callback = {
            let Ok(mut sink) = self.sink.lock() else {
                return;
            };
            match &sink.callback {
                Some(callback) => callback.clone(),
                None => {
                    sink.queue.push_back(packet);
                    return;
                }
            }
        };
        // called without the lock so the callback may register or drain
        callback(&packet);
    }

    /// Remove and return all queued packets
    pub fn drain(&self) -> Vec<DtoPacket> {
        self.sink
            .lock()
            .map(|mut sink| sink.queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn queued(&self) -> usize {
        self.sink.lock().map(|sink| sink.queue.len()).unwrap_or(0)
    }
}

/// Background poller for unsolicited packets.
///
/// Each poll first tries the command lock and skips the round when a command
/// is in flight, so it never steals a response.
pub(crate) struct EventReceiver<T: Transport> {
    transport: Arc<T>,
    command_lock: Arc<tokio::sync::Mutex<()>>,
    state: watch::Receiver<ConnectionState>,
    dispatcher: Arc<DtoDispatcher>,
    poll_interval: Duration,
}

impl<T: Transport> EventReceiver<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        command_lock: Arc<tokio::sync::Mutex<()>>,
        state: watch::Receiver<ConnectionState>,
        dispatcher: Arc<DtoDispatcher>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            command_lock,
            state,
            dispatcher,
            poll_interval,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(interval_ms = self.poll_interval.as_millis() as u64, "DTO receiver started");
        let mut received = 0u64;

        loop {
            if *self.state.borrow_and_update() == ConnectionState::Disconnected {
                break;
            }

            let mut delay = self.poll_interval;
            let polled = match self.command_lock.try_lock() {
                Ok(_guard) => Some(self.transport.receive(self.poll_interval).await),
                Err(_) => {
                    debug!("Command in flight, skipping DTO poll");
                    None
                }
            };

            // the command lock is released before any callback runs
            match polled {
                Some(Ok(data)) => {
                    received += 1;
                    trace!(data = %hex::encode(&data), "DTO");
                    self.dispatcher.deliver(DtoPacket::new(data));
                }
                Some(Err(TransportError::Timeout)) | None => {}
                Some(Err(e)) => {
                    error!(error = %e, "Error in DTO receiver");
                    delay = ERROR_BACKOFF;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(received, "DTO receiver stopped");
    }
}
