use crate::bridge::{Bridge, BridgeResponse};
use crate::error::Result;
use crate::transport::Transport;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Newline-delimited JSON server in front of a [`Bridge`]: one request
/// object per line in, one response object per line out.
pub struct BridgeServer<T: Transport> {
    bridge: Arc<Bridge<T>>,
    clients: Arc<Mutex<HashSet<SocketAddr>>>,
    shutdown: watch::Sender<bool>,
}

impl<T: Transport> BridgeServer<T> {
    pub fn new(bridge: Arc<Bridge<T>>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bridge,
            clients: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    pub async fn bind(addr: impl ToSocketAddrs) -> Result<TcpListener> {
        Ok(TcpListener::bind(addr).await?)
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|clients| clients.len()).unwrap_or(0)
    }

    /// Accept clients until [`stop`](Self::stop) is called
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        info!(%local, "Bridge server listening");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_client(stream, peer),
                    Err(e) => error!(error = %e, "Error accepting new client"),
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("Bridge server stopped");
        Ok(())
    }

    /// Stop accepting and close every client connection
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    fn spawn_client(&self, stream: TcpStream, peer: SocketAddr) {
        let count = match self.clients.lock() {
            Ok(mut clients) => {
                clients.insert(peer);
                clients.len()
            }
            Err(_) => return,
        };
        info!(%peer, clients = count, "Client connected");
        self.bridge.notify_connection_change(true);

        let bridge = self.bridge.clone();
        let clients = self.clients.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = handle_client(&bridge, stream, shutdown).await {
                warn!(%peer, error = %e, "Error with client");
            }
            let remaining = clients
                .lock()
                .map(|mut clients| {
                    clients.remove(&peer);
                    clients.len()
                })
                .unwrap_or(0);
            info!(%peer, clients = remaining, "Client disconnected");
            bridge.notify_connection_change(remaining > 0);
        });
    }
}

async fn handle_client<T: Transport>(
    bridge: &Bridge<T>,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.changed() => break,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        debug!(request = line, "Bridge request");
        let response: BridgeResponse = bridge.handle_message(line).await;
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
    }
    Ok(())
}
