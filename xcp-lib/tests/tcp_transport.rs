//! Master over a real TCP socket, with the simulated slave behind a listener

mod common;

use common::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use xcp_lib::{TcpTransport, Transport};

/// Serve one connection, answering each received frame from `slave`
async fn spawn_slave_server(slave: Arc<SimulatedSlave>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buffer = [0u8; 1024];
        loop {
            let n = match socket.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if let Some(reply) = slave.respond(&buffer[..n]) {
                if socket.write_all(&reply).await.is_err() {
                    break;
                }
            }
        }
    });
    addr
}

fn tcp_master(transport: TcpTransport) -> XcpMaster<TcpTransport> {
    let config = MasterConfig::default().with_timeout(Duration::from_millis(500));
    XcpMaster::new(Arc::new(transport), config, Arc::new(ParameterRegistry::default_catalog()))
}

#[tokio::test]
async fn test_session_over_tcp() {
    let slave = Arc::new(SimulatedSlave::new(Framing::Stream));
    slave.write_memory(INPUT_VOLTAGE, &230.5f32.to_le_bytes());
    let addr = spawn_slave_server(slave.clone()).await;

    let transport = TcpTransport::connect(addr, Duration::from_secs(1)).await.unwrap();
    assert_eq!(transport.peer_addr(), addr);
    assert_eq!(transport.framing(), Framing::Stream);
    let master = tcp_master(transport);

    let info = master.connect(ConnectMode::Normal).await.unwrap();
    assert_eq!(info.max_cto, 8);
    assert_eq!(
        master.read_parameter(INPUT_VOLTAGE, 4).await.unwrap(),
        ParameterValue::Float(230.5)
    );

    master
        .write_parameter(SCRATCH, &ParameterValue::Unsigned(0xCAFE), 2)
        .await
        .unwrap();
    assert_eq!(slave.read_memory(SCRATCH, 2), vec![0xFE, 0xCA]);

    master.disconnect().await.unwrap();
    assert!(!slave.is_session_open());
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let slave = Arc::new(SimulatedSlave::new(Framing::Stream));
    slave.script(Scripted::Silence);
    let addr = spawn_slave_server(slave.clone()).await;

    let master = tcp_master(TcpTransport::connect(addr, Duration::from_secs(1)).await.unwrap());
    let err = master.connect(ConnectMode::Normal).await.unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {}", err);
    assert_eq!(master.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_closed_peer_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
    });

    let transport = TcpTransport::connect(addr, Duration::from_secs(1)).await.unwrap();
    let err = transport.receive(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, TransportError::Closed | TransportError::Io(_)), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_refused_connection() {
    // bind then drop to get a port nobody listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let result = TcpTransport::connect(addr, Duration::from_secs(1)).await;
    assert!(matches!(result, Err(TransportError::Io(_))));
}
