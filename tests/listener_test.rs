//! End-to-end relay tests over loopback TCP

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

use tcp_relay::metrics::Metrics;
use tcp_relay::{Config, Listener, RelayEngine, ShutdownCoordinator};

const WAIT: Duration = Duration::from_secs(5);

struct TestRelay {
    addr: SocketAddr,
    listener: Arc<Listener>,
    metrics: Arc<Metrics>,
    accept_loop: JoinHandle<tcp_relay::Result<()>>,
}

async fn start_relay(upstream_addr: SocketAddr, max_connections: usize) -> TestRelay {
    let mut config = Config::default();
    config.server.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.server.upstream_addr = upstream_addr;
    config.server.connect_timeout = Duration::from_secs(2);
    config.server.shutdown_timeout = Duration::from_secs(2);
    config.server.max_connections = max_connections;
    let config = Arc::new(config);

    let metrics = Arc::new(Metrics::new().unwrap());
    let engine = Arc::new(RelayEngine::from_config(&config, Arc::clone(&metrics)));
    let shutdown = ShutdownCoordinator::new(config.server.shutdown_timeout);

    let listener = Listener::bind(config, engine, Arc::clone(&metrics), shutdown)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let listener = Arc::new(listener);

    let accept_loop = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.run().await })
    };

    TestRelay {
        addr,
        listener,
        metrics,
        accept_loop,
    }
}

/// Address with nothing listening on it
async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Upstream that echoes each connection back and reports what it received
async fn echo_upstream() -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            seen.extend_from_slice(&buf[..n]);
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = tx.send(seen);
            });
        }
    });

    (addr, rx)
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    assert_ok!(
        timeout(WAIT, async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    );
}

#[tokio::test]
async fn test_ping_pong_is_byte_transparent() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let mut ping = [0u8; 4];
        stream.read_exact(&mut ping).await.unwrap();
        stream.write_all(b"PONG").await.unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        (ping, rest)
    });

    let relay = start_relay(upstream_addr, 16).await;
    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(b"PING").await.unwrap();

    let mut pong = [0u8; 4];
    assert_ok!(timeout(WAIT, client.read_exact(&mut pong)).await);
    assert_eq!(&pong, b"PONG");
    drop(client);

    let (ping, rest) = timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(&ping, b"PING");
    assert!(rest.is_empty(), "relay injected bytes: {:?}", rest);
}

#[tokio::test]
async fn test_unreachable_upstream_closes_client() {
    let relay = start_relay(unused_addr().await, 16).await;
    let mut client = TcpStream::connect(relay.addr).await.unwrap();

    let mut buf = [0u8; 16];
    match timeout(WAIT, client.read(&mut buf)).await.unwrap() {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }

    let metrics = Arc::clone(&relay.metrics);
    wait_until(move || metrics.snapshot().dial_failures_total == 1).await;

    let engine = Arc::clone(relay.listener.engine());
    wait_until(move || engine.active_session_count() == 0).await;
}

#[tokio::test]
async fn test_concurrent_pairs_are_isolated() {
    let (upstream_addr, mut received) = echo_upstream().await;
    let relay = start_relay(upstream_addr, 16).await;

    let mut clients = Vec::new();
    for marker in [b'A', b'B'] {
        let addr = relay.addr;
        clients.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let payload = vec![marker; 64 * 1024];
            let (mut reader, mut writer) = stream.split();

            let (_, echoed) = tokio::join!(writer.write_all(&payload), async {
                let mut echoed = vec![0u8; payload.len()];
                reader.read_exact(&mut echoed).await.map(|_| echoed)
            });
            (marker, echoed.unwrap())
        }));
    }

    for client in clients {
        let (marker, echoed) = timeout(WAIT, client).await.unwrap().unwrap();
        assert!(echoed.iter().all(|&b| b == marker));
    }

    for _ in 0..2 {
        let seen = timeout(WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(seen.len(), 64 * 1024);
        assert!(seen.iter().all(|&b| b == seen[0]), "upstream saw mixed streams");
    }
}

#[tokio::test]
async fn test_upstream_close_propagates_to_client() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let relay = start_relay(upstream_addr, 16).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    let (upstream_conn, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();
    drop(upstream_conn);

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_client_close_propagates_to_upstream() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let relay = start_relay(upstream_addr, 16).await;

    let client = TcpStream::connect(relay.addr).await.unwrap();
    let (mut upstream_conn, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();
    drop(client);

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, upstream_conn.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_connection_limit_rejects_extra_clients() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let relay = start_relay(upstream_addr, 1).await;

    let _first = TcpStream::connect(relay.addr).await.unwrap();
    let (_held, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();

    let mut second = TcpStream::connect(relay.addr).await.unwrap();
    let mut buf = [0u8; 16];
    match timeout(WAIT, second.read(&mut buf)).await.unwrap() {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }

    let stats = relay.listener.get_stats();
    assert_eq!(stats.rejected_connections, 1);
    assert_eq!(stats.max_connections, 1);
    assert_eq!(relay.metrics.snapshot().rejected_total, 1);
}

#[tokio::test]
async fn test_graceful_shutdown_closes_pairs() {
    let (upstream_addr, _received) = echo_upstream().await;
    let relay = start_relay(upstream_addr, 16).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    assert_ok!(timeout(WAIT, client.read_exact(&mut echoed)).await);

    let remaining = timeout(WAIT, relay.listener.shutdown()).await.unwrap();
    assert_eq!(remaining, 0);
    assert_ok!(timeout(WAIT, relay.accept_loop).await.unwrap().unwrap());

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_bind_failure_is_startup_error() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let mut config = Config::default();
    config.server.listen_addr = occupied.local_addr().unwrap();
    config.server.upstream_addr = unused_addr().await;

    let metrics = Arc::new(Metrics::new().unwrap());
    let engine = Arc::new(RelayEngine::from_config(&config, Arc::clone(&metrics)));
    let result = Listener::bind(
        Arc::new(config),
        engine,
        metrics,
        ShutdownCoordinator::new(Duration::from_secs(1)),
    )
    .await;

    assert!(result.is_err());
}
