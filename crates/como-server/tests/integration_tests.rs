//! Integration tests for como-server over real loopback connections
//!
//! Each test starts a server on an ephemeral port and drives it with the
//! observer client from como-protocol.

#![allow(clippy::float_cmp)] // Exact float comparisons are intentional in tests

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use como_protocol::{ClientEvent, ComoClient, ComoCodec, MessageKind, encode_frame};
use como_server::{ComoServer, ServerConfig, SourceRegistry};
use como_types::{Source, SourceType};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

struct TestServer {
    addr: SocketAddr,
    registry: SourceRegistry,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        })
        .await
    }

    async fn start_with(config: ServerConfig) -> Self {
        let registry = SourceRegistry::new();
        let server = ComoServer::bind(&config, registry.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_with_shutdown(async {
            let _ = stop_rx.await;
        }));

        Self {
            addr,
            registry,
            stop: Some(stop_tx),
            handle,
        }
    }

    /// Connect an observer and wait until the server has attached it
    async fn observer(&self) -> ComoClient {
        let expected = self.registry.session_count() + 1;
        let client = ComoClient::connect(self.addr).await.unwrap();
        self.wait_for_sessions(expected).await;
        client
    }

    async fn wait_for_sessions(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.registry.session_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timeout waiting for session count");
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(2), self.handle)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}

async fn next_event(client: &mut ComoClient) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(1), client.recv())
        .await
        .expect("timeout waiting for event")
        .expect("event stream ended")
}

async fn next_update(client: &mut ComoClient) -> Source {
    match next_event(client).await {
        ClientEvent::SourceUpdated(source) => source,
        other => panic!("Expected SourceUpdated, got {other:?}"),
    }
}

async fn assert_quiet(client: &mut ComoClient) {
    let result = tokio::time::timeout(Duration::from_millis(100), client.recv()).await;
    assert!(result.is_err(), "Unexpected event: {result:?}");
}

#[tokio::test]
async fn test_fan_out_preserves_order_for_every_observer() {
    let server = TestServer::start().await;
    let mut first = server.observer().await;
    let mut second = server.observer().await;

    let mut counter = server
        .registry
        .create_source(SourceType::Int, "counter", "Counter", 1, "")
        .unwrap();
    assert!(counter.set_int(2));
    assert!(counter.set_int(3));

    for observer in [&mut first, &mut second] {
        let mut values = Vec::new();
        for _ in 0..3 {
            let source = next_update(observer).await;
            assert_eq!(source.name(), "counter");
            values.push(source.value().as_int().unwrap());
        }
        assert_eq!(values, vec![1, 2, 3]);
    }

    drop(counter);
    server.stop().await;
}

#[tokio::test]
async fn test_list_request_returns_every_live_source_once() {
    let server = TestServer::start().await;
    let _x = server
        .registry
        .create_source(SourceType::Int, "x", "Counter", 1, "")
        .unwrap();
    let _y = server
        .registry
        .create_source(SourceType::Double, "y", "Gauge", 2.5, "")
        .unwrap();
    let _z = server
        .registry
        .create_source(SourceType::String, "z", "Label", "zed", "")
        .unwrap();

    let mut observer = server.observer().await;
    // Sources that predate the connection are not pushed unasked.
    assert_quiet(&mut observer).await;

    observer.request_source_list().await.unwrap();
    let mut names = HashSet::new();
    for _ in 0..3 {
        assert!(names.insert(next_update(&mut observer).await.name().to_string()));
    }
    assert_eq!(
        names,
        HashSet::from(["x".to_string(), "y".to_string(), "z".to_string()])
    );
    assert_quiet(&mut observer).await;

    server.stop().await;
}

#[tokio::test]
async fn test_deinit_reaches_all_observers_and_leaves_the_list() {
    let server = TestServer::start().await;
    let mut cpu = server
        .registry
        .create_source(SourceType::Double, "cpu.load", "CpuMonitor", 0.5, "")
        .unwrap();
    let _mem = server
        .registry
        .create_source(SourceType::Int, "mem.free", "MemMonitor", 1024, "")
        .unwrap();

    let mut first = server.observer().await;
    let mut second = server.observer().await;

    assert!(cpu.deinit_source());

    for observer in [&mut first, &mut second] {
        match next_event(observer).await {
            ClientEvent::SourceRemoved(source) => assert_eq!(source.name(), "cpu.load"),
            other => panic!("Expected SourceRemoved, got {other:?}"),
        }
    }

    let mut late = server.observer().await;
    late.request_source_list().await.unwrap();
    assert_eq!(next_update(&mut late).await.name(), "mem.free");
    assert_quiet(&mut late).await;

    server.stop().await;
}

#[tokio::test]
async fn test_temperature_scenario() {
    let server = TestServer::start().await;
    let mut observer = server.observer().await;

    let mut temperature = server
        .registry
        .create_source(
            SourceType::Double,
            "temperature",
            "Thermometer",
            21.5,
            "Room temperature",
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(temperature.set_value(23.0));

    let first = next_update(&mut observer).await;
    let second = next_update(&mut observer).await;
    assert_eq!(first.name(), "temperature");
    assert_eq!(second.name(), "temperature");
    assert_eq!(first.value().as_double(), Some(21.5));
    assert_eq!(second.value().as_double(), Some(23.0));
    assert!(second.timestamp() > first.timestamp());
    assert_eq!(second, temperature.snapshot());

    drop(temperature);
    match next_event(&mut observer).await {
        ClientEvent::SourceRemoved(source) => assert_eq!(source.name(), "temperature"),
        other => panic!("Expected SourceRemoved, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_undecodable_request_does_not_close_session() {
    let server = TestServer::start().await;
    let _x = server
        .registry
        .create_source(SourceType::Int, "x", "Counter", 1, "")
        .unwrap();

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    server.wait_for_sessions(1).await;

    // List request, list request with a bogus payload, list request.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&encode_frame(MessageKind::GetListOfSources, &[]));
    bytes.extend_from_slice(&encode_frame(MessageKind::GetListOfSources, b"junk"));
    bytes.extend_from_slice(&encode_frame(MessageKind::GetListOfSources, &[]));
    stream.write_all(&bytes).await.unwrap();

    let mut framed = FramedRead::new(stream, ComoCodec::new());
    for _ in 0..2 {
        let frame = tokio::time::timeout(Duration::from_secs(1), framed.next())
            .await
            .expect("timeout waiting for frame")
            .unwrap()
            .unwrap();
        assert_eq!(frame.kind, MessageKind::Source);
    }
    assert_eq!(server.registry.session_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_stream_closes_only_that_session() {
    let server = TestServer::start().await;
    let mut healthy = server.observer().await;

    let mut broken = TcpStream::connect(server.addr).await.unwrap();
    server.wait_for_sessions(2).await;
    broken.write_all(&[0, 0, 0, 1, 0x7f]).await.unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(1), broken.read(&mut buf))
        .await
        .expect("timeout waiting for close");
    assert!(matches!(read, Ok(0) | Err(_)), "Connection should be closed");
    server.wait_for_sessions(1).await;

    let _x = server
        .registry
        .create_source(SourceType::Int, "x", "Counter", 1, "")
        .unwrap();
    assert_eq!(next_update(&mut healthy).await.name(), "x");

    server.stop().await;
}

#[tokio::test]
async fn test_observer_disconnect_detaches() {
    let server = TestServer::start().await;
    let observer = server.observer().await;

    observer.disconnect().await;
    server.wait_for_sessions(0).await;

    // Producing with nobody attached is fine.
    let mut x = server
        .registry
        .create_source(SourceType::Int, "x", "Counter", 1, "")
        .unwrap();
    assert!(x.set_int(2));

    server.stop().await;
}

#[tokio::test]
async fn test_server_shutdown_disconnects_observers() {
    let server = TestServer::start().await;
    let mut observer = server.observer().await;

    server.stop().await;

    assert_eq!(
        next_event(&mut observer).await,
        ClientEvent::Disconnected { reason: None }
    );
}
