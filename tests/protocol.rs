//! Protocol Gateway integration tests over real sockets.

mod common;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use plotsync::adapters::bus::BusGateway;
use plotsync::adapters::tcp::codec::{Frame, FrameCodec, ProtocolCodec};
use plotsync::adapters::tcp::{ConnectionSettings, DecodeResult, TcpGateway, TcpRole};
use plotsync::adapters::{AdapterEvent, Channel, ClientKey, Command, Envelope, Gateway, ListenerHandle};
use plotsync::core::runtime::Runtime;
use plotsync::store::ClientKind;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

fn settings(timeout_ms: u64) -> ConnectionSettings {
    ConnectionSettings {
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(timeout_ms),
        max_frame_bytes: 1024 * 1024,
        read_buffer_limit: 4 * 1024 * 1024,
    }
}

fn frame(envelope: &Envelope) -> Vec<u8> {
    let payload = serde_json::to_vec(envelope).unwrap();
    let mut out = format!("\0\0\0{}\0", payload.len()).into_bytes();
    out.extend_from_slice(&payload);
    out
}

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn tcp_gateway(
    role: TcpRole,
    timeout_ms: u64,
) -> (ListenerHandle, mpsc::UnboundedReceiver<AdapterEvent>, watch::Sender<bool>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = TcpGateway::new(role, any_addr(), settings(timeout_ms), events_tx, shutdown_rx);
    let handle = gateway.start().await.unwrap();
    (handle, events_rx, shutdown_tx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<AdapterEvent>) -> AdapterEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("event in time")
        .expect("event channel open")
}

/// Read frames from a socket until one message frame arrives.
async fn read_message(stream: &mut TcpStream, buffer: &mut BytesMut) -> serde_json::Value {
    let codec = FrameCodec::new(1024 * 1024);
    loop {
        match codec.decode(buffer) {
            DecodeResult::Complete(Frame::Message(value)) => return value,
            DecodeResult::Complete(Frame::Heartbeat) => continue,
            DecodeResult::Invalid(reason) => panic!("invalid frame: {reason}"),
            DecodeResult::Incomplete => {
                let mut chunk = [0u8; 4096];
                let n = timeout(WAIT, stream.read(&mut chunk))
                    .await
                    .expect("data in time")
                    .unwrap();
                assert!(n > 0, "peer closed");
                buffer.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

// ============================================================================
// Framed TCP
// ============================================================================

#[tokio::test]
async fn native_client_registers_and_sends_split_frames() {
    let (handle, mut events, shutdown) = tcp_gateway(TcpRole::Native, 10_000).await;
    let mut stream = TcpStream::connect(handle.local_addr).await.unwrap();

    let register = Envelope::new(Channel::Registration, Command::Register, json!("hololens-1"));
    stream.write_all(&frame(&register)).await.unwrap();
    let conn = match next_event(&mut events).await {
        AdapterEvent::Connected { key, conn, .. } => {
            assert_eq!(key, ClientKey::new("hololens-1", ClientKind::Ar));
            conn
        }
        other => panic!("unexpected event: {other:?}"),
    };

    let request = frame(&Envelope::new(Channel::Plot, Command::Request, json!(null)));
    let (head, tail) = request.split_at(6);
    stream.write_all(head).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    stream.write_all(tail).await.unwrap();

    match next_event(&mut events).await {
        AdapterEvent::Message { conn: from, envelope, .. } => {
            assert_eq!(from, conn);
            assert_eq!(envelope.channel, Channel::Plot.id());
            assert_eq!(envelope.command, "request");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    drop(stream);
    match next_event(&mut events).await {
        AdapterEvent::Disconnected { conn: gone, .. } => assert_eq!(gone, conn),
        other => panic!("unexpected event: {other:?}"),
    }
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn silent_client_times_out_exactly_once() {
    let (handle, mut events, shutdown) = tcp_gateway(TcpRole::Native, 150).await;
    let mut stream = TcpStream::connect(handle.local_addr).await.unwrap();
    let register = Envelope::new(Channel::Registration, Command::Register, json!({"name": "quiet"}));
    stream.write_all(&frame(&register)).await.unwrap();
    assert!(matches!(next_event(&mut events).await, AdapterEvent::Connected { .. }));

    // The server heartbeats while we stay silent.
    let mut chunk = [0u8; 64];
    let n = timeout(WAIT, stream.read(&mut chunk)).await.unwrap().unwrap();
    assert!(chunk[..n].windows(5).any(|w| w == b"\0\0\0h\0"));

    assert!(matches!(next_event(&mut events).await, AdapterEvent::Disconnected { .. }));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn heartbeats_keep_a_client_alive() {
    let (handle, mut events, shutdown) = tcp_gateway(TcpRole::Native, 150).await;
    let mut stream = TcpStream::connect(handle.local_addr).await.unwrap();
    let register = Envelope::new(Channel::Registration, Command::Register, json!("chatty"));
    stream.write_all(&frame(&register)).await.unwrap();
    assert!(matches!(next_event(&mut events).await, AdapterEvent::Connected { .. }));

    for _ in 0..10 {
        stream.write_all(b"\0\0\0h\0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    assert!(events.try_recv().is_err());
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn tracker_is_registered_on_connect() {
    let (handle, mut events, shutdown) = tcp_gateway(TcpRole::Tracker, 10_000).await;
    let _stream = TcpStream::connect(handle.local_addr).await.unwrap();

    match next_event(&mut events).await {
        AdapterEvent::Connected { key, .. } => assert_eq!(key, ClientKey::tracker()),
        other => panic!("unexpected event: {other:?}"),
    }
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn outbound_envelopes_are_framed() {
    let (handle, mut events, shutdown) = tcp_gateway(TcpRole::Native, 10_000).await;
    let mut stream = TcpStream::connect(handle.local_addr).await.unwrap();
    let register = Envelope::new(Channel::Registration, Command::Register, json!("viewer"));
    stream.write_all(&frame(&register)).await.unwrap();
    let outbound = match next_event(&mut events).await {
        AdapterEvent::Connected { outbound, .. } => outbound,
        other => panic!("unexpected event: {other:?}"),
    };

    outbound
        .send(Envelope::new(Channel::Plot, Command::Remove, json!({"id": 4})))
        .unwrap();
    let mut buffer = BytesMut::new();
    let value = read_message(&mut stream, &mut buffer).await;
    assert_eq!(value, json!({"channel": 2, "command": "remove", "payload": {"id": 4}}));

    // Dropping the queue evicts the connection.
    drop(outbound);
    assert!(matches!(next_event(&mut events).await, AdapterEvent::Disconnected { .. }));
    let _ = shutdown.send(true);
}

// ============================================================================
// Message bus
// ============================================================================

#[tokio::test]
async fn reregistering_a_web_name_evicts_the_first_connection() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = BusGateway::new(any_addr(), events_tx, shutdown_rx)
        .start()
        .await
        .unwrap();
    let url = format!("ws://{}", handle.local_addr);
    let register = serde_json::to_string(&Envelope::new(
        Channel::Registration,
        Command::Register,
        json!({"name": "tablet"}),
    ))
    .unwrap();
    let mut registry = Gateway::new();

    let (mut first, _) = connect_async(url.as_str()).await.unwrap();
    first.send(Message::Text(register.clone())).await.unwrap();
    let first_conn = match next_event(&mut events).await {
        AdapterEvent::Connected { key, conn, outbound } => {
            assert_eq!(key, ClientKey::new("tablet", ClientKind::Web));
            assert_eq!(registry.attach(key, conn, outbound), None);
            conn
        }
        other => panic!("unexpected event: {other:?}"),
    };

    let (mut second, _) = connect_async(url.as_str()).await.unwrap();
    second.send(Message::Text(register)).await.unwrap();
    let second_conn = match next_event(&mut events).await {
        AdapterEvent::Connected { key, conn, outbound } => {
            assert_eq!(registry.attach(key, conn, outbound), Some(first_conn));
            conn
        }
        other => panic!("unexpected event: {other:?}"),
    };

    // The evicted connection reports its disconnect, which the registry
    // recognizes as stale.
    match next_event(&mut events).await {
        AdapterEvent::Disconnected { key, conn } => {
            assert_eq!(conn, first_conn);
            assert!(!registry.detach(&key, conn));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    let key = ClientKey::new("tablet", ClientKind::Web);
    assert!(registry.is_current(&key, second_conn));

    let closed = timeout(WAIT, async {
        while let Some(message) = first.next().await {
            if matches!(message, Ok(Message::Close(_)) | Err(_)) {
                return true;
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);

    registry.send(&key, Envelope::new(Channel::Color, Command::Remove, json!({"id": 1})));
    let reply = timeout(WAIT, second.next()).await.unwrap().unwrap().unwrap();
    let envelope: Envelope = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(envelope.channel, Channel::Color.id());
    let _ = shutdown_tx.send(true);
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn plot_added_on_tablet_reaches_native_client() {
    let mut config = common::engine_config();
    config.listeners.native = Some("127.0.0.1:0".into());
    config.listeners.tracker = None;
    config.listeners.web = Some("127.0.0.1:0".into());
    let mut runtime = Runtime::new(config).unwrap();
    runtime.start().await.unwrap();
    let addrs = runtime.local_addrs();
    let addr_of = |name: &str| addrs.iter().find(|(n, _)| *n == name).map(|(_, a)| *a).unwrap();

    let mut native = TcpStream::connect(addr_of("native")).await.unwrap();
    native
        .write_all(&frame(&Envelope::new(Channel::Registration, Command::Register, json!("lens"))))
        .await
        .unwrap();
    let mut buffer = BytesMut::new();
    let ack = read_message(&mut native, &mut buffer).await;
    assert_eq!(ack["channel"], json!(Channel::Registration.id()));
    assert_eq!(ack["payload"]["name"], json!("lens"));

    let (mut tablet, _) = connect_async(format!("ws://{}", addr_of("web"))).await.unwrap();
    let register = Envelope::new(Channel::Registration, Command::Register, json!("tablet"));
    tablet
        .send(Message::Text(serde_json::to_string(&register).unwrap()))
        .await
        .unwrap();
    let add = Envelope::new(Channel::Plot, Command::Add, json!({"dimX": "a", "dimY": "b"}));
    tablet
        .send(Message::Text(serde_json::to_string(&add).unwrap()))
        .await
        .unwrap();

    let added = loop {
        let message = read_message(&mut native, &mut buffer).await;
        if message["channel"] == json!(Channel::Plot.id()) && message["command"] == json!("add") {
            break message;
        }
    };
    assert_eq!(added["payload"]["dimX"], json!("a"));

    runtime.stop().await;
}
