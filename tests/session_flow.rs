//! End-to-end session scenarios over the stream transport.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use wakehub::protocol::event::EventType;
use wakehub::{Result, Server, ServerConfig, ServerHandle};

const OK: u32 = 100;
const ERROR: u32 = 110;
const REGISTER: u32 = 700;
const AUTH: u32 = 710;
const HEARTBEAT: u32 = 712;

struct TestServer {
    handle: ServerHandle,
    tcp_addr: std::net::SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<Result<()>>,
}

async fn start_server(heartbeat: Duration) -> TestServer {
    let config = ServerConfig::default_with_overrides(|c| {
        c.tcp_addr = "127.0.0.1:0".to_string();
        c.udp_addr = "127.0.0.1:0".to_string();
        c.heartbeat_interval = heartbeat;
    });

    let server = Server::bind(config).await.expect("bind");
    let handle = server.handle();
    let tcp_addr = server.tcp_addr();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let task = tokio::spawn(server.run(shutdown_rx));

    TestServer {
        handle,
        tcp_addr,
        shutdown_tx,
        task,
    }
}

async fn send_frame(stream: &mut TcpStream, packet_type: u32, payload: &[u8]) {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&packet_type.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.expect("write frame");
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u32, Vec<u8>)> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;
    let packet_type = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((packet_type, payload))
}

async fn expect_frame(stream: &mut TcpStream) -> (u32, Vec<u8>) {
    timeout(Duration::from_secs(5), read_frame(stream))
        .await
        .expect("response in time")
        .expect("frame")
}

async fn expect_eof(stream: &mut TcpStream) {
    let result = timeout(Duration::from_secs(5), read_frame(stream))
        .await
        .expect("close in time");
    assert!(result.is_err(), "expected connection close, got {result:?}");
}

#[tokio::test]
async fn register_auth_heartbeat_and_takeover() {
    let server = start_server(Duration::from_secs(60)).await;

    // register: fresh advisory identity
    let mut first = TcpStream::connect(server.tcp_addr).await.unwrap();
    send_frame(&mut first, REGISTER, b"").await;
    let (packet_type, payload) = expect_frame(&mut first).await;
    assert_eq!(packet_type, OK);
    let issued: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    let id = issued["id"].as_str().expect("uuid string").to_string();

    // authenticate with the issued identity, empty descriptor list
    let auth = format!(r#"{{"id":"{id}","wol_infos":[]}}"#);
    send_frame(&mut first, AUTH, auth.as_bytes()).await;
    let (packet_type, payload) = expect_frame(&mut first).await;
    assert_eq!(packet_type, OK);
    assert!(payload.is_empty());

    send_frame(&mut first, HEARTBEAT, b"").await;
    let (packet_type, payload) = expect_frame(&mut first).await;
    assert_eq!(packet_type, OK);
    assert!(payload.is_empty());

    let dump = server.handle.dump_agent_table().unwrap();
    assert!(dump.contains(&id), "dump should list the identity: {dump}");

    // a second connection authenticating with the same identity wins
    let mut second = TcpStream::connect(server.tcp_addr).await.unwrap();
    send_frame(&mut second, AUTH, auth.as_bytes()).await;
    let (packet_type, payload) = expect_frame(&mut second).await;
    assert_eq!(packet_type, OK);
    assert!(payload.is_empty());

    // the loser is told why and disconnected
    let (packet_type, payload) = expect_frame(&mut first).await;
    assert_eq!(packet_type, ERROR);
    let msg: String = serde_json::from_slice(&payload).unwrap();
    assert!(msg.contains("replace Old"), "takeover message, got: {msg}");
    expect_eof(&mut first).await;

    // the registry resolves the identity only to the winner now
    let dump = server.handle.dump_agent_table().unwrap();
    assert!(dump.starts_with("total: 1\n"), "one live agent: {dump}");
    assert!(dump.contains(&second.local_addr().unwrap().to_string()));

    server.shutdown_tx.send(()).await.unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn heartbeat_before_auth_is_fatal() {
    let server = start_server(Duration::from_secs(60)).await;

    let mut client = TcpStream::connect(server.tcp_addr).await.unwrap();
    send_frame(&mut client, HEARTBEAT, b"").await;

    let (packet_type, payload) = expect_frame(&mut client).await;
    assert_eq!(packet_type, ERROR);
    let msg: String = serde_json::from_slice(&payload).unwrap();
    assert!(msg.contains("authenticated"), "got: {msg}");
    expect_eof(&mut client).await;

    server.shutdown_tx.send(()).await.unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn non_uuid_identity_is_fatal() {
    let server = start_server(Duration::from_secs(60)).await;

    let mut client = TcpStream::connect(server.tcp_addr).await.unwrap();
    send_frame(&mut client, AUTH, br#"{"id":"agent-one","wol_infos":[]}"#).await;

    let (packet_type, _) = expect_frame(&mut client).await;
    assert_eq!(packet_type, ERROR);
    expect_eof(&mut client).await;

    assert_eq!(server.handle.agent_count().unwrap(), 0);

    server.shutdown_tx.send(()).await.unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn foreign_identity_reauth_is_rejected_but_non_fatal() {
    let server = start_server(Duration::from_secs(60)).await;

    let first_id = uuid::Uuid::new_v4();
    let mut client = TcpStream::connect(server.tcp_addr).await.unwrap();
    let auth = format!(r#"{{"id":"{first_id}","wol_infos":[]}}"#);
    send_frame(&mut client, AUTH, auth.as_bytes()).await;
    let (packet_type, _) = expect_frame(&mut client).await;
    assert_eq!(packet_type, OK);

    // same session, different identity: rejected, session stays up
    let other = format!(r#"{{"id":"{}","wol_infos":[]}}"#, uuid::Uuid::new_v4());
    send_frame(&mut client, AUTH, other.as_bytes()).await;
    let (packet_type, _) = expect_frame(&mut client).await;
    assert_eq!(packet_type, ERROR);

    send_frame(&mut client, HEARTBEAT, b"").await;
    let (packet_type, _) = expect_frame(&mut client).await;
    assert_eq!(packet_type, OK);

    server.shutdown_tx.send(()).await.unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn idle_connection_is_evicted_with_exactly_one_error_event() {
    let server = start_server(Duration::from_millis(200)).await;

    let read_errors = Arc::new(AtomicUsize::new(0));
    {
        let read_errors = read_errors.clone();
        server
            .handle
            .bus()
            .register(EventType::ConnectionReadError, move |_event| {
                let read_errors = read_errors.clone();
                async move {
                    read_errors.fetch_add(1, Ordering::SeqCst);
                }
            });
    }

    let id = uuid::Uuid::new_v4();
    let mut client = TcpStream::connect(server.tcp_addr).await.unwrap();
    let auth = format!(r#"{{"id":"{id}","wol_infos":[]}}"#);
    send_frame(&mut client, AUTH, auth.as_bytes()).await;
    let (packet_type, _) = expect_frame(&mut client).await;
    assert_eq!(packet_type, OK);
    assert_eq!(server.handle.agent_count().unwrap(), 1);

    // silence past twice the heartbeat interval: error response, then close
    let (packet_type, payload) = expect_frame(&mut client).await;
    assert_eq!(packet_type, ERROR);
    let msg: String = serde_json::from_slice(&payload).unwrap();
    assert!(msg.contains("timed out"), "got: {msg}");
    expect_eof(&mut client).await;

    // the counting handler runs after the core teardown handler; give the
    // dispatch a moment to finish before asserting
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.handle.agent_count().unwrap(), 0);
    assert_eq!(read_errors.load(Ordering::SeqCst), 1);

    // no duplicate event trickles in later
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(read_errors.load(Ordering::SeqCst), 1);

    server.shutdown_tx.send(()).await.unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_auth_payload_tears_the_connection_down() {
    let server = start_server(Duration::from_secs(60)).await;

    let unmarshal_errors = Arc::new(AtomicUsize::new(0));
    {
        let unmarshal_errors = unmarshal_errors.clone();
        server
            .handle
            .bus()
            .register(EventType::ConnectionUnmarshalError, move |_event| {
                let unmarshal_errors = unmarshal_errors.clone();
                async move {
                    unmarshal_errors.fetch_add(1, Ordering::SeqCst);
                }
            });
    }

    let mut client = TcpStream::connect(server.tcp_addr).await.unwrap();
    send_frame(&mut client, AUTH, b"{not json").await;

    let (packet_type, _) = expect_frame(&mut client).await;
    assert_eq!(packet_type, ERROR);
    expect_eof(&mut client).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(unmarshal_errors.load(Ordering::SeqCst), 1);

    server.shutdown_tx.send(()).await.unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn graceful_shutdown_closes_tracked_connections() {
    let server = start_server(Duration::from_secs(60)).await;

    let id = uuid::Uuid::new_v4();
    let mut client = TcpStream::connect(server.tcp_addr).await.unwrap();
    let auth = format!(r#"{{"id":"{id}","wol_infos":[]}}"#);
    send_frame(&mut client, AUTH, auth.as_bytes()).await;
    let (packet_type, _) = expect_frame(&mut client).await;
    assert_eq!(packet_type, OK);

    server.shutdown_tx.send(()).await.unwrap();
    server.task.await.unwrap().unwrap();

    expect_eof(&mut client).await;
    assert_eq!(server.handle.agent_count().unwrap(), 0);
}

#[tokio::test]
async fn frames_split_across_writes_still_decode() {
    let server = start_server(Duration::from_secs(60)).await;

    let mut client = TcpStream::connect(server.tcp_addr).await.unwrap();

    // dribble a register frame one byte at a time
    let mut frame = Vec::new();
    frame.extend_from_slice(&REGISTER.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    for byte in frame {
        client.write_all(&[byte]).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (packet_type, payload) = expect_frame(&mut client).await;
    assert_eq!(packet_type, OK);
    let issued: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert!(issued["id"].as_str().is_some());

    server.shutdown_tx.send(()).await.unwrap();
    server.task.await.unwrap().unwrap();
}
