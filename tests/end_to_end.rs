//! End-to-end tests - a fake device against a live server socket.
//!
//! These drive the full pipeline: TCP bytes through the codec, dispatch,
//! session binding, registry, command encoding and response correlation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use slednik::config::ServerConfig;
use slednik::protocol::crc_itu;
use slednik::server::{CommandOutcome, DeviceServer, SessionRegistry};
use slednik::types::DeviceId;

const LOGIN: [u8; 22] = [
    0x78, 0x78, 0x11, 0x01, 0x03, 0x55, 0x17, 0x21, 0x07, 0x46, 0x10, 0x53, 0x00, 0x36, 0x00,
    0x01, 0x00, 0x01, 0xE0, 0xD1, 0x0D, 0x0A,
];

const LOGIN_ACK: [u8; 10] = [0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0xD9, 0xDC, 0x0D, 0x0A];

fn imei() -> DeviceId {
    "355172107461053".parse().unwrap()
}

fn short_frame(op: u8, payload: &[u8], seq: u16) -> Vec<u8> {
    let declared = 1 + payload.len() + 4;
    let mut out = vec![0x78, 0x78, declared as u8, op];
    out.extend_from_slice(payload);
    out.extend_from_slice(&seq.to_be_bytes());
    let fcs = crc_itu(&out[2..]);
    out.extend_from_slice(&fcs.to_be_bytes());
    out.extend_from_slice(&[0x0D, 0x0A]);
    out
}

async fn start_server() -> (Arc<SessionRegistry>, SocketAddr, broadcast::Sender<()>) {
    let config = ServerConfig {
        listen_port: 0,
        bind_host: "127.0.0.1".into(),
        shutdown_grace: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let server = DeviceServer::new(config);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = server.registry();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move { server.run(listener, shutdown_rx).await.unwrap() });

    (registry, addr, shutdown_tx)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_login_round_trip() {
    let (registry, addr, _shutdown) = start_server().await;

    let mut device = TcpStream::connect(addr).await.unwrap();
    device.write_all(&LOGIN).await.unwrap();

    let mut ack = [0u8; 10];
    device.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack, LOGIN_ACK);

    wait_until(|| registry.get_info(&imei()).is_some()).await;
    let info = registry.get_info(&imei()).unwrap();
    assert_eq!(info.identifier.as_deref(), Some("355172107461053"));
    assert_eq!(registry.stats().session_count, 1);
}

#[tokio::test]
async fn test_fragmented_login_over_socket() {
    let (registry, addr, _shutdown) = start_server().await;

    let mut device = TcpStream::connect(addr).await.unwrap();
    for chunk in [&LOGIN[..7], &LOGIN[7..13], &LOGIN[13..]] {
        device.write_all(chunk).await.unwrap();
        device.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut ack = [0u8; 10];
    device.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack, LOGIN_ACK);

    wait_until(|| !registry.is_empty()).await;
}

#[tokio::test]
async fn test_heartbeat_after_login() {
    let (_registry, addr, _shutdown) = start_server().await;

    let mut device = TcpStream::connect(addr).await.unwrap();
    device.write_all(&LOGIN).await.unwrap();
    let mut ack = [0u8; 10];
    device.read_exact(&mut ack).await.unwrap();

    let heartbeat = short_frame(0x13, &[0x47, 0x06, 0x04, 0x00, 0x02], 0x0010);
    device.write_all(&heartbeat).await.unwrap();

    device.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[2], 0x05);
    assert_eq!(ack[3], 0x13);
    assert_eq!(&ack[4..6], &[0x00, 0x10]);
    assert_eq!(&ack[8..], &[0x0D, 0x0A]);
}

#[tokio::test]
async fn test_unknown_opcode_does_not_disconnect() {
    let (_registry, addr, _shutdown) = start_server().await;

    let mut device = TcpStream::connect(addr).await.unwrap();
    device.write_all(&LOGIN).await.unwrap();
    let mut ack = [0u8; 10];
    device.read_exact(&mut ack).await.unwrap();

    // An opcode we do not know, then garbage, then a heartbeat: the
    // connection must survive all of it.
    device
        .write_all(&short_frame(0x77, &[0x01, 0x02, 0x03], 0x0011))
        .await
        .unwrap();
    device.write_all(&[0x00, 0xFF, 0x00]).await.unwrap();
    device
        .write_all(&short_frame(0x13, &[0x47, 0x06, 0x04, 0x00, 0x02], 0x0012))
        .await
        .unwrap();

    device.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[3], 0x13);
    assert_eq!(&ack[4..6], &[0x00, 0x12]);
}

#[tokio::test]
async fn test_s5_command_correlation() {
    let (registry, addr, _shutdown) = start_server().await;

    let mut device = TcpStream::connect(addr).await.unwrap();
    device.write_all(&LOGIN).await.unwrap();
    let mut ack = [0u8; 10];
    device.read_exact(&mut ack).await.unwrap();
    wait_until(|| registry.get(&imei()).is_some()).await;

    // Operator pushes STATUS#.
    let outcome = registry.send_command(&imei(), "STATUS#").unwrap();
    let CommandOutcome::Accepted { sequence } = outcome else {
        panic!("expected accepted, got {outcome:?}");
    };

    // The device sees a well-formed 0x80 packet containing the ASCII text.
    let mut packet = [0u8; 24];
    device.read_exact(&mut packet).await.unwrap();
    assert_eq!(&packet[..2], &[0x78, 0x78]);
    assert_eq!(packet[3], 0x80);
    assert!(packet
        .windows(7)
        .any(|w| w == [0x53, 0x54, 0x41, 0x54, 0x55, 0x53, 0x23]));

    let session = registry.get(&imei()).unwrap().session;
    assert_eq!(session.with_pending(|p| p.len()), 1);

    // Device answers on the same sequence.
    let mut payload = vec![0x00, 0x00, 0x00, 0x01];
    payload.push(9);
    payload.extend_from_slice(b"STATUS OK");
    let response = short_frame(0x21, &payload, sequence.0);
    device.write_all(&response).await.unwrap();

    // Exactly one match: the pending map empties and stays empty.
    wait_until(|| session.with_pending(|p| p.is_empty())).await;

    // A duplicate response on the same sequence is unmatched and harmless.
    let dup = short_frame(0x21, &payload, sequence.0);
    device.write_all(&dup).await.unwrap();
    device
        .write_all(&short_frame(0x13, &[0x47, 0x06, 0x04, 0x00, 0x02], 0x0042))
        .await
        .unwrap();
    device.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[3], 0x13);
    assert!(session.with_pending(|p| p.is_empty()));
}

#[tokio::test]
async fn test_command_to_offline_device_is_refused() {
    let (registry, _addr, _shutdown) = start_server().await;
    assert_eq!(
        registry.send_command(&imei(), "STATUS#").unwrap(),
        CommandOutcome::NotConnected
    );
}

#[tokio::test]
async fn test_relogin_replaces_and_close_is_owner_checked() {
    let (registry, addr, _shutdown) = start_server().await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(&LOGIN).await.unwrap();
    let mut ack = [0u8; 10];
    first.read_exact(&mut ack).await.unwrap();
    wait_until(|| registry.session_count() == 1).await;

    let mut second = TcpStream::connect(addr).await.unwrap();
    second.write_all(&LOGIN).await.unwrap();
    second.read_exact(&mut ack).await.unwrap();

    // Property 8: still exactly one registry entry.
    assert_eq!(registry.session_count(), 1);

    // Dropping the replaced socket must not evict the new session.
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.session_count(), 1);
    assert!(matches!(
        registry.send_command(&imei(), "WHERE#").unwrap(),
        CommandOutcome::Accepted { .. }
    ));

    drop(second);
    wait_until(|| registry.is_empty()).await;
}

#[tokio::test]
async fn test_graceful_shutdown_drains() {
    let (registry, addr, shutdown) = start_server().await;

    let mut device = TcpStream::connect(addr).await.unwrap();
    device.write_all(&LOGIN).await.unwrap();
    let mut ack = [0u8; 10];
    device.read_exact(&mut ack).await.unwrap();
    wait_until(|| !registry.is_empty()).await;

    // Stop accepting; the connected device drains, then the server exits
    // within its grace period (asserted by the run task not hanging).
    shutdown.send(()).unwrap();
    drop(device);
    wait_until(|| registry.is_empty()).await;
}
