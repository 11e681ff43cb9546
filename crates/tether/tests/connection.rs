//! Integration tests for connection liveness, framing and teardown.
//!
//! The far end of each connection is either a raw socket speaking RFC 6455
//! frames by hand (to observe exactly which frames go over the wire) or a
//! second `Connection`.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tether::{
    Connection, ConnectionConfig, ConnectionState, Error, IdGenerator, Role, TransportError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const OP_TEXT: u8 = 0x1;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

fn config_with_pong_wait(ms: u64) -> ConnectionConfig {
    ConnectionConfig {
        pong_wait_ms: ms,
        ..ConnectionConfig::default()
    }
}

/// A server-side connection and the raw client end of its socket.
async fn connect_with_capacity(
    config: &ConnectionConfig,
    capacity: usize,
) -> (Connection, DuplexStream) {
    let (local, remote) = duplex(capacity);
    let conn = Connection::from_raw_socket(
        local,
        Role::Server,
        &CancellationToken::new(),
        &IdGenerator::new(),
        config,
    )
    .await;
    (conn, remote)
}

async fn connect(config: &ConnectionConfig) -> (Connection, DuplexStream) {
    connect_with_capacity(config, 8192).await
}

/// Read one unmasked frame written by the server side. `None` at end of stream.
async fn next_frame(peer: &mut DuplexStream) -> Option<(u8, Vec<u8>)> {
    let mut head = [0u8; 2];
    peer.read_exact(&mut head).await.ok()?;
    let len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            peer.read_exact(&mut ext).await.ok()?;
            usize::from(u16::from_be_bytes(ext))
        }
        127 => {
            let mut ext = [0u8; 8];
            peer.read_exact(&mut ext).await.ok()?;
            usize::try_from(u64::from_be_bytes(ext)).ok()?
        }
        short => usize::from(short),
    };
    let mut payload = vec![0u8; len];
    peer.read_exact(&mut payload).await.ok()?;
    Some((head[0] & 0x0F, payload))
}

/// Write one client frame. The mask key is all zeroes, so the payload goes
/// out unchanged.
async fn send_frame(peer: &mut DuplexStream, opcode: u8, payload: &[u8]) {
    let mut frame = vec![0x80 | opcode];
    match u8::try_from(payload.len()) {
        Ok(len) if len < 126 => frame.push(0x80 | len),
        _ => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&u16::try_from(payload.len()).unwrap().to_be_bytes());
        }
    }
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.extend_from_slice(payload);
    peer.write_all(&frame).await.unwrap();
}

/// Drain the peer until the connection releases its socket.
async fn drain(peer: &mut DuplexStream) -> Vec<(u8, Vec<u8>)> {
    let mut frames = Vec::new();
    while let Some(frame) = next_frame(peer).await {
        frames.push(frame);
    }
    frames
}

fn closes(frames: &[(u8, Vec<u8>)]) -> usize {
    frames.iter().filter(|(op, _)| *op == OP_CLOSE).count()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    sensor: String,
    value: i64,
    tags: Vec<String>,
}

#[tokio::test(start_paused = true)]
async fn test_read_fails_after_pong_wait_without_pong() {
    let (conn, mut peer) = connect(&config_with_pong_wait(1000)).await;
    let start = Instant::now();

    let err = conn.read().await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded), "got {err:?}");
    assert!(start.elapsed() >= Duration::from_millis(1000));

    // A concurrent stop after the deadline teardown must not close twice
    tokio::join!(conn.stop(), conn.stop());
    assert_eq!(conn.state(), ConnectionState::Closed);

    let frames = drain(&mut peer).await;
    assert_eq!(closes(&frames), 1, "frames: {frames:?}");
    assert_eq!(frames.first(), Some(&(OP_PING, Vec::new())));
}

#[tokio::test(start_paused = true)]
async fn test_stop_racing_deadline_closes_once() {
    let (conn, mut peer) = connect(&config_with_pong_wait(1000)).await;

    let reader = conn.clone();
    let read = tokio::spawn(async move { reader.read().await });
    let stopper = conn.clone();
    let stop = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1000)).await;
        stopper.stop().await;
    });

    let result = read.await.unwrap();
    stop.await.unwrap();

    assert!(matches!(
        result,
        Err(Error::DeadlineExceeded | Error::Cancelled)
    ));
    assert_eq!(conn.state(), ConnectionState::Closed);

    let frames = drain(&mut peer).await;
    assert_eq!(closes(&frames), 1, "frames: {frames:?}");
}

#[tokio::test(start_paused = true)]
async fn test_close_finishes_when_the_closing_caller_is_dropped() {
    let config = ConnectionConfig {
        pong_wait_ms: 1000,
        send_timeout_ms: 5000,
        ..ConnectionConfig::default()
    };
    let (conn, _peer) = connect_with_capacity(&config, 64).await;

    // The peer never drains, so this write parks while holding the write lock
    let writer = conn.clone();
    let write = tokio::spawn(async move { writer.write(vec![b'a'; 400]).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The read hits its deadline, wins the teardown and is dropped while the
    // close still waits for the write lock
    let read = tokio::time::timeout(Duration::from_millis(1500), conn.read()).await;
    assert!(read.is_err(), "read finished early: {read:?}");
    assert!(conn.is_cancelled());
    assert_eq!(conn.state(), ConnectionState::Closing);

    tokio::time::timeout(Duration::from_secs(30), conn.stop())
        .await
        .expect("close must finish without its first caller");
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(matches!(write.await.unwrap(), Err(Error::SendTimeout)));
}

#[tokio::test(start_paused = true)]
async fn test_pong_extends_read_deadline() {
    let (conn, mut peer) = connect(&config_with_pong_wait(1000)).await;
    let start = Instant::now();

    let reader = conn.clone();
    let first = tokio::spawn(async move { reader.read().await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    send_frame(&mut peer, OP_PONG, b"").await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    send_frame(&mut peer, OP_TEXT, b"alive").await;

    // Delivered after the initial deadline, inside the extended one
    assert_eq!(first.await.unwrap().unwrap(), Bytes::from_static(b"alive"));
    assert!(start.elapsed() >= Duration::from_millis(1200));

    let err = conn.read().await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));
    assert!(start.elapsed() >= Duration::from_millis(1500));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_pings_at_ninety_percent_of_pong_wait() {
    let (conn, mut peer) = connect(&config_with_pong_wait(1000)).await;
    let start = Instant::now();

    let frame = next_frame(&mut peer).await.unwrap();
    assert_eq!(frame, (OP_PING, Vec::new()));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(900));
    assert!(elapsed < Duration::from_millis(1000));

    conn.stop().await;
}

#[tokio::test]
async fn test_ping_is_answered_with_matching_pong() {
    let (conn, mut peer) = connect(&ConnectionConfig::default()).await;

    send_frame(&mut peer, OP_PING, b"hi").await;
    send_frame(&mut peer, OP_TEXT, b"x").await;

    assert_eq!(conn.read().await.unwrap(), Bytes::from_static(b"x"));
    assert_eq!(next_frame(&mut peer).await.unwrap(), (OP_PONG, b"hi".to_vec()));
}

#[tokio::test]
async fn test_data_goes_out_as_text() {
    let (conn, mut peer) = connect(&ConnectionConfig::default()).await;

    conn.write(Bytes::from_static(b"{\"count\":3}")).await.unwrap();
    assert_eq!(
        next_frame(&mut peer).await.unwrap(),
        (OP_TEXT, b"{\"count\":3}".to_vec())
    );
}

#[tokio::test]
async fn test_oversized_write_tears_down() {
    let (conn, mut peer) = connect(&ConnectionConfig::default()).await;

    let err = conn.write(vec![b'x'; 600]).await.unwrap_err();
    assert!(
        matches!(
            err,
            Error::Write(TransportError::MessageTooLarge { size: 600, max: 512 })
        ),
        "got {err:?}"
    );

    conn.closed().await;
    let err = conn.write(Bytes::from_static(b"late")).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));

    // Nothing but the close frame reached the wire
    let frames = drain(&mut peer).await;
    assert_eq!(frames, vec![(OP_CLOSE, Vec::new())]);
}

#[tokio::test]
async fn test_oversized_inbound_frame_fails_read() {
    let (conn, mut peer) = connect(&ConnectionConfig::default()).await;

    // Masked text frame header announcing 4 KiB, far over the 512 byte limit
    let header = [0x80 | OP_TEXT, 0x80 | 126, 0x10, 0x00, 0, 0, 0, 0];
    peer.write_all(&header).await.unwrap();

    let err = conn.read().await.unwrap_err();
    assert!(
        matches!(err, Error::Read(TransportError::MessageTooLarge { .. })),
        "got {err:?}"
    );
    assert!(err.is_terminal());
    conn.closed().await;
}

#[tokio::test]
async fn test_decode_failure_keeps_connection_open() {
    let (conn, mut peer) = connect(&ConnectionConfig::default()).await;

    send_frame(&mut peer, OP_TEXT, b"{not json").await;
    let reading = Reading {
        sensor: "t1".to_string(),
        value: -4,
        tags: vec![],
    };
    send_frame(&mut peer, OP_TEXT, &serde_json::to_vec(&reading).unwrap()).await;

    let err = conn.read_decoded::<Reading>().await.unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
    assert!(!err.is_terminal());
    assert_eq!(conn.state(), ConnectionState::Open);

    assert_eq!(conn.read_decoded::<Reading>().await.unwrap(), reading);
}

#[tokio::test]
async fn test_close_frame_from_peer() {
    let (conn, mut peer) = connect(&ConnectionConfig::default()).await;

    send_frame(&mut peer, OP_CLOSE, b"").await;

    let err = conn.read().await.unwrap_err();
    assert!(matches!(err, Error::PeerClosed));
    conn.closed().await;
    assert!(conn.is_closed());

    // The close is answered exactly once
    assert_eq!(closes(&drain(&mut peer).await), 1);
}

#[tokio::test]
async fn test_peer_hangup_is_peer_closed() {
    let (conn, peer) = connect(&ConnectionConfig::default()).await;
    drop(peer);

    let err = conn.read().await.unwrap_err();
    assert!(matches!(err, Error::PeerClosed), "got {err:?}");
}

#[tokio::test]
async fn test_read_after_stop_is_cancelled() {
    let (conn, _peer) = connect(&ConnectionConfig::default()).await;
    conn.stop().await;

    let err = conn.read().await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

async fn pair(parent: &CancellationToken, config: &ConnectionConfig) -> (Connection, Connection) {
    let (left, right) = duplex(8192);
    let ids = IdGenerator::new();
    let a = Connection::from_raw_socket(left, Role::Client, parent, &ids, config).await;
    let b = Connection::from_raw_socket(right, Role::Server, parent, &ids, config).await;
    (a, b)
}

#[tokio::test]
async fn test_encoded_value_round_trips_between_connections() {
    let parent = CancellationToken::new();
    let (a, b) = pair(&parent, &ConnectionConfig::default()).await;
    assert_ne!(a.id(), b.id());

    let reading = Reading {
        sensor: "humidity".to_string(),
        value: 71,
        tags: vec!["north".to_string(), "roof".to_string()],
    };
    a.write_encoded(&reading).await.unwrap();
    assert_eq!(b.read_decoded::<Reading>().await.unwrap(), reading);

    // Stopping one side ends the other with a peer close
    a.stop().await;
    assert!(matches!(b.read().await, Err(Error::PeerClosed)));
}

#[tokio::test]
async fn test_binary_payload_round_trips() {
    let parent = CancellationToken::new();
    let (a, b) = pair(&parent, &ConnectionConfig::default()).await;

    let payload = Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef, 0xff]);
    a.write(payload.clone()).await.unwrap();
    assert_eq!(b.read().await.unwrap(), payload);
}

#[tokio::test(start_paused = true)]
async fn test_connections_answering_each_other_stay_alive() {
    let parent = CancellationToken::new();
    let (a, b) = pair(&parent, &config_with_pong_wait(1000)).await;

    // Pongs are flushed only while someone reads, so keep both sides reading
    let b_reader = b.clone();
    let echo = tokio::spawn(async move {
        while let Ok(data) = b_reader.read().await {
            if b_reader.write(data).await.is_err() {
                break;
            }
        }
    });

    let start = Instant::now();
    let a_reader = a.clone();
    let pending = tokio::spawn(async move { a_reader.read().await });

    tokio::time::sleep(Duration::from_millis(5000)).await;
    a.write(Bytes::from_static(b"still here")).await.unwrap();

    assert_eq!(
        pending.await.unwrap().unwrap(),
        Bytes::from_static(b"still here")
    );
    assert!(start.elapsed() >= Duration::from_millis(5000));
    assert_eq!(a.state(), ConnectionState::Open);
    assert_eq!(b.state(), ConnectionState::Open);

    parent.cancel();
    a.closed().await;
    b.closed().await;
    echo.await.unwrap();
}
