//! End-to-end tests speaking RESP over a real TCP connection.

use bytes::BytesMut;
use marlin_common::ServerConfig;
use marlin_server::Server;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Starts a server on an ephemeral port and returns its address.
async fn start_server() -> std::net::SocketAddr {
    let server = Server::new(ServerConfig::default()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run(listener).await;
    });
    addr
}

/// Encodes a command as a RESP array of bulk strings.
fn encode_command(parts: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(format!("${}\r\n{}\r\n", part.len(), part).as_bytes());
    }
    out
}

/// Sends one command and reads the reply. Replies here are small; reading
/// until the buffer ends on a line boundary is enough to know the server
/// is done talking.
async fn roundtrip(socket: &mut TcpStream, parts: &[&str]) -> String {
    socket.write_all(&encode_command(parts)).await.unwrap();

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let read = tokio::time::timeout(Duration::from_secs(5), socket.read_buf(&mut buf))
            .await
            .expect("timed out waiting for reply")
            .unwrap();
        assert!(read > 0, "connection closed mid-reply");
        if buf.ends_with(b"\r\n") {
            return String::from_utf8(buf.to_vec()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_ping_echo_set_get() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.unwrap();

    assert_eq!(roundtrip(&mut socket, &["PING"]).await, "+PONG\r\n");
    assert_eq!(
        roundtrip(&mut socket, &["ECHO", "hello"]).await,
        "$5\r\nhello\r\n"
    );
    assert_eq!(
        roundtrip(&mut socket, &["SET", "foo", "bar"]).await,
        "+OK\r\n"
    );
    assert_eq!(
        roundtrip(&mut socket, &["GET", "foo"]).await,
        "$3\r\nbar\r\n"
    );
    assert_eq!(roundtrip(&mut socket, &["GET", "nope"]).await, "$-1\r\n");
}

#[tokio::test]
async fn test_stream_commands_over_the_wire() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.unwrap();

    assert_eq!(
        roundtrip(&mut socket, &["XADD", "ev", "1-1", "temp", "20"]).await,
        "$3\r\n1-1\r\n"
    );
    assert_eq!(
        roundtrip(&mut socket, &["XADD", "ev", "1-2", "temp", "21"]).await,
        "$3\r\n1-2\r\n"
    );
    assert_eq!(
        roundtrip(&mut socket, &["TYPE", "ev"]).await,
        "+stream\r\n"
    );

    let got = roundtrip(&mut socket, &["XRANGE", "ev", "-", "+"]).await;
    assert!(got.starts_with("*2\r\n"), "{got}");
    assert!(got.contains("1-1") && got.contains("1-2"), "{got}");

    // Rejected append leaves the stream untouched.
    let got = roundtrip(&mut socket, &["XADD", "ev", "1-1", "temp", "22"]).await;
    assert!(got.starts_with("-ERR"), "{got}");
    let got = roundtrip(&mut socket, &["XRANGE", "ev", "-", "+"]).await;
    assert!(got.starts_with("*2\r\n"), "{got}");
}

#[tokio::test]
async fn test_blocked_xread_woken_by_other_connection() {
    let addr = start_server().await;
    let mut reader = TcpStream::connect(addr).await.unwrap();
    let mut writer = TcpStream::connect(addr).await.unwrap();

    let read_task = tokio::spawn(async move {
        roundtrip(&mut reader, &["XREAD", "BLOCK", "0", "STREAMS", "ev", "$"]).await
    });

    // Give the reader time to block, then append from the writer.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        roundtrip(&mut writer, &["XADD", "ev", "5-5", "f", "v"]).await,
        "$3\r\n5-5\r\n"
    );

    let got = tokio::time::timeout(Duration::from_secs(5), read_task)
        .await
        .expect("blocked reader was not woken")
        .unwrap();
    assert!(got.contains("5-5"), "{got}");
    assert!(got.contains("ev"), "{got}");
}

#[tokio::test]
async fn test_blocked_xread_times_out_with_null() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.unwrap();

    let got = roundtrip(&mut socket, &["XREAD", "BLOCK", "40", "STREAMS", "ev", "$"]).await;
    assert_eq!(got, "$-1\r\n");
}

#[tokio::test]
async fn test_pipelined_commands() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.unwrap();

    // Two commands in one write; two replies come back in order.
    let mut pipelined = encode_command(&["PING"]);
    pipelined.extend_from_slice(&encode_command(&["ECHO", "hi"]));
    socket.write_all(&pipelined).await.unwrap();

    let mut buf = BytesMut::new();
    let want = b"+PONG\r\n$2\r\nhi\r\n";
    while buf.len() < want.len() {
        let read = tokio::time::timeout(Duration::from_secs(5), socket.read_buf(&mut buf))
            .await
            .expect("timed out waiting for replies")
            .unwrap();
        assert!(read > 0, "connection closed mid-reply");
    }
    assert_eq!(&buf[..], want);
}

#[tokio::test]
async fn test_malformed_input_closes_connection() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.unwrap();

    socket.write_all(b"not resp at all\r\n").await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut reply))
        .await
        .expect("server should reply and close")
        .unwrap();
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("-ERR"), "{text}");
}
