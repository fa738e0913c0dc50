//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tls_ws_proxy::config::ProxyConfig;
use tls_ws_proxy::HttpServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const UPGRADE_REQUEST: &str = "GET /chat?room=1 HTTP/1.1\r\n\
Host: proxy.test\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

pub const SWITCHING_PROTOCOLS: &str = "HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";

/// Proxy configuration pointing at `backend`.
pub fn config_for(backend: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.backend.url = format!("http://{}", backend);
    config.timeouts.connect_secs = 2;
    config.timeouts.handshake_secs = 2;
    config.timeouts.request_secs = 5;
    config
}

/// Serve the proxy's router on an ephemeral plaintext port.
///
/// TLS is exercised separately; the dispatch logic is identical.
pub async fn start_proxy(server: &HttpServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// An address nothing is listening on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Read from `stream` up to and including the blank line ending an HTTP head.
/// Reads one byte at a time so nothing after the head is consumed.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed mid-head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Start a backend that records each request head and answers with a fixed
/// status and body.
pub async fn start_recording_backend(
    status: &'static str,
    body: &'static str,
) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let head = read_head(&mut socket).await;
                        let _ = tx.send(head);
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    (addr, rx)
}

/// Start a backend that completes a WebSocket handshake with a canned 101,
/// optionally sends `greeting`, then echoes raw bytes.
pub async fn start_echo_upgrade_backend(
    greeting: &'static [u8],
) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                let _ = tx.send(head);

                let mut answer = SWITCHING_PROTOCOLS.as_bytes().to_vec();
                answer.extend_from_slice(greeting);
                socket.write_all(&answer).await.unwrap();

                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });

    (addr, rx)
}

/// Start a real WebSocket echo server.
pub async fn start_websocket_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                    if msg.is_text() || msg.is_binary() {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Start a listener that accepts one connection and reports how many bytes
/// it read before the peer closed it.
pub async fn start_closing_probe() -> (SocketAddr, mpsc::UnboundedReceiver<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut received = Vec::new();
            let _ = socket.read_to_end(&mut received).await;
            let _ = tx.send(received.len());
        }
    });

    (addr, rx)
}

/// Start a backend serving three behaviours by request head:
/// upgrades get a canned 101 and a byte echo, `GET /hang` is never
/// answered, anything else gets `200 hello over tls`.
pub async fn start_mixed_backend() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                let lowered = head.to_ascii_lowercase();
                let _ = tx.send(head);

                if lowered.contains("upgrade: websocket") {
                    socket.write_all(SWITCHING_PROTOCOLS.as_bytes()).await.unwrap();
                    let (mut rd, mut wr) = socket.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                } else if lowered.starts_with("get /hang") {
                    let mut sink = Vec::new();
                    let _ = socket.read_to_end(&mut sink).await;
                } else {
                    let body = "hello over tls";
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            });
        }
    });

    (addr, rx)
}
