#![allow(dead_code)]

/// Common utilities for integration tests
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

/// Build a minimal but well-formed TLS ClientHello record carrying the given
/// server name. Encoding by hand lets tests put things like `host:port` into
/// the SNI, which a real TLS stack would refuse to emit.
pub fn build_client_hello(server_name: &str) -> Vec<u8> {
    let name = server_name.as_bytes();

    // extension: server_name (type 0)
    let mut sni = Vec::new();
    sni.extend_from_slice(&[0x00, 0x00]);
    sni.extend_from_slice(&(name.len() as u16 + 5).to_be_bytes());
    sni.extend_from_slice(&(name.len() as u16 + 3).to_be_bytes());
    sni.push(0x00);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // client_version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0x00); // session_id length
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher_suites
    body.extend_from_slice(&[0x01, 0x00]); // compression_methods
    body.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    body.extend_from_slice(&sni);

    let mut handshake = Vec::new();
    handshake.push(0x01); // client_hello
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = Vec::new();
    record.push(0x16); // handshake record
    record.extend_from_slice(&[0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);

    record
}

/// Start an upstream that captures everything the first connection sends
/// until the sender half-closes. The captured bytes arrive on the channel.
pub async fn start_capture_upstream() -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    start_responding_upstream(Vec::new()).await
}

/// Start an upstream that reads the first connection to EOF, then writes
/// `response` back and closes. The captured request arrives on the channel.
pub async fn start_responding_upstream(
    response: Vec<u8>,
) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut captured = Vec::new();
        let mut buf = vec![0u8; 8192];

        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => captured.extend_from_slice(&buf[..n]),
            }
        }

        if !response.is_empty() {
            socket.write_all(&response).await.unwrap();
        }
        let _ = socket.shutdown().await;
        let _ = tx.send(captured);
    });

    (addr, rx)
}

/// Start a fake HTTP CONNECT proxy that records incoming CONNECT request
/// lines, answers 200 and then echoes every tunneled byte back to the client.
pub async fn start_fake_connect_proxy() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();

            tokio::spawn(async move {
                // read the CONNECT request head
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match socket.read(&mut byte).await {
                        Ok(1) => head.push(byte[0]),
                        _ => return,
                    }
                }

                let head = String::from_utf8_lossy(&head);
                let request_line = head.lines().next().unwrap_or_default().to_string();
                let _ = tx.send(request_line);

                socket
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .unwrap();

                // echo the tunneled bytes back
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    (addr, rx)
}

/// Read from the stream until EOF or the timeout fires, returning what was read.
pub async fn read_to_end_with_timeout(stream: &mut TcpStream, limit: Duration) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut buf = vec![0u8; 8192];

    let _ = timeout(limit, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await;

    collected
}

/// Send a DNS message over UDP and wait for a response.
pub async fn udp_query(server: SocketAddr, packet: &[u8], wait: Duration) -> Option<Vec<u8>> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(packet, server).await.unwrap();

    let mut buf = vec![0u8; 4096];
    match timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => {
            buf.truncate(len);
            Some(buf)
        }
        _ => None,
    }
}

/// Send a DNS message over TCP with the 2-byte length prefix and wait for
/// one length-prefixed response.
pub async fn tcp_query(server: SocketAddr, packet: &[u8], wait: Duration) -> Option<Vec<u8>> {
    timeout(wait, async {
        let mut stream = TcpStream::connect(server).await.ok()?;
        stream
            .write_all(&(packet.len() as u16).to_be_bytes())
            .await
            .ok()?;
        stream.write_all(packet).await.ok()?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.ok()?;
        let mut response = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut response).await.ok()?;
        Some(response)
    })
    .await
    .ok()
    .flatten()
}
