//! Common utilities for integration tests
#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tcp_forwarder::AppConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::time::timeout;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Find `count` consecutive available ports, returns the first one
pub fn get_available_port_range(count: u16) -> u16 {
    for _ in 0..100 {
        let start = get_available_port();
        if start.checked_add(count).is_none() {
            continue;
        }
        let all_free = (0..count).all(|offset| TcpListener::bind(("127.0.0.1", start + offset)).is_ok());
        if all_free {
            return start;
        }
    }
    panic!("Failed to find {} consecutive free ports", count);
}

/// Build a validated configuration with a single forward rule
pub fn single_rule_config(
    listen_port: u16,
    target_port: u16,
    buffer_size: usize,
    max_connections: usize,
) -> AppConfig {
    AppConfig::from_toml_str(&format!(
        r#"
        buffer_size = {buffer_size}
        tcp_no_delay = true
        retry_attempts = 2
        retry_delay = 0
        max_connections = {max_connections}

        [[forwarders]]
        listen_address = "127.0.0.1"
        listen_port = {listen_port}
        target_address = "127.0.0.1"
        target_port = {target_port}

        [thread_pool]
        threads = 2

        [logging]
        enabled = false
        file = "unused.log"

        [health_check]
        enabled = false
        interval = 10
        "#
    ))
    .expect("Failed to build test configuration")
}

/// Create a simple echo server for testing
pub async fn start_echo_server(port: u16) -> tokio::task::JoinHandle<()> {
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind echo server");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => break, // Connection closed
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    })
}

/// Target server that records every accepted connection's bytes
#[derive(Clone, Default)]
pub struct RecordingTarget {
    pub connections: Arc<Mutex<usize>>,
    pub received: Arc<Mutex<Vec<u8>>>,
}

impl RecordingTarget {
    pub async fn start(port: u16) -> (Self, tokio::task::JoinHandle<()>) {
        let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
            .await
            .expect("Failed to bind recording target");
        let target = Self::default();
        let state = target.clone();

        let handle = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                *state.connections.lock().unwrap() += 1;
                let received = Arc::clone(&state.received);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        received.lock().unwrap().extend_from_slice(&buf[..n]);
                    }
                });
            }
        });

        (target, handle)
    }

    pub fn connection_count(&self) -> usize {
        *self.connections.lock().unwrap()
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }
}

/// Wait until `predicate` holds or the timeout elapses
pub async fn wait_until<F: Fn() -> bool>(predicate: F, max_wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

/// Read until the peer closes; returns the bytes read before EOF/error
pub async fn read_until_closed(stream: &mut TcpStream, max_wait: Duration) -> Option<Vec<u8>> {
    timeout(max_wait, async {
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
            }
        }
        collected
    })
    .await
    .ok()
}

/// Send data and read the same number of bytes back
pub async fn round_trip(stream: &mut TcpStream, data: &[u8]) -> Vec<u8> {
    let (mut reader, mut writer) = stream.split();
    let write = async {
        writer.write_all(data).await.expect("Failed to write data");
    };
    let read = async {
        let mut response = vec![0u8; data.len()];
        reader
            .read_exact(&mut response)
            .await
            .expect("Failed to read response");
        response
    };
    let ((), response) = tokio::join!(write, read);
    response
}
