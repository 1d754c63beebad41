//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use buildcache::cache::memcache::HostAndPort;
use buildcache::{BuildCacheServer, Configuration, ServerHandle};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// =============================================================================
// Server
// =============================================================================

/// Start a server on an ephemeral local port
pub async fn start_server(mut config: Configuration) -> ServerHandle {
    config.host = "127.0.0.1".into();
    config.port = 0;
    config.shutdown_timeout = Duration::from_secs(5);
    BuildCacheServer::new(config)
        .await
        .expect("server configuration")
        .bind()
        .await
        .expect("server bind")
}

// =============================================================================
// Raw HTTP Client
// =============================================================================

/// Parsed HTTP response
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Send one request over a fresh connection; the path goes out untouched
pub async fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> RawResponse {
    let mut head = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    let chunked = headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("transfer-encoding"));
    if !chunked && (!body.is_empty() || method == "PUT") {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();
    read_response(&mut stream).await
}

pub async fn get(addr: SocketAddr, path: &str) -> RawResponse {
    request(addr, "GET", path, &[], b"").await
}

pub async fn put(addr: SocketAddr, path: &str, body: &[u8]) -> RawResponse {
    request(addr, "PUT", path, &[], body).await
}

/// Read a response until the server closes the connection
pub async fn read_response(stream: &mut TcpStream) -> RawResponse {
    let mut raw = Vec::new();
    let _ = stream.read_to_end(&mut raw).await;
    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> RawResponse {
    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("complete response head");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    let rest = &raw[split + 4..];

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
        .collect();

    let chunked = headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("transfer-encoding") && value.eq_ignore_ascii_case("chunked")
    });
    let body = if chunked { decode_chunked(rest) } else { rest.to_vec() };
    RawResponse {
        status,
        headers,
        body,
    }
}

fn decode_chunked(mut data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let Some(line_end) = data.windows(2).position(|window| window == b"\r\n") else {
            return body;
        };
        let size_field = String::from_utf8_lossy(&data[..line_end]);
        let size = usize::from_str_radix(size_field.split(';').next().unwrap().trim(), 16)
            .expect("chunk size");
        data = &data[line_end + 2..];
        if size == 0 {
            return body;
        }
        body.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}

// =============================================================================
// Fake memcached
// =============================================================================

pub type MemcacheStore = Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>;

const HEADER_LEN: usize = 24;

struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve_memcache(mut stream: TcpStream, store: MemcacheStore, open: Arc<AtomicUsize>) {
    open.fetch_add(1, Ordering::SeqCst);
    let _guard = OpenGuard(open);
    loop {
        let mut header = [0u8; HEADER_LEN];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let opcode = header[1];
        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extras_len = header[4] as usize;
        let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let mut body = vec![0u8; body_len];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let key = body[extras_len..extras_len + key_len].to_vec();

        let (status, extras, payload) = match opcode {
            0x00 => match store.lock().get(&key) {
                Some(value) => {
                    let mut out = vec![0u8; 4];
                    out.extend_from_slice(value);
                    (0u16, 4u8, out)
                }
                None => (1u16, 0u8, b"Not found".to_vec()),
            },
            _ => {
                store
                    .lock()
                    .insert(key, body[extras_len + key_len..].to_vec());
                (0u16, 0u8, Vec::new())
            }
        };
        let mut out = vec![0u8; HEADER_LEN];
        out[0] = 0x81;
        out[1] = opcode;
        out[4] = extras;
        out[6..8].copy_from_slice(&status.to_be_bytes());
        out[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// Binary-protocol memcached speaking just GET and SET
pub async fn fake_memcached() -> (HostAndPort, MemcacheStore) {
    let (endpoint, store, _) = tracked_memcached().await;
    (endpoint, store)
}

/// [`fake_memcached`] plus a count of the client connections it has open
pub async fn tracked_memcached() -> (HostAndPort, MemcacheStore, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let store: MemcacheStore = Arc::default();
    let open = Arc::new(AtomicUsize::new(0));
    let (shared, counter) = (Arc::clone(&store), Arc::clone(&open));
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_memcache(stream, Arc::clone(&shared), Arc::clone(&counter)));
        }
    });
    (HostAndPort::new("127.0.0.1", port), store, open)
}

// =============================================================================
// Polling
// =============================================================================

/// Poll `condition` every 20ms until it holds or five seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Files in `dir`, temporary uploads included
pub fn dir_entries(dir: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}
