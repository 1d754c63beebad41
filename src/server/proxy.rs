//! PROXY protocol
//!
//! A load balancer in front of the server can prepend a PROXY protocol
//! header carrying the original client address. When enabled, the header
//! is read before HTTP parsing starts; if the connecting peer is a trusted
//! proxy, the advertised source replaces the peer address for throttling
//! and logging.
//!
//! ```text
//! v1: "PROXY TCP4 203.0.113.7 10.0.0.1 51234 8080\r\n"
//! v2: \r\n\r\n\0\r\nQUIT\n | ver/cmd | family | len: u16 BE | addresses
//! ```
//!
//! Connections that do not start with a header are served as plain HTTP.

use std::io::{self, IoSlice};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Deserializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};

const V1_SIGNATURE: &[u8] = b"PROXY ";
/// Longest legal v1 line, CRLF included
const V1_MAX_LEN: usize = 107;
const V2_SIGNATURE: &[u8] = b"\r\n\r\n\0\r\nQUIT\n";
const V2_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProxyProtocolConfig {
    pub enabled: bool,
    /// Peers whose headers are honoured; empty trusts every peer
    #[serde(deserialize_with = "deserialize_networks")]
    pub trusted_proxies: Vec<IpNetwork>,
}

impl ProxyProtocolConfig {
    pub fn is_trusted(&self, peer: IpAddr) -> bool {
        let peer = peer.to_canonical();
        self.trusted_proxies.is_empty()
            || self
                .trusted_proxies
                .iter()
                .any(|network| network.contains(peer))
    }

    /// Address requests from `peer` are attributed to
    pub fn client_address(&self, peer: SocketAddr, advertised: Option<SocketAddr>) -> SocketAddr {
        match advertised {
            Some(source) if self.is_trusted(peer.ip()) => source,
            _ => peer,
        }
    }
}

fn deserialize_networks<'de, D>(deserializer: D) -> std::result::Result<Vec<IpNetwork>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|text| {
            text.parse::<IpNetwork>().map_err(|e| {
                serde::de::Error::custom(format!("invalid trusted proxy '{text}': {e}"))
            })
        })
        .collect()
}

// =============================================================================
// Header Parsing
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Detection {
    NeedMore,
    Absent,
    Header {
        len: usize,
        source: Option<SocketAddr>,
    },
}

fn violation(reason: &str) -> Error {
    Error::ProtocolViolation(format!("PROXY header: {reason}"))
}

fn detect(buf: &[u8]) -> Result<Detection> {
    if buf.starts_with(V1_SIGNATURE) {
        parse_v1(buf)
    } else if buf.starts_with(V2_SIGNATURE) {
        parse_v2(buf)
    } else if V1_SIGNATURE.starts_with(buf) || V2_SIGNATURE.starts_with(buf) {
        Ok(Detection::NeedMore)
    } else {
        Ok(Detection::Absent)
    }
}

fn parse_v1(buf: &[u8]) -> Result<Detection> {
    let window = &buf[..buf.len().min(V1_MAX_LEN)];
    let Some(end) = window.windows(2).position(|pair| pair == b"\r\n") else {
        return if buf.len() >= V1_MAX_LEN {
            Err(violation("v1 line too long"))
        } else {
            Ok(Detection::NeedMore)
        };
    };

    let line = std::str::from_utf8(&buf[..end]).map_err(|_| violation("v1 line is not ASCII"))?;
    let fields: Vec<&str> = line.split(' ').collect();
    let source = match fields[..] {
        ["PROXY", "TCP4" | "TCP6", source, _, port, _] => {
            let ip: IpAddr = source
                .parse()
                .map_err(|_| violation("bad v1 source address"))?;
            let port: u16 = port.parse().map_err(|_| violation("bad v1 source port"))?;
            Some(SocketAddr::new(ip, port))
        }
        ["PROXY", "UNKNOWN", ..] => None,
        _ => return Err(violation("malformed v1 line")),
    };
    Ok(Detection::Header {
        len: end + 2,
        source,
    })
}

fn parse_v2(buf: &[u8]) -> Result<Detection> {
    if buf.len() < V2_HEADER_LEN {
        return Ok(Detection::NeedMore);
    }
    let version_command = buf[12];
    if version_command >> 4 != 2 {
        return Err(violation("unsupported v2 version"));
    }
    let family = buf[13];
    let len = V2_HEADER_LEN + usize::from(u16::from_be_bytes([buf[14], buf[15]]));
    if buf.len() < len {
        return Ok(Detection::NeedMore);
    }

    let addresses = &buf[V2_HEADER_LEN..len];
    let source = match (version_command & 0x0f, family >> 4) {
        // LOCAL: the proxy talking for itself
        (0x0, _) => None,
        (0x1, 0x1) if addresses.len() >= 12 => {
            let ip = Ipv4Addr::new(addresses[0], addresses[1], addresses[2], addresses[3]);
            let port = u16::from_be_bytes([addresses[8], addresses[9]]);
            Some(SocketAddr::new(ip.into(), port))
        }
        (0x1, 0x2) if addresses.len() >= 36 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addresses[..16]);
            let port = u16::from_be_bytes([addresses[32], addresses[33]]);
            Some(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        // UNSPEC and unix sockets carry nothing usable
        (0x1, 0x0 | 0x3) => None,
        (0x1, _) => return Err(violation("malformed v2 address block")),
        _ => return Err(violation("unknown v2 command")),
    };
    Ok(Detection::Header { len, source })
}

/// Consume a PROXY header from the start of `stream`, if there is one.
///
/// Returns the advertised source address and the bytes read past the
/// header, which belong to the HTTP stream.
pub async fn read_header<S>(stream: &mut S) -> Result<(Option<SocketAddr>, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(256);
    loop {
        match detect(&buf)? {
            Detection::Absent => return Ok((None, buf.freeze())),
            Detection::Header { len, source } => {
                buf.advance(len);
                return Ok((source, buf.freeze()));
            }
            Detection::NeedMore => {
                if stream.read_buf(&mut buf).await? == 0 {
                    return Ok((None, buf.freeze()));
                }
            }
        }
    }
}

// =============================================================================
// Rewind
// =============================================================================

/// Stream that replays bytes read ahead of it before reading from `inner`
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix.is_empty() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        let n = this.prefix.len().min(buf.remaining());
        buf.put_slice(&this.prefix[..n]);
        this.prefix.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// =============================================================================
// Tests
// =============================================================================
