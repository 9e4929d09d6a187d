//! Resolved socket addresses and textual target parsing.
//!
//! A [`ResolvedAddress`] is a fixed-size, copyable value holding an address in
//! the platform's native sockaddr encoding. Targets arrive from upper layers
//! as URIs of the form `ipv4:host:port`, `ipv6:[host]:port`, or `unix:path`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{EngineError, Result};

/// Maximum encoded size of a resolved address.
pub const MAX_ADDRESS_BYTES: usize = 128;

const FAMILY_OFFSET: usize = 0;
const PORT_OFFSET: usize = 2;
const V4_ADDR_OFFSET: usize = 4;
const V4_LEN: usize = 16;
const V6_FLOWINFO_OFFSET: usize = 4;
const V6_ADDR_OFFSET: usize = 8;
const V6_SCOPE_OFFSET: usize = 24;
const V6_LEN: usize = 28;
const UNIX_PATH_OFFSET: usize = 2;

/// An address in the platform's native sockaddr-family form.
///
/// Stored inline, copyable, and heap-free. Valid instances are produced from
/// [`SocketAddr`] values, unix paths, or [`parse_target`].
#[derive(Clone, Copy)]
pub struct ResolvedAddress {
    bytes: [u8; MAX_ADDRESS_BYTES],
    len: usize,
}

impl ResolvedAddress {
    /// Encodes an IPv4 or IPv6 socket address.
    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        let mut bytes = [0u8; MAX_ADDRESS_BYTES];
        let len;
        match addr {
            SocketAddr::V4(v4) => {
                bytes[FAMILY_OFFSET..FAMILY_OFFSET + 2]
                    .copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
                bytes[PORT_OFFSET..PORT_OFFSET + 2].copy_from_slice(&v4.port().to_be_bytes());
                bytes[V4_ADDR_OFFSET..V4_ADDR_OFFSET + 4].copy_from_slice(&v4.ip().octets());
                len = V4_LEN;
            }
            SocketAddr::V6(v6) => {
                bytes[FAMILY_OFFSET..FAMILY_OFFSET + 2]
                    .copy_from_slice(&(libc::AF_INET6 as u16).to_ne_bytes());
                bytes[PORT_OFFSET..PORT_OFFSET + 2].copy_from_slice(&v6.port().to_be_bytes());
                bytes[V6_FLOWINFO_OFFSET..V6_FLOWINFO_OFFSET + 4]
                    .copy_from_slice(&v6.flowinfo().to_be_bytes());
                bytes[V6_ADDR_OFFSET..V6_ADDR_OFFSET + 16].copy_from_slice(&v6.ip().octets());
                bytes[V6_SCOPE_OFFSET..V6_SCOPE_OFFSET + 4]
                    .copy_from_slice(&v6.scope_id().to_ne_bytes());
                len = V6_LEN;
            }
        }
        ResolvedAddress { bytes, len }
    }

    /// Encodes a unix-domain socket path.
    ///
    /// Fails if the path does not fit the inline sockaddr buffer.
    pub fn from_unix_path(path: &str) -> Result<Self> {
        let raw = path.as_bytes();
        if UNIX_PATH_OFFSET + raw.len() + 1 > MAX_ADDRESS_BYTES {
            return Err(EngineError::internal(format!(
                "unix path too long: {} bytes",
                raw.len()
            )));
        }
        let mut bytes = [0u8; MAX_ADDRESS_BYTES];
        bytes[FAMILY_OFFSET..FAMILY_OFFSET + 2]
            .copy_from_slice(&(libc::AF_UNIX as u16).to_ne_bytes());
        bytes[UNIX_PATH_OFFSET..UNIX_PATH_OFFSET + raw.len()].copy_from_slice(raw);
        Ok(ResolvedAddress {
            bytes,
            // Trailing NUL included, as the kernel expects.
            len: UNIX_PATH_OFFSET + raw.len() + 1,
        })
    }

    /// Raw sockaddr bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no address has been encoded.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The sockaddr family tag.
    pub fn family(&self) -> u16 {
        u16::from_ne_bytes([self.bytes[0], self.bytes[1]])
    }

    /// Decodes back to a [`SocketAddr`] for IPv4/IPv6 addresses.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let family = self.family();
        if family == libc::AF_INET as u16 && self.len >= V4_LEN {
            let port = u16::from_be_bytes([self.bytes[PORT_OFFSET], self.bytes[PORT_OFFSET + 1]]);
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&self.bytes[V4_ADDR_OFFSET..V4_ADDR_OFFSET + 4]);
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(octets),
                port,
            )))
        } else if family == libc::AF_INET6 as u16 && self.len >= V6_LEN {
            let port = u16::from_be_bytes([self.bytes[PORT_OFFSET], self.bytes[PORT_OFFSET + 1]]);
            let mut flowinfo = [0u8; 4];
            flowinfo.copy_from_slice(&self.bytes[V6_FLOWINFO_OFFSET..V6_FLOWINFO_OFFSET + 4]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&self.bytes[V6_ADDR_OFFSET..V6_ADDR_OFFSET + 16]);
            let mut scope = [0u8; 4];
            scope.copy_from_slice(&self.bytes[V6_SCOPE_OFFSET..V6_SCOPE_OFFSET + 4]);
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                u32::from_be_bytes(flowinfo),
                u32::from_ne_bytes(scope),
            )))
        } else {
            None
        }
    }

    /// Decodes the unix-domain path, when this is an `AF_UNIX` address.
    pub fn unix_path(&self) -> Option<&str> {
        if self.family() != libc::AF_UNIX as u16 {
            return None;
        }
        let raw = &self.bytes[UNIX_PATH_OFFSET..self.len.saturating_sub(1)];
        std::str::from_utf8(raw).ok()
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = self.unix_path() {
            return write!(f, "unix:{path}");
        }
        match self.to_socket_addr() {
            Some(SocketAddr::V4(v4)) => write!(f, "ipv4:{}:{}", v4.ip(), v4.port()),
            Some(SocketAddr::V6(v6)) => write!(f, "ipv6:[{}]:{}", v6.ip(), v6.port()),
            None => write!(f, "<unknown family {}>", self.family()),
        }
    }
}

impl fmt::Debug for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResolvedAddress({self})")
    }
}

impl From<SocketAddr> for ResolvedAddress {
    fn from(addr: SocketAddr) -> Self {
        ResolvedAddress::from_socket_addr(&addr)
    }
}

/// Parses a textual target into a resolved address.
///
/// Accepted forms: `ipv4:host:port`, `ipv6:[host]:port`, `unix:path`. Hosts
/// must be numeric literals; names go through the DNS resolver instead.
pub fn parse_target(target: &str) -> Result<ResolvedAddress> {
    if let Some(rest) = target.strip_prefix("unix:") {
        return ResolvedAddress::from_unix_path(rest);
    }
    let (rest, v6) = if let Some(rest) = target.strip_prefix("ipv4:") {
        (rest, false)
    } else if let Some(rest) = target.strip_prefix("ipv6:") {
        (rest, true)
    } else {
        return Err(EngineError::internal(format!(
            "unsupported target scheme: {target}"
        )));
    };
    let (host, port) = split_host_port(rest)?;
    let port = port.ok_or_else(|| EngineError::internal(format!("target missing port: {target}")))?;
    let ip: IpAddr = host
        .parse()
        .map_err(|_| EngineError::internal(format!("target host is not a literal: {target}")))?;
    match (v6, &ip) {
        (false, IpAddr::V4(_)) | (true, IpAddr::V6(_)) => {
            Ok(ResolvedAddress::from(SocketAddr::new(ip, port)))
        }
        _ => Err(EngineError::internal(format!(
            "address family does not match scheme: {target}"
        ))),
    }
}

/// Splits `host`, `host:port`, `[host]`, or `[host]:port`.
///
/// A bare string containing more than one colon is treated as an unbracketed
/// IPv6 literal with no port.
pub(crate) fn split_host_port(s: &str) -> Result<(String, Option<u16>)> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| EngineError::internal(format!("unterminated bracket in: {s}")))?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host.to_string(), None));
        }
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| EngineError::internal(format!("invalid port in: {s}")))?;
        return Ok((host.to_string(), Some(port)));
    }
    match s.matches(':').count() {
        0 => Ok((s.to_string(), None)),
        1 => {
            let (host, port) = s.split_once(':').unwrap();
            let port = port
                .parse::<u16>()
                .map_err(|_| EngineError::internal(format!("invalid port in: {s}")))?;
            Ok((host.to_string(), Some(port)))
        }
        _ => Ok((s.to_string(), None)),
    }
}
