//! Addr parses the endpoints channels are configured with.
//!
//! Three spellings are accepted:
//!
//! - socket address literals, `10.0.0.2:5501` or `[::1]:5501`
//! - host names, `rover.local:5501`, resolved through the system resolver
//! - multiaddr-like paths, `/ip4/10.0.0.2/udp/5501`, which also name the
//!   transport protocol
#![deny(missing_docs)]
use failure::Fail;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// Transport protocol of a channel.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Protocol {
    /// Datagram transport, one message per datagram.
    Udp,
    /// Stream transport, messages carry a length prefix.
    Tcp,
}

impl FromStr for Protocol {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            _ => Err(AddrParseError::UnknownProtocol),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Address of a channel endpoint.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Addr {
    ip: IpAddr,
    port: u16,
    protocol: Option<Protocol>,
}

/// Address parse error.
#[derive(Debug, Fail)]
pub enum AddrParseError {
    /// Unknown protocol.
    #[fail(display = "Unknown protocol.")]
    UnknownProtocol,
    /// Missing port.
    #[fail(display = "Missing port.")]
    MissingPort,
    /// Ip address parse error.
    #[fail(display = "{}", _0)]
    Ip(std::net::AddrParseError),
    /// Port parse error.
    #[fail(display = "{}", _0)]
    Port(std::num::ParseIntError),
    /// Host name lookup failed.
    #[fail(display = "{}", _0)]
    Resolve(std::io::Error),
    /// Host name resolved to nothing.
    #[fail(display = "Host {} has no address.", _0)]
    NoAddress(String),
}

impl From<std::net::AddrParseError> for AddrParseError {
    fn from(err: std::net::AddrParseError) -> Self {
        Self::Ip(err)
    }
}

impl From<std::num::ParseIntError> for AddrParseError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::Port(err)
    }
}

impl Addr {
    /// Creates an address without a protocol hint.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            protocol: None,
        }
    }

    /// Returns the `SocketAddr`.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Returns the ip.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Protocol named by a multiaddr-style address, if any.
    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    /// Parses `addr`, falling back to a host name lookup for `host:port`.
    pub fn resolve(addr: &str) -> Result<Self, AddrParseError> {
        match Self::from_str(addr) {
            Ok(addr) => Ok(addr),
            Err(AddrParseError::Ip(_)) if !addr.starts_with('/') => {
                let (host, port) = split_host_port(addr)?;
                let port = u16::from_str(port)?;
                let mut addrs = (host, port)
                    .to_socket_addrs()
                    .map_err(AddrParseError::Resolve)?;
                match addrs.next() {
                    Some(socket_addr) => Ok(socket_addr.into()),
                    None => Err(AddrParseError::NoAddress(host.to_string())),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn from_path(addr: &str) -> Result<Self, AddrParseError> {
        let parts: Vec<_> = addr.split('/').collect();
        let mut ip = None;
        let mut port = None;
        let mut protocol = None;
        for p in parts[1..].chunks(2).enumerate() {
            match p {
                (0, [k, v]) => {
                    ip = Some(match *k {
                        "ip4" => IpAddr::V4(v.parse()?),
                        "ip6" => IpAddr::V6(v.parse()?),
                        _ => return Err(AddrParseError::UnknownProtocol),
                    })
                }
                (1, [k, v]) => {
                    protocol = Some(Protocol::from_str(k)?);
                    port = Some(u16::from_str(v)?);
                }
                _ => return Err(AddrParseError::UnknownProtocol),
            }
        }
        match ip {
            Some(ip) => Ok(Self {
                ip,
                port: port.unwrap_or(0),
                protocol,
            }),
            None => Err(AddrParseError::UnknownProtocol),
        }
    }
}

fn split_host_port(addr: &str) -> Result<(&str, &str), AddrParseError> {
    match addr.rfind(':') {
        Some(i) if i + 1 < addr.len() => Ok((&addr[..i], &addr[i + 1..])),
        _ => Err(AddrParseError::MissingPort),
    }
}

impl FromStr for Addr {
    type Err = AddrParseError;

    fn from_str(addr: &str) -> Result<Self, Self::Err> {
        let addr = addr.trim();
        if addr.starts_with('/') {
            return Self::from_path(addr);
        }
        if let Ok(socket_addr) = SocketAddr::from_str(addr) {
            return Ok(socket_addr.into());
        }
        let (host, port) = split_host_port(addr)?;
        let ip = IpAddr::from_str(host.trim_start_matches('[').trim_end_matches(']'))?;
        Ok(Self::new(ip, u16::from_str(port)?))
    }
}

/// Trait to abstract over types that can be parsed to an `Addr`.
pub trait ToAddr {
    /// Returns the addr.
    fn to_addr(self) -> Result<Addr, AddrParseError>;
}

impl ToAddr for Addr {
    fn to_addr(self) -> Result<Addr, AddrParseError> {
        Ok(self)
    }
}

impl ToAddr for &str {
    fn to_addr(self) -> Result<Addr, AddrParseError> {
        Addr::resolve(self)
    }
}

impl ToAddr for SocketAddr {
    fn to_addr(self) -> Result<Addr, AddrParseError> {
        Ok(self.into())
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        Addr::new(addr.ip(), addr.port())
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.protocol {
            Some(protocol) => {
                match self.ip {
                    IpAddr::V4(_) => write!(f, "/ip4/")?,
                    IpAddr::V6(_) => write!(f, "/ip6/")?,
                }
                self.ip.fmt(f)?;
                write!(f, "/{}/", protocol)?;
                self.port.fmt(f)
            }
            None => self.socket_addr().fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt(saddr: &str) {
        // parse
        let addr: Addr = saddr.parse().unwrap();
        // format
        assert_eq!(format!("{}", addr), saddr);
        // &str -> Addr
        let addr2 = saddr.to_addr().unwrap();
        assert_eq!(addr, addr2);
        // Addr -> Addr
        let addr2 = addr.clone().to_addr().unwrap();
        assert_eq!(addr, addr2);
    }

    #[test]
    fn test_addr() {
        rt("/ip4/127.0.0.1/udp/5501");
        rt("/ip6/::1/tcp/5502");
        rt("10.0.0.2:5501");
        rt("[::1]:5501");
    }

    #[test]
    fn test_protocol_hint() {
        let addr: Addr = "/ip4/10.0.0.2/tcp/5503".parse().unwrap();
        assert_eq!(addr.protocol(), Some(Protocol::Tcp));
        assert_eq!(addr.socket_addr(), "10.0.0.2:5503".parse().unwrap());
        let addr: Addr = "10.0.0.2:5503".parse().unwrap();
        assert_eq!(addr.protocol(), None);
    }

    #[test]
    fn test_resolve_localhost() {
        let addr = Addr::resolve("localhost:5501").unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 5501);
    }

    #[test]
    fn test_invalid() {
        assert!("/ip4/10.0.0.2/sctp/1".parse::<Addr>().is_err());
        assert!("/eth/00:11".parse::<Addr>().is_err());
        assert!("10.0.0.2".parse::<Addr>().is_err());
        assert!("10.0.0.2:http".parse::<Addr>().is_err());
        assert!("udpx".parse::<Protocol>().is_err());
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
    }
}
