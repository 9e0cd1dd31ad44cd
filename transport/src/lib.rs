//! # Channel transport
//! Owns the single socket behind a channel. A channel runs either over
//! a datagram socket or over a stream socket, and the choice is made once
//! when the socket is opened:
//!
//! - `Transport::Udp` is a bound datagram socket. The peer is tracked per
//!   packet, so every receive reports the sender and every send names the
//!   destination.
//! - `Transport::Tcp` is either a listener that hands off exactly one
//!   accepted stream at a time, or a client that dials out on request
//!   from a fixed local address.
//!
//! The transport moves raw bytes only. Framing happens above it.
//!
//! ## Examples
//!
//! ```no_run
//! # fn main() -> Result<(), failure::Error> { async_std::task::block_on(async {
//! #
//! use transport::{Input, Options, Transport};
//!
//! let mut socket = Transport::udp("127.0.0.1:5501".parse()?, Options::default())?;
//! let mut buf = [0u8; 1024];
//! if let Input::Datagram { from, len } = socket.recv(&mut buf).await? {
//!     socket.send(Some(from), &buf[..len]).await?;
//! }
//! #
//! # Ok(()) }) }
//! ```
#![deny(missing_docs)]
mod tcp;
mod udp;

pub use crate::tcp::TcpBinding;
pub use crate::udp::UdpBinding;
use async_std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Socket options applied when a transport is opened.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Options {
    /// Request low-delay service: `IPTOS_LOWDELAY` on datagram sockets and
    /// `TCP_NODELAY` on streams.
    pub low_delay: bool,
}

/// Something the socket produced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Input {
    /// A datagram of `len` bytes from `from` is at the start of the buffer.
    Datagram {
        /// Sender of the datagram.
        from: SocketAddr,
        /// Length of the datagram.
        len: usize,
    },
    /// The listener accepted a stream from a peer.
    Accepted(SocketAddr),
    /// `len` stream bytes are at the start of the buffer.
    Data(usize),
    /// The peer closed the stream.
    Closed,
}

/// The socket of a channel.
pub enum Transport {
    /// Datagram socket.
    Udp(UdpBinding),
    /// Stream socket, listening or dialing.
    Tcp(TcpBinding),
}

impl Transport {
    /// Binds a datagram socket to `local`.
    pub fn udp(local: SocketAddr, options: Options) -> Result<Self> {
        Ok(Transport::Udp(UdpBinding::bind(local, options)?))
    }

    /// Binds a stream listener to `local` with a backlog of one.
    pub fn tcp_listener(local: SocketAddr, options: Options) -> Result<Self> {
        Ok(Transport::Tcp(TcpBinding::listen(local, options)?))
    }

    /// Creates a stream client whose streams are bound to `local`.
    /// Nothing is opened until `dial`.
    pub fn tcp_client(local: SocketAddr, options: Options) -> Self {
        Transport::Tcp(TcpBinding::client(local, options))
    }

    /// Returns the local address of the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self {
            Transport::Udp(udp) => udp.local_addr(),
            Transport::Tcp(tcp) => tcp.local_addr(),
        }
    }

    /// Dials `remote`, giving up after `timeout`. Returns the peer address.
    pub async fn dial(&mut self, remote: SocketAddr, timeout: Duration) -> Result<SocketAddr> {
        match self {
            Transport::Udp(_) => Err(Error::new(
                ErrorKind::InvalidInput,
                "datagram transport does not dial",
            )),
            Transport::Tcp(tcp) => tcp.dial(remote, timeout).await,
        }
    }

    /// Waits for the next input from the socket.
    ///
    /// Received bytes are written to the start of `buf`. Dropping the
    /// future before it completes loses no data, so it may be raced
    /// against a timer.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<Input> {
        match self {
            Transport::Udp(udp) => udp.recv(buf).await,
            Transport::Tcp(tcp) => tcp.recv(buf).await,
        }
    }

    /// Writes `contents` to the socket.
    ///
    /// Datagram transports require a destination. Stream transports write
    /// to the established stream and ignore it.
    pub async fn send(&mut self, destination: Option<SocketAddr>, contents: &[u8]) -> Result<()> {
        match self {
            Transport::Udp(udp) => match destination {
                Some(destination) => udp.send(destination, contents).await,
                None => Err(Error::new(
                    ErrorKind::InvalidInput,
                    "datagram without destination",
                )),
            },
            Transport::Tcp(tcp) => tcp.send(contents).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;
    use failure::Error;

    async fn udp_exchange() -> std::result::Result<(), Error> {
        let mut a = Transport::udp("127.0.0.1:0".parse()?, Options::default())?;
        let mut b = Transport::udp("127.0.0.1:0".parse()?, Options { low_delay: true })?;
        let addr_a = a.local_addr()?;
        let addr_b = b.local_addr()?;

        a.send(Some(addr_b), b"ping").await?;
        let mut buf = [0u8; 64];
        let input = b.recv(&mut buf).await?;
        assert_eq!(input, Input::Datagram { from: addr_a, len: 4 });
        assert_eq!(&buf[..4], b"ping");

        assert!(b.send(None, b"pong").await.is_err());
        Ok(())
    }

    #[test]
    fn test_udp_exchange() {
        task::block_on(udp_exchange()).unwrap();
    }

    async fn tcp_exchange() -> std::result::Result<(), Error> {
        let mut server = Transport::tcp_listener("127.0.0.1:0".parse()?, Options::default())?;
        let server_addr = server.local_addr()?;
        let mut client = Transport::tcp_client("127.0.0.1:0".parse()?, Options { low_delay: true });
        assert!(client.local_addr().is_err());

        let peer = client.dial(server_addr, Duration::from_secs(1)).await?;
        assert_eq!(peer, server_addr);
        let client_addr = client.local_addr()?;

        let mut buf = [0u8; 64];
        assert_eq!(server.recv(&mut buf).await?, Input::Accepted(client_addr));
        client.send(None, b"ping").await?;
        let mut received = Vec::new();
        while received.len() < 4 {
            match server.recv(&mut buf).await? {
                Input::Data(len) => received.extend_from_slice(&buf[..len]),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(&received[..], b"ping");

        drop(client);
        assert_eq!(server.recv(&mut buf).await?, Input::Closed);
        assert_eq!(server.local_addr()?, server_addr);
        Ok(())
    }

    #[test]
    fn test_tcp_exchange() {
        task::block_on(tcp_exchange()).unwrap();
    }

    async fn dial_refused() -> std::result::Result<(), Error> {
        let addr = {
            let listener = Transport::tcp_listener("127.0.0.1:0".parse()?, Options::default())?;
            listener.local_addr()?
        };
        let mut client = Transport::tcp_client("127.0.0.1:0".parse()?, Options::default());
        assert!(client.dial(addr, Duration::from_millis(500)).await.is_err());
        assert!(client.local_addr().is_err());
        assert!(client.send(None, b"ping").await.is_err());
        Ok(())
    }

    #[test]
    fn test_dial_refused() {
        task::block_on(dial_refused()).unwrap();
    }

    // every 127/8 address is routed to the loopback interface on linux
    #[cfg(target_os = "linux")]
    async fn tcp_client_local_address() -> std::result::Result<(), Error> {
        let mut server = Transport::tcp_listener("127.0.0.1:0".parse()?, Options::default())?;
        let server_addr = server.local_addr()?;
        let mut client = Transport::tcp_client("127.0.0.2:0".parse()?, Options::default());
        client.dial(server_addr, Duration::from_secs(1)).await?;
        let client_addr = client.local_addr()?;
        assert_eq!(client_addr.ip(), "127.0.0.2".parse::<std::net::IpAddr>()?);

        let mut buf = [0u8; 64];
        assert_eq!(server.recv(&mut buf).await?, Input::Accepted(client_addr));
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_tcp_client_local_address() {
        task::block_on(tcp_client_local_address()).unwrap();
    }
}
