use crate::{Input, Options};
use async_std::io::Result;
use async_std::net::UdpSocket;
use log::warn;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;

/// Type of service requesting minimal delay.
#[allow(dead_code)]
const IPTOS_LOWDELAY: u32 = 0x10;

/// A bound datagram socket.
pub struct UdpBinding(UdpSocket);

impl UdpBinding {
    pub(crate) fn bind(local: SocketAddr, options: Options) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
        if options.low_delay {
            set_low_delay(&socket);
        }
        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;
        let socket: std::net::UdpSocket = socket.into();
        Ok(Self(UdpSocket::from(socket)))
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
        self.0.local_addr()
    }

    pub(crate) async fn recv(&self, buf: &mut [u8]) -> Result<Input> {
        let (len, from) = self.0.recv_from(buf).await?;
        Ok(Input::Datagram { from, len })
    }

    pub(crate) async fn send(&self, destination: SocketAddr, contents: &[u8]) -> Result<()> {
        let len = self.0.send_to(contents, destination).await?;
        if len < contents.len() {
            warn!("datagram to {} truncated to {} bytes", destination, len);
        }
        Ok(())
    }
}

#[cfg(not(any(
    windows,
    target_os = "fuchsia",
    target_os = "redox",
    target_os = "solaris",
    target_os = "illumos"
)))]
fn set_low_delay(socket: &Socket) {
    if let Err(err) = socket.set_tos(IPTOS_LOWDELAY) {
        warn!("failed to request low delay service: {}", err);
    }
}

#[cfg(any(
    windows,
    target_os = "fuchsia",
    target_os = "redox",
    target_os = "solaris",
    target_os = "illumos"
))]
fn set_low_delay(_socket: &Socket) {
    warn!("low delay service is not supported on this platform");
}
