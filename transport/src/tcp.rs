use crate::{Input, Options};
use async_std::future;
use async_std::io::{Error, ErrorKind, Result};
use async_std::net::{TcpListener, TcpStream};
use async_std::prelude::*;
use async_std::task;
use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;

/// A stream socket, either listening or dialing.
///
/// At most one stream is established at a time. While a stream is up the
/// listener is not polled, so further connection attempts stay in the
/// backlog instead of being accepted.
pub struct TcpBinding {
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    /// Local address outgoing streams are bound to.
    local: Option<SocketAddr>,
    options: Options,
}

impl TcpBinding {
    pub(crate) fn listen(local: SocketAddr, options: Options) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))?;
        #[cfg(unix)]
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
        socket.listen(1)?;
        socket.set_nonblocking(true)?;
        let listener: std::net::TcpListener = socket.into();
        Ok(Self {
            listener: Some(TcpListener::from(listener)),
            stream: None,
            local: None,
            options,
        })
    }

    pub(crate) fn client(local: SocketAddr, options: Options) -> Self {
        Self {
            listener: None,
            stream: None,
            local: Some(local),
            options,
        }
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
        if let Some(stream) = self.stream.as_ref() {
            return stream.local_addr();
        }
        match self.listener.as_ref() {
            Some(listener) => listener.local_addr(),
            None => Err(Error::new(ErrorKind::NotConnected, "stream not connected")),
        }
    }

    fn configure(&self, stream: &TcpStream) {
        if self.options.low_delay {
            if let Err(err) = stream.set_nodelay(true) {
                warn!("failed to disable nagle: {}", err);
            }
        }
    }

    pub(crate) async fn dial(&mut self, remote: SocketAddr, timeout: Duration) -> Result<SocketAddr> {
        self.stream = None;
        let local = self
            .local
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "listener does not dial"))?;
        let stream = connect_from(local, remote, timeout).await?;
        self.configure(&stream);
        let peer = stream.peer_addr()?;
        debug!("connected to {}", peer);
        self.stream = Some(stream);
        Ok(peer)
    }

    pub(crate) async fn recv(&mut self, buf: &mut [u8]) -> Result<Input> {
        if let Some(stream) = self.stream.as_mut() {
            let len = stream.read(buf).await?;
            if len == 0 {
                self.stream = None;
                return Ok(Input::Closed);
            }
            return Ok(Input::Data(len));
        }
        if let Some(listener) = self.listener.as_ref() {
            let (stream, peer) = listener.accept().await?;
            self.configure(&stream);
            debug!("accepted stream from {}", peer);
            self.stream = Some(stream);
            return Ok(Input::Accepted(peer));
        }
        future::pending().await
    }

    pub(crate) async fn send(&mut self, contents: &[u8]) -> Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(contents).await,
            None => Err(Error::new(ErrorKind::NotConnected, "stream not connected")),
        }
    }
}

/// Connects to `remote` from a socket bound to `local`.
async fn connect_from(local: SocketAddr, remote: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
    socket.bind(&local.into())?;
    let socket = task::spawn_blocking(move || {
        socket.connect_timeout(&remote.into(), timeout)?;
        Ok::<_, Error>(socket)
    })
    .await?;
    socket.set_nonblocking(true)?;
    let stream: std::net::TcpStream = socket.into();
    Ok(TcpStream::from(stream))
}
