use crate::config::ConfigError;
use crate::packet::ProtocolError;
use failure::Fail;
use std::io;

/// Error opening a channel.
#[derive(Debug, Fail)]
pub enum Error {
    /// The channel is in the error state and has to be recreated.
    #[fail(display = "channel failed")]
    Failed,
    /// The configuration is invalid.
    #[fail(display = "{}", _0)]
    Config(ConfigError),
    /// The socket could not be bound.
    #[fail(display = "{}", _0)]
    Bind(io::Error),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

/// Error sending a message.
#[derive(Debug, Fail)]
pub enum SendError {
    /// No verified peer.
    #[fail(display = "channel is not connected")]
    NotConnected,
    /// The socket refused the message. The connection is reset.
    #[fail(display = "{}", _0)]
    Io(io::Error),
}

impl From<io::Error> for SendError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Reason reported with a connection error event.
#[derive(Clone, Debug, Eq, Fail, PartialEq)]
pub enum ErrorCode {
    /// The configuration is invalid.
    #[fail(display = "invalid configuration")]
    InvalidConfig,
    /// Binding the socket failed.
    #[fail(display = "bind failed: {:?}", _0)]
    BindFailed(io::ErrorKind),
    /// The socket reported an error.
    #[fail(display = "socket error: {:?}", _0)]
    Socket(io::ErrorKind),
    /// The peer closed the stream.
    #[fail(display = "stream closed by peer")]
    StreamClosed,
    /// Nothing was received for the idle timeout.
    #[fail(display = "idle timeout")]
    IdleTimeout,
    /// A stream did not complete the handshake in time.
    #[fail(display = "handshake timeout")]
    HandshakeTimeout,
    /// The peer violated the framing.
    #[fail(display = "{}", _0)]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for ErrorCode {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}
