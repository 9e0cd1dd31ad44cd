//! # Soro channel
//! A channel is a named, bidirectional, point to point message link between
//! the rover and a mission control station. Every control link of the
//! system (arm, drive, gimbal, chat) is one channel. It behaves the same
//! over UDP and TCP:
//!
//! - both ends prove they belong to the same link by exchanging the channel
//!   name in a handshake,
//! - heartbeats and an idle timeout detect a silent peer,
//! - periodic acks measure round trip time and throughput,
//! - socket errors and protocol violations reset the channel to a clean
//!   reconnecting state instead of failing it.
//!
//! ## States
//! ```text
//! Unconfigured --configure--> Ready --open--> Connecting --handshake--> Connected
//!                               ^                 ^                         |
//!                               |                 +---- reset --------------+
//!                               +------ close ------- (any open state)
//! ```
//! An invalid configuration or a socket that cannot be bound on the first
//! `open` moves the channel to `Error`, which is terminal.
//!
//! ## Reliability
//! A channel does not retransmit or reorder. With `drop_old_packets` a
//! message that is not newer than the last accepted one is dropped, so the
//! application only ever sees the most recent command.
//!
//! ## Layout
//! The protocol lives in `Connection`, which never touches a socket or the
//! clock. `Channel` owns the socket and drives a connection on async-std.
//!
//! ## Examples
//!
//! ```no_run
//! # fn main() -> Result<(), failure::Error> { async_std::task::block_on(async {
//! #
//! use soro_channel::{Channel, Event};
//!
//! let mut channel = Channel::new("Soro_ArmChannel");
//! channel.load("soro.toml")?;
//! channel.open().await?;
//! while let Some(event) = channel.next_event().await {
//!     if let Event::MessageReceived(payload) = event {
//!         channel.send_message(&payload).await?;
//!     }
//! }
//! #
//! # Ok(()) }) }
//! ```
#![deny(missing_docs)]
mod channel;
pub mod config;
mod connection;
pub mod constants;
mod error;
mod observer;
pub mod packet;
pub mod stats;
mod timer;

pub use crate::channel::Channel;
pub use crate::config::{ChannelConfig, ConfigError, Role, Timing};
pub use crate::connection::{Connection, Event, Io, State, Transmit};
pub use crate::error::{Error, ErrorCode, SendError};
pub use crate::observer::ChannelObserver;
pub use crate::stats::Statistics;
pub use addr::Protocol;
