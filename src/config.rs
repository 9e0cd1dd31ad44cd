//! Channel configuration.
//!
//! Deployments keep all channels of a process in one TOML file with a
//! table per channel, keyed by the channel name:
//!
//! ```toml
//! [Soro_ArmChannel]
//! protocol = "udp"
//! role = "server"
//! server_address = "10.0.0.2:5501"
//! host_address = "0.0.0.0"
//! drop_old_packets = true
//! ```
//!
//! Only `protocol`, `role` and `server_address` are required. Timings can
//! be overridden with `handshake_interval_ms`, `heartbeat_interval_ms`,
//! `idle_timeout_ms`, `stats_interval_ms`, `recovery_delay_ms` and
//! `connect_timeout_ms`.
use crate::constants::*;
use addr::{Addr, AddrParseError, Protocol};
use failure::Fail;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Which end of the link a channel is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Binds the advertised port and waits for a client.
    Server,
    /// Dials the server from an ephemeral port.
    Client,
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            _ => Err(ConfigError::InvalidRole(s.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Configuration error.
#[derive(Debug, Fail)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[fail(display = "{}", _0)]
    Io(std::io::Error),
    /// The configuration file is not valid TOML.
    #[fail(display = "{}", _0)]
    Parse(toml::de::Error),
    /// The file has no table for the channel.
    #[fail(display = "No configuration for channel {}.", _0)]
    MissingChannel(String),
    /// The name is empty or does not fit a handshake.
    #[fail(display = "Invalid channel name.")]
    InvalidName,
    /// Unknown protocol.
    #[fail(display = "Invalid protocol {}.", _0)]
    InvalidProtocol(String),
    /// Unknown role.
    #[fail(display = "Invalid role {}.", _0)]
    InvalidRole(String),
    /// Address parse error.
    #[fail(display = "{}", _0)]
    InvalidAddress(AddrParseError),
    /// A client needs a server port.
    #[fail(display = "Missing server port.")]
    InvalidPort,
    /// A timing value is out of range.
    #[fail(display = "Invalid {}.", _0)]
    InvalidTiming(&'static str),
    /// The server address names another protocol.
    #[fail(display = "Address protocol {} does not match {}.", address, configured)]
    ProtocolMismatch {
        /// Configured protocol.
        configured: Protocol,
        /// Protocol of the address.
        address: Protocol,
    },
}

impl ConfigError {
    /// Returns true if loading may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConfigError::Io(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        Self::Parse(err)
    }
}

impl From<AddrParseError> for ConfigError {
    fn from(err: AddrParseError) -> Self {
        Self::InvalidAddress(err)
    }
}

/// Timing of the handshake, liveness and statistics machinery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timing {
    /// Interval between client handshake datagrams.
    pub handshake_interval: Duration,
    /// Silence on the sending side before a heartbeat is sent.
    pub heartbeat_interval: Duration,
    /// Silence on the receiving side before the connection is reset.
    pub idle_timeout: Duration,
    /// Minimum interval between two acks.
    pub stats_interval: Duration,
    /// Delay before reopening the socket after a socket error.
    pub recovery_delay: Duration,
    /// Upper bound of a single dial.
    pub connect_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            handshake_interval: DEFAULT_HANDSHAKE_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            stats_interval: DEFAULT_STATS_INTERVAL,
            recovery_delay: DEFAULT_RECOVERY_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Timing {
    /// Interval of the liveness check, a fraction of the heartbeat interval
    /// so that heartbeats are never late by more than a third.
    pub fn liveness_interval(&self) -> Duration {
        self.heartbeat_interval.mul_f64(1.0 / std::f64::consts::PI)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let values = [
            (self.handshake_interval, "handshake interval"),
            (self.heartbeat_interval, "heartbeat interval"),
            (self.idle_timeout, "idle timeout"),
            (self.stats_interval, "statistics interval"),
            (self.recovery_delay, "recovery delay"),
            (self.connect_timeout, "connect timeout"),
        ];
        for &(value, name) in values.iter() {
            if value == Duration::from_millis(0) {
                return Err(ConfigError::InvalidTiming(name));
            }
        }
        if self.heartbeat_interval >= self.idle_timeout {
            return Err(ConfigError::InvalidTiming("heartbeat interval"));
        }
        Ok(())
    }
}

/// Configuration of a single channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelConfig {
    name: String,
    protocol: Protocol,
    role: Role,
    server_address: SocketAddr,
    host_address: IpAddr,
    drop_old_packets: bool,
    send_acks: bool,
    low_delay: bool,
    timing: Timing,
}

impl ChannelConfig {
    /// Creates a configuration with default options.
    ///
    /// The host address defaults to the unspecified address of the server
    /// address family.
    pub fn new(name: &str, protocol: Protocol, role: Role, server_address: SocketAddr) -> Self {
        let host_address = match server_address {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self {
            name: name.to_string(),
            protocol,
            role,
            server_address,
            host_address,
            drop_old_packets: true,
            send_acks: true,
            low_delay: false,
            timing: Timing::default(),
        }
    }

    /// Local address to bind.
    pub fn set_host_address(mut self, host_address: IpAddr) -> Self {
        self.host_address = host_address;
        self
    }

    /// Drop messages that are not newer than the last accepted one.
    pub fn set_drop_old_packets(mut self, drop_old_packets: bool) -> Self {
        self.drop_old_packets = drop_old_packets;
        self
    }

    /// Ack received messages for the peer's statistics.
    pub fn set_send_acks(mut self, send_acks: bool) -> Self {
        self.send_acks = send_acks;
        self
    }

    /// Request low delay service from the network stack.
    pub fn set_low_delay(mut self, low_delay: bool) -> Self {
        self.low_delay = low_delay;
        self
    }

    /// Timing of the protocol.
    pub fn set_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Channel name, exchanged in the handshake.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Role of the channel.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Address the server binds and the client dials.
    pub fn server_address(&self) -> SocketAddr {
        self.server_address
    }

    /// Local address to bind.
    pub fn host_address(&self) -> IpAddr {
        self.host_address
    }

    /// Whether stale messages are dropped.
    pub fn drop_old_packets(&self) -> bool {
        self.drop_old_packets
    }

    /// Whether acks are sent.
    pub fn send_acks(&self) -> bool {
        self.send_acks
    }

    /// Whether low delay service is requested.
    pub fn low_delay(&self) -> bool {
        self.low_delay
    }

    /// Timing of the protocol.
    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Local socket address: the server port for servers and an ephemeral
    /// port for clients.
    pub fn local_bind_addr(&self) -> SocketAddr {
        match self.role {
            Role::Server => SocketAddr::new(self.host_address, self.server_address.port()),
            Role::Client => SocketAddr::new(self.host_address, 0),
        }
    }

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name.len() > MAX_PAYLOAD_LEN {
            return Err(ConfigError::InvalidName);
        }
        if self.role == Role::Client && self.server_address.port() == 0 {
            return Err(ConfigError::InvalidPort);
        }
        self.timing.validate()
    }

    /// Reads the configuration of channel `name` from a file.
    pub fn load<P: AsRef<Path>>(path: P, name: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents, name)
    }

    /// Parses the configuration of channel `name`.
    pub fn parse(contents: &str, name: &str) -> Result<Self, ConfigError> {
        let mut channels: BTreeMap<String, ChannelEntry> = toml::from_str(contents)?;
        let entry = channels
            .remove(name)
            .ok_or_else(|| ConfigError::MissingChannel(name.to_string()))?;
        let config = entry.into_config(name)?;
        config.validate()?;
        Ok(config)
    }
}

/// Table of one channel in the configuration file.
#[derive(Debug, Clone, Deserialize)]
struct ChannelEntry {
    protocol: String,
    role: String,
    /// `host:port` or `/ip4/<ip>/<udp|tcp>/<port>`
    server_address: String,
    #[serde(default)]
    host_address: Option<String>,
    #[serde(default = "default_true")]
    drop_old_packets: bool,
    #[serde(default = "default_true")]
    send_acks: bool,
    #[serde(default)]
    low_delay: bool,
    #[serde(default)]
    handshake_interval_ms: Option<u64>,
    #[serde(default)]
    heartbeat_interval_ms: Option<u64>,
    #[serde(default)]
    idle_timeout_ms: Option<u64>,
    #[serde(default)]
    stats_interval_ms: Option<u64>,
    #[serde(default)]
    recovery_delay_ms: Option<u64>,
    #[serde(default)]
    connect_timeout_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl ChannelEntry {
    fn into_config(self, name: &str) -> Result<ChannelConfig, ConfigError> {
        let protocol = Protocol::from_str(&self.protocol)
            .map_err(|_| ConfigError::InvalidProtocol(self.protocol.clone()))?;
        let role = Role::from_str(&self.role)?;
        let server = Addr::resolve(&self.server_address)?;
        if let Some(address) = server.protocol() {
            if address != protocol {
                return Err(ConfigError::ProtocolMismatch {
                    configured: protocol,
                    address,
                });
            }
        }
        let defaults = Timing::default();
        let timing = Timing {
            handshake_interval: millis(self.handshake_interval_ms, defaults.handshake_interval),
            heartbeat_interval: millis(self.heartbeat_interval_ms, defaults.heartbeat_interval),
            idle_timeout: millis(self.idle_timeout_ms, defaults.idle_timeout),
            stats_interval: millis(self.stats_interval_ms, defaults.stats_interval),
            recovery_delay: millis(self.recovery_delay_ms, defaults.recovery_delay),
            connect_timeout: millis(self.connect_timeout_ms, defaults.connect_timeout),
        };
        let mut config = ChannelConfig::new(name, protocol, role, server.socket_addr())
            .set_drop_old_packets(self.drop_old_packets)
            .set_send_acks(self.send_acks)
            .set_low_delay(self.low_delay)
            .set_timing(timing);
        if let Some(host) = self.host_address.as_ref() {
            let host = host.trim();
            if !host.is_empty() {
                let ip = IpAddr::from_str(host.trim_start_matches('[').trim_end_matches(']'))
                    .map_err(AddrParseError::from)?;
                config = config.set_host_address(ip);
            }
        }
        Ok(config)
    }
}
