//! Connection state machine.
//!
//! A `Connection` implements the channel protocol without doing any I/O.
//! The owner feeds it socket input and the current time, executes the
//! `Io` commands it emits and forwards its `Event`s. This keeps every
//! timing decision testable with synthetic clocks.
use crate::config::{ChannelConfig, Role};
use crate::constants::*;
use crate::error::{ErrorCode, SendError};
use crate::packet::{self, Frame, MessageType, StreamDecoder};
use crate::stats::{Statistics, StatisticsEngine};
use crate::timer::{Timer, TimerTable};
use addr::Protocol;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// State of a channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// No configuration was loaded yet.
    Unconfigured,
    /// Configured and closed.
    Ready,
    /// Waiting for a verified peer.
    Connecting,
    /// Exchanging messages with a verified peer.
    Connected,
    /// Failed permanently.
    Error,
}

/// Something the application should know about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// An application message arrived.
    MessageReceived(Bytes),
    /// The state changed.
    StateChanged(State),
    /// The verified peer changed.
    PeerAddressChanged(Option<SocketAddr>),
    /// An ack was processed.
    StatisticsUpdate(Statistics),
    /// Something went wrong.
    ConnectionError(ErrorCode),
}

/// Bytes to write to the socket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transmit {
    /// Destination of a datagram. Always `None` on streams.
    pub destination: Option<SocketAddr>,
    /// Encoded message.
    pub contents: Bytes,
}

/// Socket operation requested by a connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Io {
    /// Open the socket at `local` and report back with `handle_bound` or
    /// `handle_bind_failed`.
    Bind {
        /// Local address.
        local: SocketAddr,
    },
    /// Dial `remote` and report back with `handle_dialed`.
    Dial {
        /// Server address.
        remote: SocketAddr,
        /// Give up after this long.
        timeout: Duration,
    },
    /// Write a message.
    Transmit(Transmit),
    /// Close the socket.
    Close,
}

/// Protocol state of one channel.
pub struct Connection {
    config: ChannelConfig,
    state: State,
    /// Verified peer.
    peer: Option<SocketAddr>,
    /// Remote end of the current stream, verified or not.
    stream_peer: Option<SocketAddr>,
    bound: bool,
    was_bound: bool,
    next_send_id: SequenceNumber,
    last_receive_id: SequenceNumber,
    last_received: Option<Instant>,
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
    decoder: StreamDecoder,
    stats: StatisticsEngine,
    timers: TimerTable,
    io: VecDeque<Io>,
    events: VecDeque<Event>,
}

impl Connection {
    /// Creates a closed connection.
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            state: State::Ready,
            peer: None,
            stream_peer: None,
            bound: false,
            was_bound: false,
            next_send_id: 1,
            last_receive_id: 0,
            last_received: None,
            last_sent: None,
            last_ack: None,
            decoder: StreamDecoder::new(),
            stats: StatisticsEngine::default(),
            timers: TimerTable::default(),
            io: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Configuration of the connection.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Verified peer.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Current statistics.
    pub fn statistics(&self) -> &Statistics {
        self.stats.current()
    }

    /// Id of the next message.
    pub fn next_send_id(&self) -> SequenceNumber {
        self.next_send_id
    }

    /// Highest id received from the peer.
    pub fn last_receive_id(&self) -> SequenceNumber {
        self.last_receive_id
    }

    /// Starts connecting.
    pub fn open(&mut self) {
        if self.state != State::Ready {
            return;
        }
        self.set_state(State::Connecting);
        self.io.push_back(Io::Bind {
            local: self.config.local_bind_addr(),
        });
    }

    /// Closes the connection and returns to `Ready`.
    ///
    /// Closing a closed connection does nothing. A failed connection only
    /// releases its socket.
    pub fn close(&mut self) {
        match self.state {
            State::Unconfigured | State::Ready => {}
            State::Error => self.release(),
            State::Connecting | State::Connected => {
                info!("[{}] closing", self.config.name());
                self.release();
                self.set_peer(None);
                self.reset_vars(None);
                self.set_state(State::Ready);
            }
        }
    }

    /// Sends an application message.
    ///
    /// Payloads longer than `MAX_PAYLOAD_LEN` are truncated.
    pub fn send_message(&mut self, now: Instant, payload: &[u8]) -> Result<(), SendError> {
        let peer = match (self.state, self.peer) {
            (State::Connected, Some(peer)) => peer,
            _ => return Err(SendError::NotConnected),
        };
        let payload = if payload.len() > MAX_PAYLOAD_LEN {
            warn!(
                "[{}] truncating message of {} bytes to {}",
                self.config.name(),
                payload.len(),
                MAX_PAYLOAD_LEN
            );
            &payload[..MAX_PAYLOAD_LEN]
        } else {
            payload
        };
        self.send(now, MessageType::Normal, payload, peer);
        Ok(())
    }

    /// The socket requested by `Io::Bind` is open.
    pub fn handle_bound(&mut self, now: Instant, local: SocketAddr) {
        if self.state != State::Connecting {
            return;
        }
        info!(
            "[{}] {} {} socket bound to {}",
            self.config.name(),
            self.config.role(),
            self.config.protocol(),
            local
        );
        self.bound = true;
        self.was_bound = true;
        match (self.config.protocol(), self.config.role()) {
            (Protocol::Udp, Role::Client) => self.send_client_handshake(now),
            (Protocol::Tcp, Role::Client) => self.dial(),
            (_, Role::Server) => {}
        }
    }

    /// The socket requested by `Io::Bind` could not be opened.
    ///
    /// Fails the connection if the socket was never open, otherwise tries
    /// again after the recovery delay.
    pub fn handle_bind_failed(&mut self, now: Instant, err: &io::Error) {
        if self.state != State::Connecting {
            return;
        }
        let local = self.config.local_bind_addr();
        self.events
            .push_back(Event::ConnectionError(ErrorCode::BindFailed(err.kind())));
        if !self.was_bound {
            warn!("[{}] failed to bind {}: {}", self.config.name(), local, err);
            self.timers.clear();
            self.set_state(State::Error);
            return;
        }
        warn!(
            "[{}] failed to rebind {}: {}, retrying",
            self.config.name(),
            local,
            err
        );
        let delay = self.config.timing().recovery_delay;
        self.timers.set(Timer::Reopen, now + delay);
    }

    /// The dial requested by `Io::Dial` finished.
    pub fn handle_dialed(&mut self, now: Instant, result: io::Result<SocketAddr>) {
        if self.state != State::Connecting || !self.bound {
            return;
        }
        match result {
            Ok(remote) => {
                debug!("[{}] connected to {}", self.config.name(), remote);
                self.start_stream(now, remote);
                self.send_client_handshake(now);
            }
            Err(err) => {
                debug!(
                    "[{}] dialing {} failed: {}",
                    self.config.name(),
                    self.config.server_address(),
                    err
                );
                self.events
                    .push_back(Event::ConnectionError(ErrorCode::Socket(err.kind())));
                let delay = self.config.timing().recovery_delay;
                self.timers.set(Timer::Dial, now + delay);
            }
        }
    }

    /// The listener accepted a stream.
    pub fn handle_accepted(&mut self, now: Instant, remote: SocketAddr) {
        if !self.bound {
            return;
        }
        debug!("[{}] accepted stream from {}", self.config.name(), remote);
        self.start_stream(now, remote);
    }

    /// Bytes arrived on the stream.
    pub fn handle_stream_data(&mut self, now: Instant, data: &[u8]) {
        let remote = match self.stream_peer {
            Some(remote) if self.bound => remote,
            _ => return,
        };
        self.decoder.extend(data);
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => self.handle_frame(now, remote, frame),
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        "[{}] stream from {} misaligned: {}",
                        self.config.name(),
                        remote,
                        err
                    );
                    self.events.push_back(Event::ConnectionError(err.into()));
                    self.reset(now, Duration::from_millis(0));
                    break;
                }
            }
            if self.stream_peer.is_none() {
                break;
            }
        }
    }

    /// The peer closed the stream.
    pub fn handle_stream_closed(&mut self, now: Instant) {
        if !self.bound {
            return;
        }
        warn!("[{}] stream closed by peer", self.config.name());
        self.events
            .push_back(Event::ConnectionError(ErrorCode::StreamClosed));
        let delay = self.config.timing().recovery_delay;
        self.reset(now, delay);
    }

    /// A datagram arrived.
    pub fn handle_datagram(&mut self, now: Instant, from: SocketAddr, data: &[u8]) {
        if !self.bound {
            return;
        }
        let from_peer = self.state == State::Connected && self.peer == Some(from);
        let frame = match packet::decode_datagram(data) {
            Ok(frame) => frame,
            Err(err) if from_peer => {
                warn!("[{}] malformed datagram from peer: {}", self.config.name(), err);
                self.events.push_back(Event::ConnectionError(err.into()));
                self.reset(now, Duration::from_millis(0));
                return;
            }
            Err(err) => {
                trace!("[{}] dropping datagram from {}: {}", self.config.name(), from, err);
                return;
            }
        };
        let relock = self.config.role() == Role::Server && frame.ty == MessageType::ClientHandshake;
        if self.state == State::Connected && !from_peer && !relock {
            trace!("[{}] dropping datagram from stranger {}", self.config.name(), from);
            return;
        }
        self.handle_frame(now, from, frame);
    }

    /// The socket failed.
    pub fn handle_socket_error(&mut self, now: Instant, err: &io::Error) {
        if !self.bound {
            return;
        }
        warn!("[{}] socket error: {}", self.config.name(), err);
        self.events
            .push_back(Event::ConnectionError(ErrorCode::Socket(err.kind())));
        let delay = self.config.timing().recovery_delay;
        self.reset(now, delay);
    }

    /// Processes expired timers.
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(timer) = self.timers.expire_before(now) {
            match timer {
                Timer::HandshakeRetry => {
                    if self.state == State::Connecting && self.bound {
                        self.send_client_handshake(now);
                    }
                }
                Timer::Dial => {
                    if self.state == State::Connecting && self.bound && self.stream_peer.is_none() {
                        self.dial();
                    }
                }
                Timer::Liveness => self.check_liveness(now),
                Timer::HandshakeDeadline => {
                    if self.state == State::Connecting {
                        warn!("[{}] handshake timed out", self.config.name());
                        self.events
                            .push_back(Event::ConnectionError(ErrorCode::HandshakeTimeout));
                        self.reset(now, Duration::from_millis(0));
                    }
                }
                Timer::Reopen => {
                    if self.state == State::Connecting && !self.bound {
                        self.io.push_back(Io::Bind {
                            local: self.config.local_bind_addr(),
                        });
                    }
                }
            }
        }
    }

    /// Next time `handle_timeout` has to be called.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Next socket operation.
    pub fn poll_io(&mut self) -> Option<Io> {
        self.io.pop_front()
    }

    /// Next event for the application.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn check_liveness(&mut self, now: Instant) {
        if self.state != State::Connected {
            return;
        }
        let timing = *self.config.timing();
        let silent = self
            .last_received
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        if silent >= timing.idle_timeout {
            warn!(
                "[{}] nothing received for {:?}, resetting",
                self.config.name(),
                silent
            );
            self.events
                .push_back(Event::ConnectionError(ErrorCode::IdleTimeout));
            self.reset(now, Duration::from_millis(0));
            return;
        }
        let quiet = self
            .last_sent
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(timing.heartbeat_interval);
        if quiet >= timing.heartbeat_interval {
            if let Some(peer) = self.peer {
                self.send(now, MessageType::Heartbeat, &[], peer);
            }
        }
        self.timers
            .set(Timer::Liveness, now + timing.liveness_interval());
    }

    fn handle_frame(&mut self, now: Instant, from: SocketAddr, frame: Frame) {
        match frame.ty {
            MessageType::ClientHandshake | MessageType::ServerHandshake => {
                self.handle_handshake(now, from, frame)
            }
            _ if self.state != State::Connected => {
                trace!(
                    "[{}] dropping {:?} from unverified {}",
                    self.config.name(),
                    frame.ty,
                    from
                );
            }
            MessageType::Normal => {
                self.last_received = Some(now);
                if self.config.drop_old_packets() && !is_newer(frame.id, self.last_receive_id) {
                    trace!(
                        "[{}] dropping stale message {} (last {})",
                        self.config.name(),
                        frame.id,
                        self.last_receive_id
                    );
                    return;
                }
                self.accept(&frame);
                self.events
                    .push_back(Event::MessageReceived(frame.payload));
                self.maybe_send_ack(now);
            }
            MessageType::Heartbeat => {
                self.last_received = Some(now);
                self.accept(&frame);
                self.maybe_send_ack(now);
            }
            MessageType::Ack => {
                self.last_received = Some(now);
                self.accept(&frame);
                let ack_id = match frame.ack_id() {
                    Some(ack_id) => ack_id,
                    None => {
                        warn!("[{}] ack without id", self.config.name());
                        return;
                    }
                };
                match self.stats.on_ack(now, self.next_send_id, ack_id) {
                    Some(snapshot) => self.events.push_back(Event::StatisticsUpdate(snapshot)),
                    None => warn!(
                        "[{}] ack for {} is not in the sent log (next id {})",
                        self.config.name(),
                        ack_id,
                        self.next_send_id
                    ),
                }
            }
        }
    }

    fn handle_handshake(&mut self, now: Instant, from: SocketAddr, frame: Frame) {
        let expected = match self.config.role() {
            Role::Server => MessageType::ClientHandshake,
            Role::Client => MessageType::ServerHandshake,
        };
        if frame.ty != expected {
            trace!(
                "[{}] dropping {:?} from {}",
                self.config.name(),
                frame.ty,
                from
            );
            return;
        }
        if &frame.payload[..] != self.config.name().as_bytes() {
            warn!(
                "[{}] rejecting handshake from {} for {:?}",
                self.config.name(),
                from,
                String::from_utf8_lossy(&frame.payload)
            );
            return;
        }
        let known = self.state == State::Connected && self.peer == Some(from);
        match self.config.role() {
            Role::Server => {
                if known {
                    // the client is connecting again and restarts its ids
                    debug!("[{}] repeating handshake to {}", self.config.name(), from);
                    self.last_received = Some(now);
                    self.last_receive_id = 0;
                    self.stats.reset_receive();
                } else {
                    debug!("[{}] handshake from {}", self.config.name(), from);
                    self.establish(now, from);
                }
                let name = self.config.name().as_bytes().to_vec();
                self.send(now, MessageType::ServerHandshake, &name, from);
            }
            Role::Client => {
                if from != self.config.server_address() {
                    warn!(
                        "[{}] rejecting handshake from {}, expected {}",
                        self.config.name(),
                        from,
                        self.config.server_address()
                    );
                    return;
                }
                if known {
                    self.last_received = Some(now);
                } else if self.state == State::Connecting {
                    debug!("[{}] handshake from {}", self.config.name(), from);
                    self.establish(now, from);
                }
            }
        }
    }

    fn establish(&mut self, now: Instant, peer: SocketAddr) {
        self.reset_vars(Some(now));
        self.timers.stop(Timer::HandshakeRetry);
        self.timers.stop(Timer::HandshakeDeadline);
        self.timers.stop(Timer::Dial);
        let liveness = self.config.timing().liveness_interval();
        self.timers.set(Timer::Liveness, now + liveness);
        self.set_peer(Some(peer));
        self.set_state(State::Connected);
    }

    fn accept(&mut self, frame: &Frame) {
        self.stats.on_received(frame.ty, frame.wire_len);
        if is_newer(frame.id, self.last_receive_id) {
            self.last_receive_id = frame.id;
        }
    }

    fn maybe_send_ack(&mut self, now: Instant) {
        if !self.config.send_acks() {
            return;
        }
        let interval = self.config.timing().stats_interval;
        if let Some(last_ack) = self.last_ack {
            if now < last_ack + interval {
                return;
            }
        }
        if let Some(peer) = self.peer {
            self.last_ack = Some(now);
            let payload = packet::ack_payload(self.last_receive_id);
            self.send(now, MessageType::Ack, &payload, peer);
        }
    }

    fn send_client_handshake(&mut self, now: Instant) {
        let server = self.config.server_address();
        trace!("[{}] sending handshake to {}", self.config.name(), server);
        let name = self.config.name().as_bytes().to_vec();
        self.send(now, MessageType::ClientHandshake, &name, server);
        if self.config.protocol() == Protocol::Udp {
            let interval = self.config.timing().handshake_interval;
            self.timers.set(Timer::HandshakeRetry, now + interval);
        }
    }

    fn dial(&mut self) {
        debug!(
            "[{}] dialing {}",
            self.config.name(),
            self.config.server_address()
        );
        self.io.push_back(Io::Dial {
            remote: self.config.server_address(),
            timeout: self.config.timing().connect_timeout,
        });
    }

    fn start_stream(&mut self, now: Instant, remote: SocketAddr) {
        self.stream_peer = Some(remote);
        self.decoder.clear();
        let deadline = now + self.config.timing().idle_timeout;
        self.timers.set(Timer::HandshakeDeadline, deadline);
    }

    fn send(&mut self, now: Instant, ty: MessageType, payload: &[u8], to: SocketAddr) {
        let id = self.next_send_id;
        self.next_send_id = self.next_send_id.wrapping_add(1);
        let contents = packet::encode(self.config.protocol(), ty, id, payload);
        self.stats.on_sent(now, ty, contents.len());
        self.last_sent = Some(now);
        let destination = match self.config.protocol() {
            Protocol::Udp => Some(to),
            Protocol::Tcp => None,
        };
        self.io.push_back(Io::Transmit(Transmit {
            destination,
            contents,
        }));
    }

    /// Tears the connection down and starts over.
    ///
    /// The socket is reopened after `delay`, or right away if it is zero.
    fn reset(&mut self, now: Instant, delay: Duration) {
        warn!("[{}] resetting connection", self.config.name());
        self.release();
        self.set_peer(None);
        self.reset_vars(None);
        self.set_state(State::Connecting);
        if delay == Duration::from_millis(0) {
            self.io.push_back(Io::Bind {
                local: self.config.local_bind_addr(),
            });
        } else {
            self.timers.set(Timer::Reopen, now + delay);
        }
    }

    /// Stops all timers and closes the socket.
    fn release(&mut self) {
        self.timers.clear();
        self.stream_peer = None;
        self.decoder.clear();
        if self.bound {
            self.bound = false;
            self.io.push_back(Io::Close);
        }
    }

    fn reset_vars(&mut self, now: Option<Instant>) {
        self.next_send_id = 1;
        self.last_receive_id = 0;
        self.last_received = now;
        self.last_sent = now;
        self.last_ack = None;
        self.stats.reset(now);
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        info!(
            "[{}] {:?} -> {:?}",
            self.config.name(),
            self.state,
            state
        );
        self.state = state;
        self.events.push_back(Event::StateChanged(state));
    }

    fn set_peer(&mut self, peer: Option<SocketAddr>) {
        if self.peer == peer {
            return;
        }
        match peer {
            Some(peer) => info!("[{}] peer is {}", self.config.name(), peer),
            None => info!("[{}] peer cleared", self.config.name()),
        }
        self.peer = peer;
        self.events.push_back(Event::PeerAddressChanged(peer));
    }
}
