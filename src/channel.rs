//! Socket driver of a connection.
use crate::config::{ChannelConfig, Role};
use crate::connection::{Connection, Event, Io, State};
use crate::error::{Error, ErrorCode, SendError};
use crate::observer::{dispatch, ChannelObserver};
use crate::stats::Statistics;
use addr::Protocol;
use async_std::future;
use async_std::io;
use async_std::task;
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use transport::{Input, Options, Transport};

/// Receive buffer size, large enough for any datagram.
const RECV_BUF_LEN: usize = 1 << 16;

enum Slot {
    Unconfigured { open_pending: bool },
    Failed,
    Configured(Connection),
}

/// A named point to point message channel.
///
/// The channel makes progress while one of `open`, `send_message`,
/// `next_event` or `run_for` is awaited. Events are handed to registered
/// observers as they happen and are also returned from `next_event`.
pub struct Channel {
    name: String,
    slot: Slot,
    transport: Option<Transport>,
    observers: Vec<Box<dyn ChannelObserver>>,
    events: VecDeque<Event>,
    buf: Vec<u8>,
}

impl Channel {
    /// Creates an unconfigured channel.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            slot: Slot::Unconfigured {
                open_pending: false,
            },
            transport: None,
            observers: Vec::new(),
            events: VecDeque::new(),
            buf: vec![0; RECV_BUF_LEN],
        }
    }

    /// Creates a configured channel.
    pub fn with_config(config: ChannelConfig) -> Result<Self, Error> {
        let mut channel = Self::new(config.name());
        channel.configure(config)?;
        Ok(channel)
    }

    /// Name of the channel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers an observer.
    pub fn add_observer(&mut self, observer: Box<dyn ChannelObserver>) {
        self.observers.push(observer);
    }

    /// Current state.
    pub fn state(&self) -> State {
        match &self.slot {
            Slot::Unconfigured { .. } => State::Unconfigured,
            Slot::Failed => State::Error,
            Slot::Configured(conn) => conn.state(),
        }
    }

    /// Address of the verified peer.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        match &self.slot {
            Slot::Configured(conn) => conn.peer(),
            _ => None,
        }
    }

    /// Current statistics.
    pub fn statistics(&self) -> Statistics {
        match &self.slot {
            Slot::Configured(conn) => *conn.statistics(),
            _ => Statistics::default(),
        }
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport
            .as_ref()
            .and_then(|transport| transport.local_addr().ok())
    }

    /// Applies a configuration.
    ///
    /// An invalid configuration fails the channel for good. A configured
    /// channel is closed before the new configuration takes effect.
    pub fn configure(&mut self, config: ChannelConfig) -> Result<(), Error> {
        let open_pending = match self.slot {
            Slot::Failed => return Err(Error::Failed),
            Slot::Unconfigured { open_pending } => open_pending,
            Slot::Configured(_) => {
                self.close();
                false
            }
        };
        if let Err(err) = config.validate() {
            self.fail(&err);
            return Err(err.into());
        }
        self.name = config.name().to_string();
        info!(
            "[{}] configured as {} {} of {}",
            self.name,
            config.protocol(),
            config.role(),
            config.server_address()
        );
        let mut conn = Connection::new(config);
        if open_pending {
            conn.open();
        }
        self.slot = Slot::Configured(conn);
        self.publish(Event::StateChanged(State::Ready));
        self.collect_events();
        Ok(())
    }

    /// Loads the configuration of this channel from a file.
    ///
    /// The channel stays unconfigured if the file cannot be read, so
    /// loading can be retried.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        match ChannelConfig::load(path.as_ref(), &self.name) {
            Ok(config) => self.configure(config),
            Err(err) if err.is_retryable() => {
                warn!(
                    "[{}] failed to read {}: {}",
                    self.name,
                    path.as_ref().display(),
                    err
                );
                Err(err.into())
            }
            Err(err) => {
                if let Slot::Unconfigured { .. } = self.slot {
                    self.fail(&err);
                }
                Err(err.into())
            }
        }
    }

    /// Opens the socket and starts connecting.
    ///
    /// Opening an unconfigured channel is deferred until it is configured.
    pub async fn open(&mut self) -> Result<(), Error> {
        match &mut self.slot {
            Slot::Unconfigured { open_pending } => {
                debug!("[{}] not configured, deferring open", self.name);
                *open_pending = true;
                return Ok(());
            }
            Slot::Failed => return Err(Error::Failed),
            Slot::Configured(conn) => conn.open(),
        }
        let err = self.drive(Instant::now()).await;
        match (self.state(), err) {
            (State::Error, Some(err)) => Err(Error::Bind(err)),
            (State::Error, None) => Err(Error::Failed),
            _ => Ok(()),
        }
    }

    /// Closes the socket and stops all timers.
    ///
    /// Closing twice is harmless.
    pub fn close(&mut self) {
        match &mut self.slot {
            Slot::Unconfigured { open_pending } => *open_pending = false,
            Slot::Failed => {}
            Slot::Configured(conn) => {
                conn.close();
                while let Some(io) = conn.poll_io() {
                    match io {
                        Io::Close => self.transport = None,
                        io => trace!("[{}] discarding {:?}", self.name, io),
                    }
                }
            }
        }
        self.transport = None;
        self.collect_events();
    }

    /// Sends a message to the peer.
    ///
    /// Payloads longer than 500 bytes are truncated. The message is written
    /// right away, nothing waits for the peer.
    pub async fn send_message(&mut self, payload: &[u8]) -> Result<(), SendError> {
        let now = Instant::now();
        match &mut self.slot {
            Slot::Configured(conn) => conn.send_message(now, payload)?,
            _ => return Err(SendError::NotConnected),
        }
        match self.drive(now).await {
            Some(err) => Err(SendError::Io(err)),
            None => Ok(()),
        }
    }

    /// Waits for the next event.
    ///
    /// Returns `None` when the channel is idle and nothing can happen
    /// anymore, for example after `close`.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if !self.is_active() {
                return None;
            }
            self.step(None).await;
        }
    }

    /// Drives the channel for `duration`.
    ///
    /// Events are delivered to observers only.
    pub async fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        self.events.clear();
        loop {
            if self.is_active() {
                self.step(Some(deadline)).await;
            } else {
                task::sleep(deadline.saturating_duration_since(Instant::now())).await;
            }
            self.events.clear();
            if Instant::now() >= deadline {
                break;
            }
        }
    }

    fn is_active(&self) -> bool {
        match &self.slot {
            Slot::Configured(conn) => {
                self.transport.is_some()
                    || conn.poll_timeout().is_some()
                    || conn.state() == State::Connecting
            }
            _ => false,
        }
    }

    fn fail(&mut self, err: &crate::config::ConfigError) {
        warn!("[{}] invalid configuration: {}", self.name, err);
        self.close();
        self.slot = Slot::Failed;
        self.publish(Event::ConnectionError(ErrorCode::InvalidConfig));
        self.publish(Event::StateChanged(State::Error));
    }

    /// Waits for socket input or the next timer and feeds it to the
    /// connection.
    async fn step(&mut self, until: Option<Instant>) {
        let now = Instant::now();
        self.drive(now).await;
        let timeout = match &self.slot {
            Slot::Configured(conn) => conn.poll_timeout(),
            _ => return,
        };
        let deadline = match (timeout, until) {
            (Some(timeout), Some(until)) => Some(timeout.min(until)),
            (timeout, until) => timeout.or(until),
        };
        let wait = deadline.map(|deadline| deadline.saturating_duration_since(now));
        let input = match (self.transport.as_mut(), wait) {
            (Some(transport), Some(wait)) => {
                future::timeout(wait, transport.recv(&mut self.buf)).await.ok()
            }
            (Some(transport), None) => Some(transport.recv(&mut self.buf).await),
            (None, Some(wait)) => {
                task::sleep(wait).await;
                None
            }
            (None, None) => None,
        };
        let now = Instant::now();
        if let Slot::Configured(conn) = &mut self.slot {
            match input {
                Some(Ok(Input::Datagram { from, len })) => {
                    conn.handle_datagram(now, from, &self.buf[..len])
                }
                Some(Ok(Input::Accepted(remote))) => conn.handle_accepted(now, remote),
                Some(Ok(Input::Data(len))) => conn.handle_stream_data(now, &self.buf[..len]),
                Some(Ok(Input::Closed)) => conn.handle_stream_closed(now),
                Some(Err(err)) => conn.handle_socket_error(now, &err),
                None => {}
            }
            conn.handle_timeout(now);
        }
        self.drive(now).await;
    }

    /// Executes the socket operations of the connection.
    ///
    /// Returns the first socket error.
    async fn drive(&mut self, now: Instant) -> Option<io::Error> {
        let mut first_err = None;
        loop {
            let io = match &mut self.slot {
                Slot::Configured(conn) => conn.poll_io(),
                _ => None,
            };
            let io = match io {
                Some(io) => io,
                None => break,
            };
            match io {
                Io::Bind { local } => {
                    self.transport = None;
                    let result = match &self.slot {
                        Slot::Configured(conn) => bind(conn.config(), local),
                        _ => break,
                    };
                    match result {
                        Ok(transport) => {
                            let local = transport.local_addr().unwrap_or(local);
                            self.transport = Some(transport);
                            if let Slot::Configured(conn) = &mut self.slot {
                                conn.handle_bound(now, local);
                            }
                        }
                        Err(err) => {
                            if let Slot::Configured(conn) = &mut self.slot {
                                conn.handle_bind_failed(now, &err);
                            }
                            first_err.get_or_insert(err);
                        }
                    }
                }
                Io::Dial { remote, timeout } => {
                    let result = match self.transport.as_mut() {
                        Some(transport) => transport.dial(remote, timeout).await,
                        None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
                    };
                    if let Slot::Configured(conn) = &mut self.slot {
                        conn.handle_dialed(Instant::now(), result);
                    }
                }
                Io::Transmit(transmit) => {
                    let result = match self.transport.as_mut() {
                        Some(transport) => {
                            transport
                                .send(transmit.destination, &transmit.contents)
                                .await
                        }
                        None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
                    };
                    if let Err(err) = result {
                        if let Slot::Configured(conn) = &mut self.slot {
                            conn.handle_socket_error(Instant::now(), &err);
                        }
                        first_err.get_or_insert(err);
                    }
                }
                Io::Close => {
                    debug!("[{}] closing socket", self.name);
                    self.transport = None;
                }
            }
        }
        self.collect_events();
        first_err
    }

    fn collect_events(&mut self) {
        loop {
            let event = match &mut self.slot {
                Slot::Configured(conn) => conn.poll_event(),
                _ => None,
            };
            match event {
                Some(event) => self.publish(event),
                None => break,
            }
        }
    }

    fn publish(&mut self, event: Event) {
        for observer in self.observers.iter_mut() {
            dispatch(&mut **observer, &event);
        }
        self.events.push_back(event);
    }
}

fn bind(config: &ChannelConfig, local: SocketAddr) -> io::Result<Transport> {
    let options = Options {
        low_delay: config.low_delay(),
    };
    match (config.protocol(), config.role()) {
        (Protocol::Udp, _) => Transport::udp(local, options),
        (Protocol::Tcp, Role::Server) => Transport::tcp_listener(local, options),
        (Protocol::Tcp, Role::Client) => Ok(Transport::tcp_client(local, options)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timing;
    use bytes::Bytes;
    use failure::Error;
    use std::cell::RefCell;
    use std::net::IpAddr;
    use std::rc::Rc;

    const NAME: &str = "Soro_ArmChannel";
    const SLICE: Duration = Duration::from_millis(20);

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<Event>>>);

    impl Recorder {
        fn messages(&self) -> Vec<Bytes> {
            self.0
                .borrow()
                .iter()
                .filter_map(|event| match event {
                    Event::MessageReceived(payload) => Some(payload.clone()),
                    _ => None,
                })
                .collect()
        }

        fn contains(&self, event: &Event) -> bool {
            self.0.borrow().iter().any(|e| e == event)
        }
    }

    impl ChannelObserver for Recorder {
        fn message_received(&mut self, payload: &Bytes) {
            self.0.borrow_mut().push(Event::MessageReceived(payload.clone()));
        }

        fn state_changed(&mut self, state: State) {
            self.0.borrow_mut().push(Event::StateChanged(state));
        }

        fn connection_error(&mut self, code: &ErrorCode) {
            self.0.borrow_mut().push(Event::ConnectionError(code.clone()));
        }
    }

    fn server_config(protocol: Protocol) -> ChannelConfig {
        let server = "127.0.0.1:0".parse().unwrap();
        ChannelConfig::new(NAME, protocol, Role::Server, server)
            .set_host_address("127.0.0.1".parse().unwrap())
            .set_low_delay(true)
    }

    async fn pair(protocol: Protocol) -> Result<(Channel, Channel), Error> {
        pair_from(protocol, "127.0.0.1".parse()?).await
    }

    async fn pair_from(protocol: Protocol, client_host: IpAddr) -> Result<(Channel, Channel), Error> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut server = Channel::with_config(server_config(protocol))?;
        server.open().await?;
        let server_addr = server.local_addr().ok_or_else(|| failure::err_msg("unbound"))?;
        let client_config = ChannelConfig::new(NAME, protocol, Role::Client, server_addr)
            .set_host_address(client_host);
        let mut client = Channel::with_config(client_config)?;
        client.open().await?;

        for _ in 0..50 {
            if server.state() == State::Connected && client.state() == State::Connected {
                break;
            }
            server.run_for(SLICE).await;
            client.run_for(SLICE).await;
        }
        assert_eq!(server.state(), State::Connected);
        assert_eq!(client.state(), State::Connected);
        assert_eq!(client.peer_address(), Some(server_addr));
        assert_eq!(server.peer_address(), client.local_addr());
        Ok((server, client))
    }

    async fn exchange(protocol: Protocol) -> Result<(), Error> {
        let (mut server, mut client) = pair(protocol).await?;
        let recorder = Recorder::default();
        server.add_observer(Box::new(recorder.clone()));

        client.send_message(b"drive 0.5 0.5").await?;
        for _ in 0..10 {
            if !recorder.messages().is_empty() {
                break;
            }
            server.run_for(SLICE).await;
        }
        assert_eq!(recorder.messages(), vec![Bytes::from_static(b"drive 0.5 0.5")]);

        server.send_message(b"ack drive").await?;
        loop {
            match client.next_event().await {
                Some(Event::MessageReceived(payload)) => {
                    assert_eq!(&payload[..], b"ack drive");
                    break;
                }
                Some(_) => {}
                None => panic!("channel went idle"),
            }
        }
        assert_eq!(client.statistics().messages_down, 1);
        Ok(())
    }

    #[test]
    fn test_udp_exchange() {
        task::block_on(exchange(Protocol::Udp)).unwrap();
    }

    #[test]
    fn test_tcp_exchange() {
        task::block_on(exchange(Protocol::Tcp)).unwrap();
    }

    #[cfg(target_os = "linux")]
    async fn client_host_address(protocol: Protocol) -> Result<(), Error> {
        let host: IpAddr = "127.0.0.2".parse()?;
        let (server, client) = pair_from(protocol, host).await?;
        let peer = server.peer_address().ok_or_else(|| failure::err_msg("no peer"))?;
        assert_eq!(peer.ip(), host);
        assert_eq!(client.local_addr(), Some(peer));
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_tcp_client_host_address() {
        task::block_on(client_host_address(Protocol::Tcp)).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_udp_client_host_address() {
        task::block_on(client_host_address(Protocol::Udp)).unwrap();
    }

    async fn tcp_server_closed() -> Result<(), Error> {
        let (mut server, mut client) = pair(Protocol::Tcp).await?;
        let recorder = Recorder::default();
        client.add_observer(Box::new(recorder.clone()));

        server.close();
        server.close();
        assert_eq!(server.state(), State::Ready);
        assert!(server.next_event().await.is_some());

        for _ in 0..10 {
            if client.state() == State::Connecting {
                break;
            }
            client.run_for(SLICE).await;
        }
        assert_eq!(client.state(), State::Connecting);
        assert_eq!(client.peer_address(), None);
        // an unread heartbeat turns the close into a reset
        assert!(recorder.0.borrow().iter().any(|event| match event {
            Event::ConnectionError(ErrorCode::StreamClosed) => true,
            Event::ConnectionError(ErrorCode::Socket(_)) => true,
            _ => false,
        }));
        assert!(recorder.contains(&Event::StateChanged(State::Connecting)));
        Ok(())
    }

    #[test]
    fn test_tcp_server_closed() {
        task::block_on(tcp_server_closed()).unwrap();
    }

    async fn deferred_open() -> Result<(), Error> {
        let mut channel = Channel::new(NAME);
        assert_eq!(channel.state(), State::Unconfigured);
        channel.open().await?;
        assert!(channel.send_message(b"x").await.is_err());

        let err = channel.load("/nonexistent/soro.toml").unwrap_err();
        match err {
            crate::error::Error::Config(err) => assert!(err.is_retryable()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(channel.state(), State::Unconfigured);

        channel.configure(server_config(Protocol::Udp))?;
        channel.run_for(SLICE).await;
        assert_eq!(channel.state(), State::Connecting);
        assert!(channel.local_addr().is_some());

        channel.close();
        assert_eq!(channel.state(), State::Ready);
        assert!(channel.local_addr().is_none());
        Ok(())
    }

    #[test]
    fn test_deferred_open() {
        task::block_on(deferred_open()).unwrap();
    }

    async fn invalid_config() -> Result<(), Error> {
        let recorder = Recorder::default();
        let mut channel = Channel::new(NAME);
        channel.add_observer(Box::new(recorder.clone()));
        let timing = Timing {
            idle_timeout: Duration::from_millis(100),
            ..Timing::default()
        };
        let config = server_config(Protocol::Udp).set_timing(timing);
        assert!(channel.configure(config).is_err());
        assert_eq!(channel.state(), State::Error);
        assert!(recorder.contains(&Event::ConnectionError(ErrorCode::InvalidConfig)));
        assert!(recorder.contains(&Event::StateChanged(State::Error)));
        match channel.open().await {
            Err(crate::error::Error::Failed) => {}
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_invalid_config() {
        task::block_on(invalid_config()).unwrap();
    }

    async fn bind_conflict() -> Result<(), Error> {
        let mut first = Channel::with_config(server_config(Protocol::Udp))?;
        first.open().await?;
        let taken = first.local_addr().ok_or_else(|| failure::err_msg("unbound"))?;

        let config = ChannelConfig::new(NAME, Protocol::Udp, Role::Server, taken)
            .set_host_address("127.0.0.1".parse()?);
        let mut second = Channel::with_config(config)?;
        match second.open().await {
            Err(crate::error::Error::Bind(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(second.state(), State::Error);
        Ok(())
    }

    #[test]
    fn test_bind_conflict() {
        task::block_on(bind_conflict()).unwrap();
    }
}
