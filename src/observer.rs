use crate::connection::{Event, State};
use crate::error::ErrorCode;
use crate::stats::Statistics;
use bytes::Bytes;
use std::net::SocketAddr;

/// Receives the events of a channel.
///
/// Observers are invoked synchronously from the task driving the channel,
/// in registration order. Every method has an empty default, so observers
/// only implement what they care about.
pub trait ChannelObserver {
    /// An application message arrived.
    fn message_received(&mut self, _payload: &Bytes) {}

    /// The channel changed state.
    fn state_changed(&mut self, _state: State) {}

    /// The verified peer changed.
    fn peer_address_changed(&mut self, _peer: Option<SocketAddr>) {}

    /// The peer acked a message.
    fn statistics_update(&mut self, _statistics: &Statistics) {}

    /// The channel hit an error.
    fn connection_error(&mut self, _code: &ErrorCode) {}
}

pub(crate) fn dispatch(observer: &mut dyn ChannelObserver, event: &Event) {
    match event {
        Event::MessageReceived(payload) => observer.message_received(payload),
        Event::StateChanged(state) => observer.state_changed(*state),
        Event::PeerAddressChanged(peer) => observer.peer_address_changed(*peer),
        Event::StatisticsUpdate(statistics) => observer.statistics_update(statistics),
        Event::ConnectionError(code) => observer.connection_error(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct States(Vec<State>);

    impl ChannelObserver for States {
        fn state_changed(&mut self, state: State) {
            self.0.push(state);
        }
    }

    #[test]
    fn test_dispatch() {
        let mut states = States::default();
        dispatch(&mut states, &Event::StateChanged(State::Connecting));
        dispatch(&mut states, &Event::MessageReceived(Bytes::from_static(b"ignored")));
        dispatch(&mut states, &Event::StateChanged(State::Connected));
        assert_eq!(states.0, vec![State::Connecting, State::Connected]);
    }
}
