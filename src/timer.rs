use std::time::Instant;

/// Named deadlines of a connection.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub(crate) enum Timer {
    /// When to resend a client handshake datagram
    HandshakeRetry = 0,
    /// When to dial the server
    Dial = 1,
    /// When to check for peer silence and send a heartbeat
    Liveness = 2,
    /// When to give up on a stream that did not complete the handshake
    HandshakeDeadline = 3,
    /// When to reopen the socket after a reset
    Reopen = 4,
}

impl Timer {
    pub const VALUES: [Self; 5] = [
        Timer::HandshakeRetry,
        Timer::Dial,
        Timer::Liveness,
        Timer::HandshakeDeadline,
        Timer::Reopen,
    ];
}

/// Keeps track of the deadline of each `Timer`
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; Timer::VALUES.len()],
}

impl TimerTable {
    /// Sets the timer unconditionally
    pub fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    pub fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    /// Stops all timers
    pub fn clear(&mut self) {
        self.data = Default::default();
    }

    /// Get the next queued timeout
    pub fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    /// Remove the next timer up until `now`, including it
    pub fn expire_before(&mut self, now: Instant) -> Option<Timer> {
        for &timer in Timer::VALUES.iter() {
            match self.data[timer as usize] {
                Some(time) if time <= now => {
                    self.data[timer as usize] = None;
                    return Some(timer);
                }
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timer_table() {
        let mut timers = TimerTable::default();
        let sec = Duration::from_secs(1);
        let now = Instant::now() + Duration::from_secs(10);
        timers.set(Timer::Liveness, now - 3 * sec);
        timers.set(Timer::HandshakeRetry, now - 2 * sec);
        timers.set(Timer::Reopen, now + sec);

        assert_eq!(timers.next_timeout(), Some(now - 3 * sec));
        assert_eq!(timers.expire_before(now), Some(Timer::HandshakeRetry));
        assert_eq!(timers.expire_before(now), Some(Timer::Liveness));
        assert_eq!(timers.expire_before(now), None);
        assert_eq!(timers.next_timeout(), Some(now + sec));

        timers.stop(Timer::Reopen);
        assert_eq!(timers.next_timeout(), None);
        timers.set(Timer::Dial, now);
        timers.clear();
        assert_eq!(timers.next_timeout(), None);
    }
}
