//! Round trip time and throughput measurement.
//!
//! Every sent message is logged with its send time. The peer periodically
//! acks the highest id it processed and the age of that id in the log gives
//! the round trip time. Throughput is measured between two acks.
use crate::constants::{SequenceNumber, SENT_LOG_CAPACITY};
use crate::packet::MessageType;
use std::time::{Duration, Instant};

/// Ring buffer of send times.
///
/// The entry for id `next_send_id - age` lives `age` slots behind the
/// cursor. Ids older than the capacity are overwritten.
#[derive(Debug)]
pub struct SentLog {
    entries: Vec<Option<Instant>>,
    cursor: usize,
}

impl SentLog {
    /// Creates an empty log with `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            entries: vec![None; capacity],
            cursor: 0,
        }
    }

    /// Logs the send time of the message that was just assigned an id.
    pub fn record(&mut self, now: Instant) {
        self.entries[self.cursor] = Some(now);
        self.cursor = (self.cursor + 1) % self.entries.len();
    }

    /// Looks up the send time of `id`.
    ///
    /// Returns `None` if `id` was never sent or was already evicted.
    pub fn lookup(&self, next_send_id: SequenceNumber, id: SequenceNumber) -> Option<Instant> {
        let capacity = self.entries.len();
        let age = next_send_id.wrapping_sub(id) as usize;
        if age == 0 || age > capacity {
            return None;
        }
        let index = (self.cursor + capacity - age) % capacity;
        self.entries[index]
    }

    /// Forgets all entries.
    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = None;
        }
        self.cursor = 0;
    }
}

impl Default for SentLog {
    fn default() -> Self {
        Self::new(SENT_LOG_CAPACITY)
    }
}

/// Statistics snapshot of a channel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    /// Last measured round trip time.
    pub rtt: Option<Duration>,
    /// Application messages sent since the connection was established.
    pub messages_up: u64,
    /// Application messages received since the connection was established.
    pub messages_down: u64,
    /// Bytes sent since the last ack.
    pub bytes_up: u64,
    /// Bytes received since the last ack.
    pub bytes_down: u64,
    /// Upstream rate in bytes per second.
    pub rate_up: u64,
    /// Downstream rate in bytes per second.
    pub rate_down: u64,
}

/// Counters and sent log of one connection.
#[derive(Debug, Default)]
pub(crate) struct StatisticsEngine {
    current: Statistics,
    log: SentLog,
    since: Option<Instant>,
}

impl StatisticsEngine {
    pub fn reset(&mut self, now: Option<Instant>) {
        self.current = Statistics::default();
        self.log.clear();
        self.since = now;
    }

    /// Forgets what was received. The sent log is kept.
    pub fn reset_receive(&mut self) {
        self.current.messages_down = 0;
        self.current.bytes_down = 0;
        self.current.rate_down = 0;
    }

    pub fn current(&self) -> &Statistics {
        &self.current
    }

    pub fn on_sent(&mut self, now: Instant, ty: MessageType, wire_len: usize) {
        self.log.record(now);
        self.current.bytes_up += wire_len as u64;
        if ty == MessageType::Normal {
            self.current.messages_up += 1;
        }
    }

    pub fn on_received(&mut self, ty: MessageType, wire_len: usize) {
        self.current.bytes_down += wire_len as u64;
        if ty == MessageType::Normal {
            self.current.messages_down += 1;
        }
    }

    /// Processes an ack and returns the published snapshot.
    ///
    /// Returns `None` without touching any counter if the acked id is not
    /// in the log.
    pub fn on_ack(
        &mut self,
        now: Instant,
        next_send_id: SequenceNumber,
        ack_id: SequenceNumber,
    ) -> Option<Statistics> {
        let sent = self.log.lookup(next_send_id, ack_id)?;
        self.current.rtt = Some(now.saturating_duration_since(sent));
        if let Some(since) = self.since {
            let elapsed = now.saturating_duration_since(since).as_micros() as u64;
            if elapsed > 0 {
                self.current.rate_up = self.current.bytes_up * 1_000_000 / elapsed;
                self.current.rate_down = self.current.bytes_down * 1_000_000 / elapsed;
            }
        }
        self.since = Some(now);
        let snapshot = self.current;
        self.current.bytes_up = 0;
        self.current.bytes_down = 0;
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sent_log() {
        let t0 = Instant::now();
        let mut log = SentLog::new(3);
        // ids 1, 2, 3 are sent, next id is 4
        for i in 0..3 {
            log.record(t0 + Duration::from_millis(i));
        }
        assert_eq!(log.lookup(4, 3), Some(t0 + Duration::from_millis(2)));
        assert_eq!(log.lookup(4, 1), Some(t0));
        assert_eq!(log.lookup(4, 4), None);
        assert_eq!(log.lookup(4, 0), None);

        // id 4 evicts id 1
        log.record(t0 + Duration::from_millis(3));
        assert_eq!(log.lookup(5, 1), None);
        assert_eq!(log.lookup(5, 2), Some(t0 + Duration::from_millis(1)));

        log.clear();
        assert_eq!(log.lookup(5, 4), None);
    }

    #[test]
    fn test_sent_log_wraps() {
        let t0 = Instant::now();
        let mut log = SentLog::default();
        log.record(t0);
        // id u32::MAX was sent, next id wrapped to 0
        assert_eq!(log.lookup(0, u32::max_value()), Some(t0));
    }

    #[test]
    fn test_engine() {
        let t0 = Instant::now();
        let mut engine = StatisticsEngine::default();
        engine.reset(Some(t0));
        engine.on_sent(t0, MessageType::Normal, 100);
        engine.on_sent(t0, MessageType::Heartbeat, 5);
        engine.on_received(MessageType::Normal, 45);
        engine.on_received(MessageType::Heartbeat, 5);
        assert_eq!(engine.current().messages_up, 1);
        assert_eq!(engine.current().messages_down, 1);

        let t1 = t0 + Duration::from_millis(500);
        let snapshot = engine.on_ack(t1, 3, 1).unwrap();
        assert_eq!(snapshot.rtt, Some(Duration::from_millis(500)));
        assert_eq!(snapshot.bytes_up, 105);
        assert_eq!(snapshot.rate_up, 210);
        assert_eq!(snapshot.rate_down, 100);
        assert_eq!(engine.current().bytes_up, 0);
        assert_eq!(engine.current().messages_up, 1);

        assert!(engine.on_ack(t1, 3, 7).is_none());
        assert_eq!(engine.current().rtt, Some(Duration::from_millis(500)));

        engine.on_sent(t1, MessageType::Normal, 20);
        engine.reset_receive();
        assert_eq!(engine.current().messages_down, 0);
        assert_eq!(engine.current().messages_up, 2);
        assert!(engine.on_ack(t1, 4, 3).is_some());
    }
}
