//! Constants of the channel protocol.
//!
//! The wire constants are shared with the half-duplex firmware variant that
//! runs on the embedded control boards. Nothing but this agreement is shared
//! with it, so the numbers here must not change.
//!
//! # Sequence number wraparound
//! Sequence ids are 32 bits wide and start at 1 on every connection. At the
//! heartbeat rate a channel would need years of uptime without a single
//! reconnect to wrap, but a busy control link sending at a few kHz wraps in
//! under a month. Ids are therefore compared with serial number arithmetic
//! (RFC 1982):
//!
//!   a is newer than b  <=>  0 < (a - b) mod 2^32 < 2^31
//!
//! so the comparison keeps working across the wrap as long as the two ids
//! are less than 2^31 apart, which the idle timeout guarantees in practice.
use std::time::Duration;

/// Sequence id of a message.
pub type SequenceNumber = u32;

/// Length of the datagram header: type and sequence id.
pub const UDP_HEADER_LEN: usize = 5;
/// Length of the stream length prefix.
pub const LENGTH_PREFIX_LEN: usize = 2;
/// Length of the stream header: length prefix, type and sequence id.
pub const TCP_HEADER_LEN: usize = LENGTH_PREFIX_LEN + UDP_HEADER_LEN;

/// Maximum length of an application payload.
pub const MAX_PAYLOAD_LEN: usize = 500;
/// Maximum length of a datagram.
pub const MAX_UDP_MESSAGE_LEN: usize = UDP_HEADER_LEN + MAX_PAYLOAD_LEN;
/// Maximum value of the stream length prefix.
pub const MAX_TCP_MESSAGE_LEN: usize = TCP_HEADER_LEN + MAX_PAYLOAD_LEN;

/// Number of send timestamps kept for round trip time measurement.
pub const SENT_LOG_CAPACITY: usize = 300;

/// Interval between client handshake datagrams.
pub const DEFAULT_HANDSHAKE_INTERVAL: Duration = Duration::from_millis(250);
/// Sending silence after which a heartbeat goes out.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);
/// Receiving silence after which the connection is reset.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(5000);
/// Minimum interval between acks.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(500);
/// Delay before reopening a socket that failed.
pub const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_millis(1000);
/// Upper bound of a single dial.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Returns true if `a` is newer than `b`.
pub fn is_newer(a: SequenceNumber, b: SequenceNumber) -> bool {
    let distance = a.wrapping_sub(b);
    distance != 0 && distance < 1 << 31
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_comparison() {
        assert!(is_newer(2, 1));
        assert!(!is_newer(1, 1));
        assert!(!is_newer(1, 2));
        assert!(is_newer(0, u32::max_value()));
        assert!(is_newer(5, u32::max_value() - 5));
        assert!(!is_newer(u32::max_value(), 3));
        assert!(!is_newer(1 << 31, 0));
    }
}
