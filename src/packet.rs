//! Wire format of channel messages.
//!
//! Datagrams carry exactly one message. Streams prefix every message with
//! its total length so the receiver can find message boundaries.
//!
//! ```text
//! UDP
//! 0       8       16      24      32      40
//! +-------+-------+-------+-------+-------+---------------
//! | type  | sequence id                   | payload ...
//! +-------+-------+-------+-------+-------+---------------
//!
//! TCP
//! 0       8       16      24      32      40      48      56
//! +-------+-------+-------+-------+-------+-------+-------+---------------
//! | total length  | type  | sequence id                   | payload ...
//! +-------+-------+-------+-------+-------+-------+-------+---------------
//! ```
//!
//! All integers are big endian. The total length includes the header.
use crate::constants::*;
use addr::Protocol;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use failure::Fail;

/// Type of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    /// Application data.
    Normal = 0,
    /// Handshake sent by the client, payload is the channel name.
    ClientHandshake = 1,
    /// Handshake sent by the server, payload is the channel name.
    ServerHandshake = 2,
    /// Keep-alive without payload.
    Heartbeat = 3,
    /// Highest received sequence id, used for statistics.
    Ack = 4,
}

impl MessageType {
    /// Parses a type code.
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => MessageType::Normal,
            1 => MessageType::ClientHandshake,
            2 => MessageType::ServerHandshake,
            3 => MessageType::Heartbeat,
            4 => MessageType::Ack,
            _ => return None,
        })
    }
}

/// Framing violation.
#[derive(Clone, Debug, Eq, Fail, PartialEq)]
pub enum ProtocolError {
    /// The message is shorter than its header.
    #[fail(display = "truncated message")]
    Truncated,
    /// The type code is unknown.
    #[fail(display = "unknown message type {}", _0)]
    UnknownType(u8),
    /// The length prefix is out of range.
    #[fail(display = "invalid length prefix {}", _0)]
    BadLength(u16),
    /// The payload exceeds the maximum payload length.
    #[fail(display = "oversized message of {} bytes", _0)]
    Oversized(usize),
}

/// A decoded message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// Message type.
    pub ty: MessageType,
    /// Sequence id.
    pub id: SequenceNumber,
    /// Payload without header.
    pub payload: Bytes,
    /// Number of bytes the message occupied on the wire.
    pub wire_len: usize,
}

impl Frame {
    /// Returns the acknowledged id of an ack.
    pub fn ack_id(&self) -> Option<SequenceNumber> {
        if self.ty != MessageType::Ack || self.payload.len() < 4 {
            return None;
        }
        Some(BigEndian::read_u32(&self.payload[..4]))
    }
}

/// Encodes a message for `protocol`.
///
/// The payload must not exceed `MAX_PAYLOAD_LEN`.
pub fn encode(protocol: Protocol, ty: MessageType, id: SequenceNumber, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
    let header_len = match protocol {
        Protocol::Udp => UDP_HEADER_LEN,
        Protocol::Tcp => TCP_HEADER_LEN,
    };
    let len = header_len + payload.len();
    let mut bytes = BytesMut::with_capacity(len);
    if protocol == Protocol::Tcp {
        bytes.put_u16(len as u16);
    }
    bytes.put_u8(ty as u8);
    bytes.put_u32(id);
    bytes.put_slice(payload);
    bytes.freeze()
}

/// Encodes the payload of an ack.
pub fn ack_payload(id: SequenceNumber) -> [u8; 4] {
    let mut payload = [0; 4];
    BigEndian::write_u32(&mut payload, id);
    payload
}

/// Decodes a complete message.
///
/// For streams `bytes` has to start with the length prefix and contain
/// exactly the number of bytes it announces.
pub fn decode(protocol: Protocol, bytes: &[u8]) -> Result<Frame, ProtocolError> {
    match protocol {
        Protocol::Udp => decode_datagram(bytes),
        Protocol::Tcp => {
            if bytes.len() < LENGTH_PREFIX_LEN {
                return Err(ProtocolError::Truncated);
            }
            let len = check_length(BigEndian::read_u16(bytes))?;
            if len != bytes.len() {
                return Err(ProtocolError::BadLength(len as u16));
            }
            parse(Bytes::copy_from_slice(bytes), LENGTH_PREFIX_LEN)
        }
    }
}

/// Decodes a datagram.
pub fn decode_datagram(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    if bytes.len() > MAX_UDP_MESSAGE_LEN {
        return Err(ProtocolError::Oversized(bytes.len()));
    }
    parse(Bytes::copy_from_slice(bytes), 0)
}

fn check_length(len: u16) -> Result<usize, ProtocolError> {
    let len = len as usize;
    if len < TCP_HEADER_LEN || len > MAX_TCP_MESSAGE_LEN {
        return Err(ProtocolError::BadLength(len as u16));
    }
    Ok(len)
}

fn parse(mut bytes: Bytes, offset: usize) -> Result<Frame, ProtocolError> {
    let wire_len = bytes.len();
    if wire_len < offset + UDP_HEADER_LEN {
        return Err(ProtocolError::Truncated);
    }
    let code = bytes[offset];
    let ty = MessageType::from_u8(code).ok_or(ProtocolError::UnknownType(code))?;
    let id = BigEndian::read_u32(&bytes[offset + 1..offset + UDP_HEADER_LEN]);
    let payload = bytes.split_off(offset + UDP_HEADER_LEN);
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::Oversized(payload.len()));
    }
    Ok(Frame {
        ty,
        id,
        payload,
        wire_len,
    })
}

/// Reassembles messages from a byte stream.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: BytesMut,
}

impl StreamDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete message.
    ///
    /// After an error the stream is misaligned and the decoder has to be
    /// cleared.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let len = check_length(BigEndian::read_u16(&self.buf))?;
        if self.buf.len() < len {
            return Ok(None);
        }
        let bytes = self.buf.split_to(len).freeze();
        parse(bytes, LENGTH_PREFIX_LEN).map(Some)
    }

    /// Number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Discards buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_layout() {
        let bytes = encode(Protocol::Udp, MessageType::ClientHandshake, 1, b"Soro");
        assert_eq!(&bytes[..], &[1, 0, 0, 0, 1, b'S', b'o', b'r', b'o']);
        let frame = decode(Protocol::Udp, &bytes).unwrap();
        assert_eq!(frame.ty, MessageType::ClientHandshake);
        assert_eq!(frame.id, 1);
        assert_eq!(&frame.payload[..], b"Soro");
        assert_eq!(frame.wire_len, 9);
    }

    #[test]
    fn test_tcp_layout() {
        let bytes = encode(Protocol::Tcp, MessageType::Heartbeat, 0x0102_0304, &[]);
        assert_eq!(&bytes[..], &[0, 7, 3, 1, 2, 3, 4]);
        let frame = decode(Protocol::Tcp, &bytes).unwrap();
        assert_eq!(frame.ty, MessageType::Heartbeat);
        assert_eq!(frame.id, 0x0102_0304);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_ack() {
        let bytes = encode(Protocol::Udp, MessageType::Ack, 9, &ack_payload(42));
        let frame = decode_datagram(&bytes).unwrap();
        assert_eq!(frame.ack_id(), Some(42));

        let normal = decode_datagram(&encode(Protocol::Udp, MessageType::Normal, 9, b"1234")).unwrap();
        assert_eq!(normal.ack_id(), None);
    }

    #[test]
    fn test_invalid_datagrams() {
        assert_eq!(decode_datagram(&[0, 0, 0]), Err(ProtocolError::Truncated));
        assert_eq!(decode_datagram(&[9, 0, 0, 0, 1]), Err(ProtocolError::UnknownType(9)));
        let oversized = vec![0; MAX_UDP_MESSAGE_LEN + 1];
        assert_eq!(
            decode_datagram(&oversized),
            Err(ProtocolError::Oversized(MAX_UDP_MESSAGE_LEN + 1))
        );
        let largest = vec![0; MAX_UDP_MESSAGE_LEN];
        assert_eq!(decode_datagram(&largest).unwrap().payload.len(), MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_stream_reassembly() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode(Protocol::Tcp, MessageType::Normal, 1, b"hello"));
        stream.extend_from_slice(&encode(Protocol::Tcp, MessageType::Normal, 2, b"world"));

        let mut decoder = StreamDecoder::new();
        for byte in &stream[..10] {
            decoder.extend(&[*byte]);
        }
        let first = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&first.payload[..], b"hello");
        assert_eq!(first.wire_len, 12);
        assert_eq!(decoder.next_frame(), Ok(None));

        decoder.extend(&stream[10..]);
        let second = decoder.next_frame().unwrap().unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(&second.payload[..], b"world");
        assert_eq!(decoder.next_frame(), Ok(None));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_stream_bad_length() {
        let mut decoder = StreamDecoder::new();
        decoder.extend(&[0, 3, 0, 0, 0, 0, 1]);
        assert_eq!(decoder.next_frame(), Err(ProtocolError::BadLength(3)));

        decoder.clear();
        decoder.extend(&[0xff, 0xff]);
        assert_eq!(decoder.next_frame(), Err(ProtocolError::BadLength(0xffff)));

        assert_eq!(decode(Protocol::Tcp, &[0, 8, 0, 0, 0, 0, 1]), Err(ProtocolError::BadLength(8)));
    }
}
