//! Session Packet Structures and Serialization
//!
//! Every session datagram starts with a two-byte big-endian opcode whose first
//! byte is zero. A datagram whose first byte is non-zero is a fast-path game
//! message and carries no session header at all. Sequenced packets (data,
//! fragment, ack and out-of-order) follow the opcode with a 16-bit sequence
//! number in network byte order.

use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Size of the opcode header in bytes
pub const OPCODE_SIZE: usize = 2;

/// Size of the header on sequenced packets (opcode + sequence)
pub const SEQUENCED_HEADER_SIZE: usize = 4;

/// Size of the total-length prefix carried by the first fragment
pub const FRAGMENT_TOTAL_SIZE: usize = 4;

/// Marker that opens a multi-data bundle inside a data packet payload
pub const MULTI_DATA_MARKER: [u8; 2] = [0x00, 0x19];

/// Seed size advertised in the session response
pub const SEED_SIZE: u8 = 4;

/// Default datagram size used by the stock client
pub const DEFAULT_MAX_UDP_SIZE: u32 = 496;

/// Session packet opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    SessionRequest = 0x0001,
    SessionResponse = 0x0002,
    MultiPacket = 0x0003,
    Disconnect = 0x0005,
    Ping = 0x0006,
    NetStatusRequest = 0x0007,
    NetStatusResponse = 0x0008,
    DataA = 0x0009,
    DataB = 0x000A,
    FragmentA = 0x000D,
    FragmentB = 0x000E,
    OutOfOrderA = 0x0011,
    OutOfOrderB = 0x0012,
    AckA = 0x0015,
    AckB = 0x0016,
    FatalError = 0x001D,
    FatalErrorReply = 0x001E,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Opcode::SessionRequest),
            0x0002 => Some(Opcode::SessionResponse),
            0x0003 => Some(Opcode::MultiPacket),
            0x0005 => Some(Opcode::Disconnect),
            0x0006 => Some(Opcode::Ping),
            0x0007 => Some(Opcode::NetStatusRequest),
            0x0008 => Some(Opcode::NetStatusResponse),
            0x0009 => Some(Opcode::DataA),
            0x000A => Some(Opcode::DataB),
            0x000D => Some(Opcode::FragmentA),
            0x000E => Some(Opcode::FragmentB),
            0x0011 => Some(Opcode::OutOfOrderA),
            0x0012 => Some(Opcode::OutOfOrderB),
            0x0015 => Some(Opcode::AckA),
            0x0016 => Some(Opcode::AckB),
            0x001D => Some(Opcode::FatalError),
            0x001E => Some(Opcode::FatalErrorReply),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Session setup packets travel without obfuscation or CRC footer
    pub fn is_plaintext(self) -> bool {
        matches!(self, Opcode::SessionRequest | Opcode::SessionResponse)
    }

    /// Peek at the opcode of a raw datagram without decoding it
    ///
    /// Returns `None` for fast-path datagrams and for unknown opcodes.
    pub fn peek(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < OPCODE_SIZE || datagram[0] != 0 {
            return None;
        }
        Opcode::from_u16(u16::from_be_bytes([datagram[0], datagram[1]]))
    }
}

/// Data channel lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Channel {
    /// Ordered game traffic
    #[default]
    A,
    /// Routed / secondary traffic
    B,
}

impl Channel {
    fn data_opcode(self) -> Opcode {
        match self {
            Channel::A => Opcode::DataA,
            Channel::B => Opcode::DataB,
        }
    }

    fn fragment_opcode(self) -> Opcode {
        match self {
            Channel::A => Opcode::FragmentA,
            Channel::B => Opcode::FragmentB,
        }
    }

    fn ack_opcode(self) -> Opcode {
        match self {
            Channel::A => Opcode::AckA,
            Channel::B => Opcode::AckB,
        }
    }

    fn out_of_order_opcode(self) -> Opcode {
        match self {
            Channel::A => Opcode::OutOfOrderA,
            Channel::B => Opcode::OutOfOrderB,
        }
    }
}

/// Client-side network statistics report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetStatusRequest {
    pub client_tick: u16,
    pub last_update: u32,
    pub average_update: u32,
    pub shortest_update: u32,
    pub longest_update: u32,
    pub last_server_update: u32,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl NetStatusRequest {
    const SIZE: usize = 2 + 4 * 5 + 8 * 2;
}

/// Server reply to a statistics report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetStatusResponse {
    pub client_tick: u16,
    pub server_tick: u32,
    pub client_packets_sent: u64,
    pub client_packets_received: u64,
    pub server_packets_sent: u64,
    pub server_packets_received: u64,
}

impl NetStatusResponse {
    const SIZE: usize = 2 + 4 + 8 * 4;
}

/// A decoded session datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPacket {
    SessionRequest {
        crc_length: u32,
        connection_id: u32,
        max_udp_size: u32,
    },
    SessionResponse {
        connection_id: u32,
        crc_seed: u32,
        crc_length: u8,
        use_compression: bool,
        max_udp_size: u32,
    },
    /// Bundle of complete sub-packets, each of which is decoded on its own
    MultiPacket(Vec<Bytes>),
    Disconnect {
        connection_id: u32,
        reason: u16,
    },
    Ping,
    NetStatusRequest(NetStatusRequest),
    NetStatusResponse(NetStatusResponse),
    Data {
        channel: Channel,
        seq: SeqNumber,
        payload: Bytes,
    },
    /// Fragment body; the first fragment of a message starts with its total size
    Fragment {
        channel: Channel,
        seq: SeqNumber,
        payload: Bytes,
    },
    OutOfOrder {
        channel: Channel,
        seq: SeqNumber,
    },
    Ack {
        channel: Channel,
        seq: SeqNumber,
    },
    FatalError,
    FatalErrorReply,
    /// Raw game message sent without a session header
    FastPath(Bytes),
}

impl SessionPacket {
    /// Opcode of this packet, `None` for fast-path messages
    pub fn opcode(&self) -> Option<Opcode> {
        let op = match self {
            SessionPacket::SessionRequest { .. } => Opcode::SessionRequest,
            SessionPacket::SessionResponse { .. } => Opcode::SessionResponse,
            SessionPacket::MultiPacket(_) => Opcode::MultiPacket,
            SessionPacket::Disconnect { .. } => Opcode::Disconnect,
            SessionPacket::Ping => Opcode::Ping,
            SessionPacket::NetStatusRequest(_) => Opcode::NetStatusRequest,
            SessionPacket::NetStatusResponse(_) => Opcode::NetStatusResponse,
            SessionPacket::Data { channel, .. } => channel.data_opcode(),
            SessionPacket::Fragment { channel, .. } => channel.fragment_opcode(),
            SessionPacket::OutOfOrder { channel, .. } => channel.out_of_order_opcode(),
            SessionPacket::Ack { channel, .. } => channel.ack_opcode(),
            SessionPacket::FatalError => Opcode::FatalError,
            SessionPacket::FatalErrorReply => Opcode::FatalErrorReply,
            SessionPacket::FastPath(_) => return None,
        };
        Some(op)
    }

    /// Packet type used in logs and statistics
    pub fn packet_type(&self) -> PacketType {
        match self.opcode() {
            Some(op) => PacketType::Session(op),
            None => PacketType::FastPath,
        }
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        match self {
            SessionPacket::SessionRequest { .. } => OPCODE_SIZE + 12,
            SessionPacket::SessionResponse { .. } => OPCODE_SIZE + 15,
            SessionPacket::MultiPacket(parts) => {
                OPCODE_SIZE
                    + parts
                        .iter()
                        .map(|p| length_prefix_size(p.len()) + p.len())
                        .sum::<usize>()
            }
            SessionPacket::Disconnect { .. } => OPCODE_SIZE + 6,
            SessionPacket::NetStatusRequest(_) => OPCODE_SIZE + NetStatusRequest::SIZE,
            SessionPacket::NetStatusResponse(_) => OPCODE_SIZE + NetStatusResponse::SIZE,
            SessionPacket::Data { payload, .. } | SessionPacket::Fragment { payload, .. } => {
                SEQUENCED_HEADER_SIZE + payload.len()
            }
            SessionPacket::OutOfOrder { .. } | SessionPacket::Ack { .. } => SEQUENCED_HEADER_SIZE,
            SessionPacket::Ping | SessionPacket::FatalError | SessionPacket::FatalErrorReply => {
                OPCODE_SIZE
            }
            SessionPacket::FastPath(data) => data.len(),
        }
    }

    /// Serialize the packet to bytes (network byte order)
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());

        if let Some(op) = self.opcode() {
            buf.put_u16(op.as_u16());
        }

        match self {
            SessionPacket::SessionRequest {
                crc_length,
                connection_id,
                max_udp_size,
            } => {
                buf.put_u32(*crc_length);
                buf.put_u32(*connection_id);
                buf.put_u32(*max_udp_size);
            }
            SessionPacket::SessionResponse {
                connection_id,
                crc_seed,
                crc_length,
                use_compression,
                max_udp_size,
            } => {
                buf.put_u32(*connection_id);
                buf.put_u32(*crc_seed);
                buf.put_u8(*crc_length);
                buf.put_u8(u8::from(*use_compression));
                buf.put_u8(SEED_SIZE);
                buf.put_u32(*max_udp_size);
            }
            SessionPacket::MultiPacket(parts) => {
                for part in parts {
                    put_length(&mut buf, part.len());
                    buf.put_slice(part);
                }
            }
            SessionPacket::Disconnect {
                connection_id,
                reason,
            } => {
                buf.put_u32(*connection_id);
                buf.put_u16(*reason);
            }
            SessionPacket::NetStatusRequest(req) => {
                buf.put_u16(req.client_tick);
                buf.put_u32(req.last_update);
                buf.put_u32(req.average_update);
                buf.put_u32(req.shortest_update);
                buf.put_u32(req.longest_update);
                buf.put_u32(req.last_server_update);
                buf.put_u64(req.packets_sent);
                buf.put_u64(req.packets_received);
            }
            SessionPacket::NetStatusResponse(resp) => {
                buf.put_u16(resp.client_tick);
                buf.put_u32(resp.server_tick);
                buf.put_u64(resp.client_packets_sent);
                buf.put_u64(resp.client_packets_received);
                buf.put_u64(resp.server_packets_sent);
                buf.put_u64(resp.server_packets_received);
            }
            SessionPacket::Data { seq, payload, .. }
            | SessionPacket::Fragment { seq, payload, .. } => {
                buf.put_u16(seq.as_raw());
                buf.put_slice(payload);
            }
            SessionPacket::OutOfOrder { seq, .. } | SessionPacket::Ack { seq, .. } => {
                buf.put_u16(seq.as_raw());
            }
            SessionPacket::FastPath(data) => buf.put_slice(data),
            SessionPacket::Ping | SessionPacket::FatalError | SessionPacket::FatalErrorReply => {}
        }

        buf
    }

    /// Parse a packet from a decoded (plaintext) datagram
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.is_empty() {
            return Err(PacketError::InsufficientData {
                expected: 1,
                actual: 0,
            });
        }

        if bytes[0] != 0 {
            return Ok(SessionPacket::FastPath(Bytes::copy_from_slice(bytes)));
        }

        require(bytes, OPCODE_SIZE)?;
        let raw = u16::from_be_bytes([bytes[0], bytes[1]]);
        let opcode = Opcode::from_u16(raw).ok_or(PacketError::UnknownOpcode(raw))?;
        let mut body = &bytes[OPCODE_SIZE..];

        let packet = match opcode {
            Opcode::SessionRequest => {
                require(body, 12)?;
                SessionPacket::SessionRequest {
                    crc_length: body.get_u32(),
                    connection_id: body.get_u32(),
                    max_udp_size: body.get_u32(),
                }
            }
            Opcode::SessionResponse => {
                require(body, 15)?;
                let connection_id = body.get_u32();
                let crc_seed = body.get_u32();
                let crc_length = body.get_u8();
                let use_compression = body.get_u8() != 0;
                let seed_size = body.get_u8();
                if seed_size != SEED_SIZE {
                    return Err(PacketError::Malformed("unsupported seed size"));
                }
                SessionPacket::SessionResponse {
                    connection_id,
                    crc_seed,
                    crc_length,
                    use_compression,
                    max_udp_size: body.get_u32(),
                }
            }
            Opcode::MultiPacket => {
                let shared = Bytes::copy_from_slice(body);
                let parts = split_length_prefixed(&shared)?;
                if parts.is_empty() {
                    return Err(PacketError::Malformed("empty multi-packet"));
                }
                SessionPacket::MultiPacket(parts)
            }
            Opcode::Disconnect => {
                require(body, 6)?;
                SessionPacket::Disconnect {
                    connection_id: body.get_u32(),
                    reason: body.get_u16(),
                }
            }
            Opcode::Ping => SessionPacket::Ping,
            Opcode::NetStatusRequest => {
                require(body, NetStatusRequest::SIZE)?;
                SessionPacket::NetStatusRequest(NetStatusRequest {
                    client_tick: body.get_u16(),
                    last_update: body.get_u32(),
                    average_update: body.get_u32(),
                    shortest_update: body.get_u32(),
                    longest_update: body.get_u32(),
                    last_server_update: body.get_u32(),
                    packets_sent: body.get_u64(),
                    packets_received: body.get_u64(),
                })
            }
            Opcode::NetStatusResponse => {
                require(body, NetStatusResponse::SIZE)?;
                SessionPacket::NetStatusResponse(NetStatusResponse {
                    client_tick: body.get_u16(),
                    server_tick: body.get_u32(),
                    client_packets_sent: body.get_u64(),
                    client_packets_received: body.get_u64(),
                    server_packets_sent: body.get_u64(),
                    server_packets_received: body.get_u64(),
                })
            }
            Opcode::DataA | Opcode::DataB | Opcode::FragmentA | Opcode::FragmentB => {
                require(body, 2)?;
                let seq = SeqNumber::new(body.get_u16());
                let channel = if matches!(opcode, Opcode::DataA | Opcode::FragmentA) {
                    Channel::A
                } else {
                    Channel::B
                };
                if body.is_empty() {
                    return Err(PacketError::Malformed("sequenced packet without payload"));
                }
                let payload = Bytes::copy_from_slice(body);
                if matches!(opcode, Opcode::DataA | Opcode::DataB) {
                    SessionPacket::Data {
                        channel,
                        seq,
                        payload,
                    }
                } else {
                    SessionPacket::Fragment {
                        channel,
                        seq,
                        payload,
                    }
                }
            }
            Opcode::OutOfOrderA | Opcode::OutOfOrderB => {
                require(body, 2)?;
                SessionPacket::OutOfOrder {
                    channel: if opcode == Opcode::OutOfOrderA {
                        Channel::A
                    } else {
                        Channel::B
                    },
                    seq: SeqNumber::new(body.get_u16()),
                }
            }
            Opcode::AckA | Opcode::AckB => {
                require(body, 2)?;
                SessionPacket::Ack {
                    channel: if opcode == Opcode::AckA {
                        Channel::A
                    } else {
                        Channel::B
                    },
                    seq: SeqNumber::new(body.get_u16()),
                }
            }
            Opcode::FatalError => SessionPacket::FatalError,
            Opcode::FatalErrorReply => SessionPacket::FatalErrorReply,
        };

        Ok(packet)
    }
}

/// Packet type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Session(Opcode),
    FastPath,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Session(op) => write!(f, "{:?}", op),
            PacketType::FastPath => write!(f, "FastPath"),
        }
    }
}

/// Number of bytes the length prefix for `len` occupies
pub fn length_prefix_size(len: usize) -> usize {
    if len < 0xFF {
        1
    } else if len < 0xFFFF {
        3
    } else {
        7
    }
}

/// Write a variable-width length prefix
pub fn put_length(buf: &mut impl BufMut, len: usize) {
    if len < 0xFF {
        buf.put_u8(len as u8);
    } else if len < 0xFFFF {
        buf.put_u8(0xFF);
        buf.put_u16(len as u16);
    } else {
        buf.put_slice(&[0xFF, 0xFF, 0xFF]);
        buf.put_u32(len as u32);
    }
}

/// Read a variable-width length prefix
pub fn get_length(buf: &mut impl Buf) -> Result<usize, PacketError> {
    require_buf(&*buf, 1)?;
    let first = buf.get_u8();
    if first < 0xFF {
        return Ok(first as usize);
    }
    require_buf(&*buf, 2)?;
    let wide = buf.get_u16();
    if wide < 0xFFFF {
        return Ok(wide as usize);
    }
    require_buf(&*buf, 4)?;
    Ok(buf.get_u32() as usize)
}

/// Split a buffer of length-prefixed entries into zero-copy slices
pub fn split_length_prefixed(data: &Bytes) -> Result<Vec<Bytes>, PacketError> {
    let mut parts = Vec::new();
    let mut cursor = &data[..];

    while cursor.has_remaining() {
        let len = get_length(&mut cursor)?;
        if len == 0 {
            return Err(PacketError::Malformed("zero-length entry"));
        }
        if cursor.len() < len {
            return Err(PacketError::InsufficientData {
                expected: len,
                actual: cursor.len(),
            });
        }
        let start = data.len() - cursor.len();
        parts.push(data.slice(start..start + len));
        cursor.advance(len);
    }

    Ok(parts)
}

fn require(bytes: &[u8], needed: usize) -> Result<(), PacketError> {
    if bytes.len() < needed {
        return Err(PacketError::InsufficientData {
            expected: needed,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn require_buf(buf: &impl Buf, needed: usize) -> Result<(), PacketError> {
    if buf.remaining() < needed {
        return Err(PacketError::InsufficientData {
            expected: needed,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

/// Packet parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    #[error("Malformed packet: {0}")]
    Malformed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_table() {
        assert_eq!(Opcode::from_u16(0x0009), Some(Opcode::DataA));
        assert_eq!(Opcode::from_u16(0x0004), None);
        assert!(Opcode::SessionRequest.is_plaintext());
        assert!(!Opcode::AckA.is_plaintext());
    }

    #[test]
    fn test_session_request_layout() {
        let packet = SessionPacket::SessionRequest {
            crc_length: 2,
            connection_id: 0xDEADBEEF,
            max_udp_size: 496,
        };
        let bytes = packet.to_bytes();

        assert_eq!(
            &bytes[..],
            &[0x00, 0x01, 0, 0, 0, 2, 0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0x01, 0xF0]
        );
        assert_eq!(SessionPacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_data_packet_layout() {
        let packet = SessionPacket::Data {
            channel: Channel::A,
            seq: SeqNumber::new(0x0102),
            payload: Bytes::from_static(b"hi"),
        };
        let bytes = packet.to_bytes();

        assert_eq!(&bytes[..], &[0x00, 0x09, 0x01, 0x02, b'h', b'i']);
        assert_eq!(bytes.len(), packet.size());
    }

    #[test]
    fn test_channel_b_opcodes() {
        let ack = SessionPacket::Ack {
            channel: Channel::B,
            seq: SeqNumber::new(7),
        };
        assert_eq!(&ack.to_bytes()[..2], &[0x00, 0x16]);

        let frag = SessionPacket::Fragment {
            channel: Channel::B,
            seq: SeqNumber::new(1),
            payload: Bytes::from_static(&[1]),
        };
        assert_eq!(&frag.to_bytes()[..2], &[0x00, 0x0E]);
    }

    #[test]
    fn test_fast_path_detection() {
        let packet = SessionPacket::from_bytes(&[0x05, 0x00, 0xAA]).unwrap();
        assert_eq!(
            packet,
            SessionPacket::FastPath(Bytes::from_static(&[0x05, 0x00, 0xAA]))
        );
        assert_eq!(packet.opcode(), None);
        assert_eq!(Opcode::peek(&[0x05, 0x00]), None);
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(
            SessionPacket::from_bytes(&[0x00, 0x42]),
            Err(PacketError::UnknownOpcode(0x42))
        );
    }

    #[test]
    fn test_truncated_packets_rejected() {
        assert!(SessionPacket::from_bytes(&[0x00]).is_err());
        assert!(SessionPacket::from_bytes(&[0x00, 0x15, 0x01]).is_err());
        assert!(SessionPacket::from_bytes(&[0x00, 0x09, 0x00, 0x01]).is_err());
        assert!(SessionPacket::from_bytes(&[0x00, 0x01, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_multi_packet_split() {
        let ack = SessionPacket::Ack {
            channel: Channel::A,
            seq: SeqNumber::new(3),
        }
        .to_bytes()
        .freeze();
        let ping = SessionPacket::Ping.to_bytes().freeze();
        let multi = SessionPacket::MultiPacket(vec![ack.clone(), ping.clone()]);

        let bytes = multi.to_bytes();
        assert_eq!(bytes.len(), multi.size());

        match SessionPacket::from_bytes(&bytes).unwrap() {
            SessionPacket::MultiPacket(parts) => assert_eq!(parts, vec![ack, ping]),
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_length_prefix_widths() {
        for len in [0usize, 0xFE, 0xFF, 0x1234, 0xFFFE, 0xFFFF, 0x12345] {
            let mut buf = BytesMut::new();
            put_length(&mut buf, len);
            assert_eq!(buf.len(), length_prefix_size(len));
            let mut cursor = &buf[..];
            assert_eq!(get_length(&mut cursor).unwrap(), len);
        }
    }

    #[test]
    fn test_split_rejects_overrun() {
        let data = Bytes::from_static(&[5, 1, 2]);
        assert!(split_length_prefixed(&data).is_err());
    }

    #[test]
    fn test_net_status_roundtrip() {
        let req = SessionPacket::NetStatusRequest(NetStatusRequest {
            client_tick: 9,
            last_update: 10,
            average_update: 11,
            shortest_update: 12,
            longest_update: 13,
            last_server_update: 14,
            packets_sent: 15,
            packets_received: 16,
        });
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), req.size());
        assert_eq!(SessionPacket::from_bytes(&bytes).unwrap(), req);
    }
}
