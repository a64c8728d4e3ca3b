//! Fragmentation, coalescing and reassembly
//!
//! Outgoing messages are turned into sequenced data-channel payloads here.
//! A message that fits the payload budget travels whole, and consecutive
//! small messages on the same channel are coalesced into one multi-data
//! bundle until the next message would overflow the budget. Anything larger
//! is split into fragments: the first carries the total message size, the
//! rest carry only their chunk.
//!
//! The [`Reassembler`] runs on the receive side after the ordering layer, so
//! fragments reach it in sequence order. Any break in that order is treated as
//! a protocol violation and the partial message is discarded.

use crate::message::{Message, MessageQueue};
use crate::packet::{
    length_prefix_size, put_length, split_length_prefixed, Channel, PacketError, SessionPacket,
    FRAGMENT_TOTAL_SIZE, MULTI_DATA_MARKER,
};
use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Position of a packet within its message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentMarker {
    /// Complete message (or bundle of messages) in one packet
    Whole,
    First,
    Middle,
    Last,
}

/// A sequenced packet produced by the packetizer, ready for the send window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPacket {
    pub seq: SeqNumber,
    pub channel: Channel,
    pub marker: FragmentMarker,
    /// Messages carried (1 for fragments, >= 1 for whole packets)
    pub message_count: usize,
    /// Encoded session packet
    pub data: Bytes,
}

/// Splits and coalesces outgoing reliable messages
#[derive(Debug, Clone, Copy)]
pub struct Packetizer {
    /// Bytes available after the opcode and sequence header
    max_payload: usize,
}

impl Packetizer {
    /// Create a packetizer for a given payload budget
    ///
    /// The budget excludes the four-byte opcode/sequence header and must leave
    /// room for at least one byte after the first fragment's size prefix.
    pub fn new(max_payload: usize) -> Self {
        Packetizer {
            max_payload: max_payload.max(FRAGMENT_TOTAL_SIZE + 1),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Payload size of a single message sent whole
    fn whole_size(data: &[u8]) -> usize {
        if data.starts_with(&MULTI_DATA_MARKER) {
            // Must be wrapped in a one-entry bundle to stay unambiguous
            MULTI_DATA_MARKER.len() + length_prefix_size(data.len()) + data.len()
        } else {
            data.len()
        }
    }

    /// Whether a message fits one packet without fragmenting
    pub fn fits_whole(&self, data: &[u8]) -> bool {
        Self::whole_size(data) <= self.max_payload
    }

    /// Build the packets for one message: whole if it fits, fragments otherwise
    pub fn build_outgoing_reliable_packets(
        &self,
        message: &Message,
        channel: Channel,
        next_seq: &mut SeqNumber,
    ) -> Vec<BuiltPacket> {
        let data = message.data();

        if self.fits_whole(data) {
            let payload = if data.starts_with(&MULTI_DATA_MARKER) {
                bundle(&[data])
            } else {
                Bytes::copy_from_slice(data)
            };
            return vec![self.data_packet(channel, payload, 1, next_seq)];
        }

        self.fragment(data, channel, next_seq)
    }

    /// Build one multi-data packet from several small messages
    ///
    /// Callers must have checked the combined size with [`Packetizer::bundle_size`].
    pub fn build_multi_data_packet(
        &self,
        messages: &[Message],
        channel: Channel,
        next_seq: &mut SeqNumber,
    ) -> BuiltPacket {
        let parts: Vec<&[u8]> = messages.iter().map(Message::data).collect();
        self.data_packet(channel, bundle(&parts), messages.len(), next_seq)
    }

    /// Payload size of a bundle holding `lengths`
    pub fn bundle_size(lengths: impl IntoIterator<Item = usize>) -> usize {
        MULTI_DATA_MARKER.len()
            + lengths
                .into_iter()
                .map(|len| length_prefix_size(len) + len)
                .sum::<usize>()
    }

    /// Drain one packetizing unit from `queue`
    ///
    /// A unit is a single fast-path or oversized message, or a run of small
    /// messages on the same channel coalesced into one packet. Returns the
    /// packets built, empty when the queue is empty.
    pub fn build_from_queue(
        &self,
        queue: &mut MessageQueue,
        next_seq: &mut SeqNumber,
    ) -> Vec<BuiltPacket> {
        let first = match queue.pop() {
            Some(message) => message,
            None => return Vec::new(),
        };
        let channel = first.channel();

        if first.fast_path() || !self.fits_whole(first.data()) {
            return self.build_outgoing_reliable_packets(&first, channel, next_seq);
        }

        let mut batch = vec![first];
        let mut lengths = vec![batch[0].len()];

        while let Some(next) = queue.peek() {
            if next.fast_path() || next.channel() != channel {
                break;
            }
            lengths.push(next.len());
            if Self::bundle_size(lengths.iter().copied()) > self.max_payload {
                // Coalescing stops at the first message that would overflow
                lengths.pop();
                break;
            }
            if let Some(message) = queue.pop() {
                batch.push(message);
            }
        }

        if batch.len() == 1 {
            self.build_outgoing_reliable_packets(&batch[0], channel, next_seq)
        } else {
            tracing::trace!(
                "Coalescing {} messages into one multi-data packet",
                batch.len()
            );
            vec![self.build_multi_data_packet(&batch, channel, next_seq)]
        }
    }

    fn fragment(&self, data: &[u8], channel: Channel, next_seq: &mut SeqNumber) -> Vec<BuiltPacket> {
        let first_chunk = self.max_payload - FRAGMENT_TOTAL_SIZE;
        let rest = data.len().saturating_sub(first_chunk);
        let count = 1 + (rest + self.max_payload - 1) / self.max_payload;

        tracing::trace!(
            "Fragmenting {} byte message into {} fragments",
            data.len(),
            count
        );

        let mut packets = Vec::with_capacity(count);
        let mut offset = 0;

        while offset < data.len() {
            let is_first = offset == 0;
            let chunk_len = if is_first { first_chunk } else { self.max_payload };
            let end = (offset + chunk_len).min(data.len());

            let mut payload = BytesMut::with_capacity(chunk_len + FRAGMENT_TOTAL_SIZE);
            if is_first {
                payload.put_u32(data.len() as u32);
            }
            payload.put_slice(&data[offset..end]);

            let marker = if is_first {
                FragmentMarker::First
            } else if end == data.len() {
                FragmentMarker::Last
            } else {
                FragmentMarker::Middle
            };

            let seq = take_seq(next_seq);
            let packet = SessionPacket::Fragment {
                channel,
                seq,
                payload: payload.freeze(),
            };
            packets.push(BuiltPacket {
                seq,
                channel,
                marker,
                message_count: 1,
                data: packet.to_bytes().freeze(),
            });
            offset = end;
        }

        packets
    }

    fn data_packet(
        &self,
        channel: Channel,
        payload: Bytes,
        message_count: usize,
        next_seq: &mut SeqNumber,
    ) -> BuiltPacket {
        let seq = take_seq(next_seq);
        let packet = SessionPacket::Data {
            channel,
            seq,
            payload,
        };
        BuiltPacket {
            seq,
            channel,
            marker: FragmentMarker::Whole,
            message_count,
            data: packet.to_bytes().freeze(),
        }
    }
}

fn take_seq(next_seq: &mut SeqNumber) -> SeqNumber {
    let seq = *next_seq;
    next_seq.increment();
    seq
}

fn bundle(parts: &[&[u8]]) -> Bytes {
    let mut buf = BytesMut::with_capacity(Packetizer::bundle_size(parts.iter().map(|p| p.len())));
    buf.put_slice(&MULTI_DATA_MARKER);
    for part in parts {
        put_length(&mut buf, part.len());
        buf.put_slice(part);
    }
    buf.freeze()
}

/// Split a data-channel payload into the messages it carries
pub fn unpack_data_payload(payload: &Bytes) -> Result<Vec<Bytes>, PacketError> {
    if payload.starts_with(&MULTI_DATA_MARKER) {
        let parts = split_length_prefixed(&payload.slice(MULTI_DATA_MARKER.len()..))?;
        if parts.is_empty() {
            return Err(PacketError::Malformed("empty multi-data bundle"));
        }
        Ok(parts)
    } else {
        Ok(vec![payload.clone()])
    }
}

/// Reasons a reassembly is abandoned
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("First fragment too short to carry the total size")]
    MissingTotal,

    #[error("Declared message size {0} is invalid")]
    InvalidTotal(usize),

    #[error("Fragment sequence gap: expected {expected}, got {actual}")]
    SequenceGap {
        expected: SeqNumber,
        actual: SeqNumber,
    },

    #[error("Fragments overflow declared size: {received} of {total} bytes")]
    Overflow { total: usize, received: usize },

    #[error("Fragment arrived on channel {actual:?} while reassembling on {expected:?}")]
    ChannelMismatch { expected: Channel, actual: Channel },

    #[error("Reassembly interrupted by unfragmented data")]
    Interrupted,
}

#[derive(Debug)]
struct PartialMessage {
    channel: Channel,
    start_seq: SeqNumber,
    next_seq: SeqNumber,
    total: usize,
    data: BytesMut,
}

/// Incoming fragment accumulator
#[derive(Debug)]
pub struct Reassembler {
    in_progress: Option<PartialMessage>,
    max_message_size: usize,
}

impl Reassembler {
    /// Create a reassembler rejecting messages larger than `max_message_size`
    pub fn new(max_message_size: usize) -> Self {
        Reassembler {
            in_progress: None,
            max_message_size,
        }
    }

    /// Whether a message is partially assembled
    pub fn in_progress(&self) -> bool {
        self.in_progress.is_some()
    }

    /// Bytes accumulated so far against the declared total
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.in_progress.as_ref().map(|p| (p.data.len(), p.total))
    }

    /// Feed one in-order fragment
    ///
    /// Returns the completed message when the last fragment arrives. On error
    /// the partial message has already been discarded.
    pub fn process_fragmented_packet(
        &mut self,
        channel: Channel,
        seq: SeqNumber,
        payload: &[u8],
    ) -> Result<Option<Bytes>, ReassemblyError> {
        match self.in_progress.take() {
            None => self.start(channel, seq, payload),
            Some(mut partial) => {
                if partial.channel != channel {
                    return Err(ReassemblyError::ChannelMismatch {
                        expected: partial.channel,
                        actual: channel,
                    });
                }
                if seq != partial.next_seq {
                    return Err(ReassemblyError::SequenceGap {
                        expected: partial.next_seq,
                        actual: seq,
                    });
                }
                partial.data.put_slice(payload);
                partial.next_seq = seq.next();
                self.settle(partial)
            }
        }
    }

    /// Abandon any partial message because unfragmented data arrived
    pub fn interrupt(&mut self) -> Option<ReassemblyError> {
        self.in_progress.take().map(|_| ReassemblyError::Interrupted)
    }

    /// Drop any partial message
    pub fn reset(&mut self) {
        self.in_progress = None;
    }

    fn start(
        &mut self,
        channel: Channel,
        seq: SeqNumber,
        mut payload: &[u8],
    ) -> Result<Option<Bytes>, ReassemblyError> {
        if payload.len() < FRAGMENT_TOTAL_SIZE {
            return Err(ReassemblyError::MissingTotal);
        }
        let total = payload.get_u32() as usize;
        if total == 0 || total > self.max_message_size {
            return Err(ReassemblyError::InvalidTotal(total));
        }

        let mut data = BytesMut::with_capacity(total);
        data.put_slice(payload);

        self.settle(PartialMessage {
            channel,
            start_seq: seq,
            next_seq: seq.next(),
            total,
            data,
        })
    }

    fn settle(&mut self, partial: PartialMessage) -> Result<Option<Bytes>, ReassemblyError> {
        let received = partial.data.len();
        if received > partial.total {
            return Err(ReassemblyError::Overflow {
                total: partial.total,
                received,
            });
        }
        if received == partial.total {
            tracing::trace!(
                "Reassembled {} byte message starting at seq {}",
                received,
                partial.start_seq
            );
            return Ok(Some(partial.data.freeze()));
        }
        self.in_progress = Some(partial);
        Ok(None)
    }
}
