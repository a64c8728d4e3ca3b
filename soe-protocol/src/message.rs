//! Application messages
//!
//! A [`Message`] is the logical unit exchanged with the game layer: an
//! arbitrary-length byte buffer with a read cursor, a priority tier and a
//! fast-path flag. Game payloads are little-endian, unlike the session
//! headers that wrap them.

use crate::packet::Channel;
use bytes::{Buf, BufMut, Bytes};
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;

/// Message errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Read past end of message: needed {needed} bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },

    #[error("String is not valid UTF-8")]
    InvalidString,

    #[error("String of {0} bytes exceeds the u16 length prefix")]
    StringTooLong(usize),
}

/// Delivery priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl Priority {
    /// Number of priority tiers
    pub const TIERS: usize = 3;

    fn index(self) -> usize {
        self as usize
    }
}

/// Application-level message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    data: Vec<u8>,
    cursor: usize,
    priority: Priority,
    fast_path: bool,
    channel: Channel,
}

impl Message {
    /// Create an empty message
    pub fn new() -> Self {
        Message::default()
    }

    /// Create a message that owns `data`
    pub fn from_vec(data: Vec<u8>) -> Self {
        Message {
            data,
            ..Message::default()
        }
    }

    /// Create a message from a byte slice
    pub fn from_slice(data: &[u8]) -> Self {
        Message::from_vec(data.to_vec())
    }

    fn with_buffer(mut data: Vec<u8>) -> Self {
        data.clear();
        Message::from_vec(data)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_fast_path(mut self, fast_path: bool) -> Self {
        self.fast_path = fast_path;
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn fast_path(&self) -> bool {
        self.fast_path
    }

    pub fn set_fast_path(&mut self, fast_path: bool) {
        self.fast_path = fast_path;
    }

    /// Channel the message arrived on or will be sent on
    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn set_channel(&mut self, channel: Channel) {
        self.channel = channel;
    }

    /// Full message contents, independent of the read cursor
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left between the read cursor and the end
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Current read cursor position
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Move the read cursor back to the start
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Consume the message, returning its buffer
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Copy the contents into a shared buffer
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.data.put_u8(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.data.put_u16_le(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.data.put_u32_le(value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.data.put_u64_le(value);
        self
    }

    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.data.put_f32_le(value);
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.put_slice(bytes);
        self
    }

    /// Write a string as a u16 length followed by its bytes
    ///
    /// Nothing is written when the string does not fit the prefix.
    pub fn write_string(&mut self, value: &str) -> Result<&mut Self, MessageError> {
        let len =
            u16::try_from(value.len()).map_err(|_| MessageError::StringTooLong(value.len()))?;
        self.write_u16(len);
        Ok(self.write_bytes(value.as_bytes()))
    }

    fn reader(&mut self, needed: usize) -> Result<&[u8], MessageError> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(MessageError::Underflow { needed, remaining });
        }
        let start = self.cursor;
        self.cursor += needed;
        Ok(&self.data[start..start + needed])
    }

    pub fn read_u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.reader(1)?.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, MessageError> {
        Ok(self.reader(2)?.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, MessageError> {
        Ok(self.reader(4)?.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, MessageError> {
        Ok(self.reader(8)?.get_u64_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, MessageError> {
        Ok(self.reader(4)?.get_f32_le())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, MessageError> {
        Ok(self.reader(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String, MessageError> {
        let len = self.read_u16()? as usize;
        let raw = self.reader(len)?.to_vec();
        String::from_utf8(raw).map_err(|_| MessageError::InvalidString)
    }
}

/// Pooling allocator for message buffers
///
/// Sessions allocate incoming messages from the factory and the game layer
/// hands them back through `Session::destroy_incoming_message`. Pooling only
/// saves allocations; messages that are simply dropped are freed normally.
pub struct MessageFactory {
    pool: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
    max_buffer_capacity: usize,
}

impl MessageFactory {
    /// Create a new factory keeping at most `max_pooled` spare buffers
    pub fn new(max_pooled: usize) -> Self {
        MessageFactory {
            pool: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            max_buffer_capacity: 64 * 1024,
        }
    }

    /// Take an empty message with at least `capacity` bytes reserved
    pub fn create(&self, capacity: usize) -> Message {
        let buffer = self.pool.lock().pop();
        let mut message = match buffer {
            Some(buffer) => Message::with_buffer(buffer),
            None => Message::from_vec(Vec::new()),
        };
        message.data.reserve(capacity);
        message
    }

    /// Build a message holding a copy of `data`
    pub fn create_from(&self, data: &[u8]) -> Message {
        let mut message = self.create(data.len());
        message.write_bytes(data);
        message
    }

    /// Return a message's buffer to the pool
    pub fn recycle(&self, message: Message) {
        let buffer = message.into_vec();
        if buffer.capacity() > self.max_buffer_capacity {
            return;
        }
        let mut pool = self.pool.lock();
        if pool.len() < self.max_pooled {
            pool.push(buffer);
        }
    }

    /// Number of spare buffers currently pooled
    pub fn pooled(&self) -> usize {
        self.pool.lock().len()
    }
}

impl Default for MessageFactory {
    fn default() -> Self {
        Self::new(256)
    }
}

/// FIFO of messages with one lane per priority tier
///
/// Higher tiers drain first; order within a tier is insertion order.
#[derive(Debug, Default)]
pub struct MessageQueue {
    tiers: [VecDeque<Message>; Priority::TIERS],
}

impl MessageQueue {
    pub fn new() -> Self {
        MessageQueue::default()
    }

    pub fn push(&mut self, message: Message) {
        self.tiers[message.priority().index()].push_back(message);
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.tiers.iter_mut().rev().find_map(|tier| tier.pop_front())
    }

    pub fn peek(&self) -> Option<&Message> {
        self.tiers.iter().rev().find_map(|tier| tier.front())
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    /// Drop every queued message, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        let count = self.len();
        for tier in &mut self.tiers {
            tier.clear();
        }
        count
    }
}
