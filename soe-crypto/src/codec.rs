//! Session datagram codec
//!
//! Encoding order: compress the body (optional), XOR it with the session
//! key, append the CRC footer over header and body. Decoding reverses it.
//! The header stays readable: two bytes for opcode packets, one byte for
//! fast-path messages.

use crate::compression;
use crate::crc::{self, MAX_CRC_LENGTH};
use crate::obfuscation;
use bytes::Bytes;
use thiserror::Error;

/// Opcodes exchanged before a key exists
const SESSION_REQUEST: u16 = 0x0001;
const SESSION_RESPONSE: u16 = 0x0002;

/// Largest body accepted from decompression
const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Datagram too short: need {needed} bytes, have {actual}")]
    TooShort { needed: usize, actual: usize },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Invalid compression flag {0}")]
    InvalidCompressionFlag(u8),

    #[error("Decompressed body exceeds {0} bytes")]
    DecompressedTooLarge(usize),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Invalid CRC length {0}")]
    InvalidCrcLength(u8),

    #[error("Failed to generate random key material")]
    KeyGeneration,
}

/// Encoder/decoder for one session's datagrams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCodec {
    key: u32,
    crc_length: u8,
    use_compression: bool,
}

impl SessionCodec {
    pub fn new(key: u32, crc_length: u8, use_compression: bool) -> Result<Self, CodecError> {
        if crc_length > MAX_CRC_LENGTH {
            return Err(CodecError::InvalidCrcLength(crc_length));
        }
        Ok(SessionCodec {
            key,
            crc_length,
            use_compression,
        })
    }

    /// Pass-through codec used before the handshake completes
    pub fn plaintext() -> Self {
        SessionCodec {
            key: 0,
            crc_length: 0,
            use_compression: false,
        }
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn crc_length(&self) -> u8 {
        self.crc_length
    }

    pub fn use_compression(&self) -> bool {
        self.use_compression
    }

    /// Bytes the codec may add to a packet
    pub fn overhead(&self) -> usize {
        self.crc_length as usize + usize::from(self.use_compression)
    }

    /// Whether a datagram is a handshake packet that travels in the clear
    pub fn is_plaintext(datagram: &[u8]) -> bool {
        match datagram {
            [0, op, ..] => matches!(*op as u16, SESSION_REQUEST | SESSION_RESPONSE),
            _ => false,
        }
    }

    fn header_len(datagram: &[u8]) -> usize {
        if datagram.first() == Some(&0) {
            2
        } else {
            1
        }
    }

    /// Encode one outgoing packet
    pub fn encode(&self, packet: &[u8]) -> Result<Bytes, CodecError> {
        if Self::is_plaintext(packet) {
            return Ok(Bytes::copy_from_slice(packet));
        }

        let header_len = Self::header_len(packet);
        if packet.len() < header_len {
            return Err(CodecError::TooShort {
                needed: header_len,
                actual: packet.len(),
            });
        }
        let (header, body) = packet.split_at(header_len);

        let mut body = if self.use_compression {
            compression::compress(body)?
        } else {
            body.to_vec()
        };
        obfuscation::encrypt(&mut body, self.key);

        let mut out = Vec::with_capacity(header_len + body.len() + self.crc_length as usize);
        out.extend_from_slice(header);
        out.extend_from_slice(&body);
        crc::append_crc(&mut out, self.key, self.crc_length);

        tracing::trace!("Encoded {} byte packet into {} bytes", packet.len(), out.len());
        Ok(Bytes::from(out))
    }

    /// Decode one incoming datagram
    pub fn decode(&self, datagram: &[u8]) -> Result<Bytes, CodecError> {
        if Self::is_plaintext(datagram) {
            return Ok(Bytes::copy_from_slice(datagram));
        }

        let packet = crc::validate_and_strip_crc(datagram, self.key, self.crc_length)?;
        let header_len = Self::header_len(packet);
        if packet.len() < header_len {
            return Err(CodecError::TooShort {
                needed: header_len,
                actual: packet.len(),
            });
        }
        let (header, body) = packet.split_at(header_len);

        let mut body = body.to_vec();
        obfuscation::decrypt(&mut body, self.key);
        if self.use_compression {
            body = compression::decompress(&body, MAX_DECOMPRESSED_SIZE)?;
        }

        let mut out = Vec::with_capacity(header_len + body.len());
        out.extend_from_slice(header);
        out.extend_from_slice(&body);
        Ok(Bytes::from(out))
    }
}
