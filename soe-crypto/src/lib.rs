//! SOE Datagram Obfuscation
//!
//! Everything a session datagram goes through between the session layer and
//! the socket: optional zlib compression, XOR chaining with the session key,
//! and a CRC footer seeded with the same key. The session handshake packets
//! travel in the clear.
//!
//! The XOR layer hides payloads from casual inspection only. It is not
//! encryption and offers no confidentiality against an attacker who sees the
//! handshake.

pub mod codec;
pub mod compression;
pub mod crc;
pub mod key;
pub mod obfuscation;

pub use codec::{CodecError, SessionCodec};
pub use key::KeyGenerator;
