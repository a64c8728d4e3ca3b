//! zlib body compression
//!
//! A compressed body carries a trailing flag byte: 1 when the bytes before it
//! are zlib data, 0 when compression did not help and they are raw.

use crate::codec::CodecError;
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use std::io::{Read, Write};

const FLAG_RAW: u8 = 0;
const FLAG_COMPRESSED: u8 = 1;

/// Compress `body`, appending the flag byte
pub fn compress(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len()), Compression::default());
    encoder.write_all(body)?;
    let mut compressed = encoder.finish()?;

    // Only use compression if it actually reduces size
    if compressed.len() < body.len() {
        compressed.push(FLAG_COMPRESSED);
        Ok(compressed)
    } else {
        let mut raw = Vec::with_capacity(body.len() + 1);
        raw.extend_from_slice(body);
        raw.push(FLAG_RAW);
        Ok(raw)
    }
}

/// Undo [`compress`], refusing output larger than `max_size`
pub fn decompress(data: &[u8], max_size: usize) -> Result<Vec<u8>, CodecError> {
    let (flag, body) = match data.split_last() {
        Some((flag, body)) => (*flag, body),
        None => {
            return Err(CodecError::TooShort {
                needed: 1,
                actual: 0,
            })
        }
    };

    match flag {
        FLAG_RAW => Ok(body.to_vec()),
        FLAG_COMPRESSED => {
            let mut out = Vec::with_capacity(body.len() * 2);
            ZlibDecoder::new(body)
                .take(max_size as u64 + 1)
                .read_to_end(&mut out)?;
            if out.len() > max_size {
                return Err(CodecError::DecompressedTooLarge(max_size));
            }
            Ok(out)
        }
        other => Err(CodecError::InvalidCompressionFlag(other)),
    }
}
