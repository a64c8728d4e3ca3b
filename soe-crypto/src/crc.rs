//! Seeded CRC footer
//!
//! The footer is the low `crc_length` bytes of a CRC32, seeded with the
//! session key, written big-endian after the packet.

use crate::codec::CodecError;
use crc32fast::Hasher;

/// Largest footer a session can negotiate
pub const MAX_CRC_LENGTH: u8 = 4;

/// CRC32 of `data` seeded with `seed`
pub fn crc32(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

fn footer(crc: u32, crc_length: u8) -> [u8; 4] {
    let bytes = crc.to_be_bytes();
    let mut out = [0u8; 4];
    let len = crc_length as usize;
    out[..len].copy_from_slice(&bytes[4 - len..]);
    out
}

/// Append the footer for `data` to `data`
pub fn append_crc(data: &mut Vec<u8>, seed: u32, crc_length: u8) {
    if crc_length == 0 {
        return;
    }
    let len = crc_length.min(MAX_CRC_LENGTH);
    let footer = footer(crc32(seed, &data[..]), len);
    data.extend_from_slice(&footer[..len as usize]);
}

/// Check and strip the footer, returning the packet without it
pub fn validate_and_strip_crc(data: &[u8], seed: u32, crc_length: u8) -> Result<&[u8], CodecError> {
    if crc_length == 0 {
        return Ok(data);
    }
    let len = crc_length.min(MAX_CRC_LENGTH) as usize;
    if data.len() < len {
        return Err(CodecError::TooShort {
            needed: len,
            actual: data.len(),
        });
    }

    let (packet, received) = data.split_at(data.len() - len);
    let computed = footer(crc32(seed, packet), len as u8);
    if received != &computed[..len] {
        let mut padded = [0u8; 4];
        padded[4 - len..].copy_from_slice(received);
        return Err(CodecError::CrcMismatch {
            expected: u32::from_be_bytes(computed) >> (8 * (4 - len)),
            actual: u32::from_be_bytes(padded),
        });
    }

    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footer_lengths() {
        for len in 0..=4u8 {
            let mut data = b"\x00\x09\x00\x01hello".to_vec();
            append_crc(&mut data, 0xDEAD_BEEF, len);
            assert_eq!(data.len(), 9 + len as usize);

            let stripped = validate_and_strip_crc(&data, 0xDEAD_BEEF, len).unwrap();
            assert_eq!(stripped, b"\x00\x09\x00\x01hello");
        }
    }

    #[test]
    fn test_footer_is_low_bytes_big_endian() {
        let crc = crc32(7, b"abc");
        let mut data = b"abc".to_vec();
        append_crc(&mut data, 7, 2);
        assert_eq!(&data[3..], &(crc as u16).to_be_bytes());
    }

    #[test]
    fn test_seed_changes_crc() {
        assert_ne!(crc32(1, b"payload"), crc32(2, b"payload"));
    }

    #[test]
    fn test_corruption_detected() {
        let mut data = b"some packet".to_vec();
        append_crc(&mut data, 42, 2);
        data[3] ^= 0x01;

        assert!(matches!(
            validate_and_strip_crc(&data, 42, 2),
            Err(CodecError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_seed_rejected() {
        let mut data = b"some packet".to_vec();
        append_crc(&mut data, 42, 4);
        assert!(validate_and_strip_crc(&data, 43, 4).is_err());
    }
}
