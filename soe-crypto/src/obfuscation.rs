//! XOR chaining with the session key
//!
//! The body is processed in 4-byte little-endian blocks. Each block is XORed
//! with the running key and the resulting ciphertext block becomes the key
//! for the next one. Trailing bytes that do not fill a block are XORed with
//! the low byte of the final key.

/// Obfuscate `data` in place
pub fn encrypt(data: &mut [u8], key: u32) {
    let mut key = key;
    let mut blocks = data.chunks_exact_mut(4);

    for block in &mut blocks {
        let cipher = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) ^ key;
        block.copy_from_slice(&cipher.to_le_bytes());
        key = cipher;
    }

    let low = key as u8;
    for byte in blocks.into_remainder() {
        *byte ^= low;
    }
}

/// Reverse [`encrypt`] in place
pub fn decrypt(data: &mut [u8], key: u32) {
    let mut key = key;
    let mut blocks = data.chunks_exact_mut(4);

    for block in &mut blocks {
        let cipher = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        block.copy_from_slice(&(cipher ^ key).to_le_bytes());
        key = cipher;
    }

    let low = key as u8;
    for byte in blocks.into_remainder() {
        *byte ^= low;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_vector() {
        let mut data = [0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0xAA];
        encrypt(&mut data, 0x0000_0010);

        // 1 ^ 0x10 = 0x11; then 2 ^ 0x11 = 0x13; tail 0xAA ^ 0x13
        assert_eq!(data, [0x11, 0, 0, 0, 0x13, 0, 0, 0, 0xAA ^ 0x13]);
    }

    #[test]
    fn test_short_body_uses_low_key_byte() {
        let mut data = [0x00, 0xFF];
        encrypt(&mut data, 0x1234_5678);
        assert_eq!(data, [0x78, 0xFF ^ 0x78]);
    }

    #[test]
    fn test_changes_data() {
        let mut data = *b"hello world!";
        encrypt(&mut data, 0xCAFE_BABE);
        assert_ne!(&data, b"hello world!");
    }

    proptest! {
        #[test]
        fn test_decrypt_inverts_encrypt(data in proptest::collection::vec(any::<u8>(), 0..600), key in any::<u32>()) {
            let mut buf = data.clone();
            encrypt(&mut buf, key);
            decrypt(&mut buf, key);
            prop_assert_eq!(buf, data);
        }
    }
}
