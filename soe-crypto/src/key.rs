//! Session key and connection id generation

use crate::codec::CodecError;
use ring::rand::{SecureRandom, SystemRandom};

/// Source of session keys and connection ids
///
/// Backed by the operating system's CSPRNG through `ring`.
pub struct KeyGenerator {
    rng: SystemRandom,
}

impl KeyGenerator {
    pub fn new() -> Self {
        KeyGenerator {
            rng: SystemRandom::new(),
        }
    }

    fn next_u32(&self) -> Result<u32, CodecError> {
        let mut buf = [0u8; 4];
        self.rng
            .fill(&mut buf)
            .map_err(|_| CodecError::KeyGeneration)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Generate a session key, which also seeds the CRC footer
    ///
    /// Zero is never returned since it would leave the XOR layer inert.
    pub fn generate_key(&self) -> Result<u32, CodecError> {
        loop {
            let key = self.next_u32()?;
            if key != 0 {
                return Ok(key);
            }
        }
    }

    /// Generate a client connection id
    pub fn generate_connection_id(&self) -> Result<u32, CodecError> {
        self.next_u32()
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyGenerator")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_non_zero_and_vary() {
        let keys = KeyGenerator::new();
        let generated: Vec<u32> = (0..16).map(|_| keys.generate_key().unwrap()).collect();

        assert!(generated.iter().all(|&k| k != 0));
        // 16 draws from a 32-bit space colliding everywhere would mean a broken RNG
        assert!(generated.iter().any(|&k| k != generated[0]));
    }
}
