//! Per-frame media cipher.
//!
//! Each encoded frame is sealed with AES-256-GCM under a directional key;
//! the 96-bit IV is `base_nonce XOR (0*8 ‖ be32(counter))`, injective over
//! the full u32 counter range for a fixed base. The counter is carried
//! big-endian ahead of the ciphertext so receivers re-derive the exact IV
//! even across losses.
//!
//! Media is lossy by nature: a frame that fails authentication is dropped
//! and the receive counter is left untouched. Counter exhaustion demands a
//! key rotation before any further frame is sealed.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use zeroize::Zeroize;

use crate::{calls::DirectionalKey, error::CryptoError};

pub const FRAME_HEADER_LEN: usize = 4;

/// IV for frame `counter` under `base`.
pub fn frame_nonce(base: &[u8; 12], counter: u32) -> [u8; 12] {
    let mut iv = *base;
    let be = counter.to_be_bytes();
    for (i, b) in be.iter().enumerate() {
        iv[8 + i] ^= b;
    }
    iv
}

/// One direction of one media stream within a call.
pub struct FrameCipher {
    key: [u8; 32],
    base_nonce: [u8; 12],
    counter: u32,
}

impl Drop for FrameCipher {
    fn drop(&mut self) {
        self.key.zeroize();
        self.base_nonce.zeroize();
    }
}

impl FrameCipher {
    pub fn new(dir: &DirectionalKey) -> Self {
        Self {
            key: dir.key,
            base_nonce: dir.nonce,
            counter: 0,
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Seal the next outbound frame: `be32(counter) ‖ ct‖tag`.
    pub fn seal_next(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.counter;
        if counter == u32::MAX {
            return Err(CryptoError::FrameCounterExhausted);
        }
        let iv = frame_nonce(&self.base_nonce, counter);
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| CryptoError::InvalidKey("frame key".into()))?;
        let ct = cipher
            .encrypt(Nonce::from_slice(&iv), frame)
            .map_err(|_| CryptoError::Encrypt)?;

        self.counter += 1;

        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + ct.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Open an inbound frame. On success the receive counter tracks the
    /// highest decrypted frame; on failure nothing advances.
    pub fn open(&mut self, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if wire.len() < FRAME_HEADER_LEN + 16 {
            return Err(CryptoError::Decrypt);
        }
        let counter = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]);
        let iv = frame_nonce(&self.base_nonce, counter);
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| CryptoError::InvalidKey("frame key".into()))?;
        let pt = cipher
            .decrypt(Nonce::from_slice(&iv), &wire[FRAME_HEADER_LEN..])
            .map_err(|_| CryptoError::Decrypt)?;

        self.counter = self.counter.max(counter.saturating_add(1));
        Ok(pt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_key(seed: u8) -> DirectionalKey {
        DirectionalKey {
            key: [seed; 32],
            nonce: [seed.wrapping_add(1); 12],
        }
    }

    #[test]
    fn nonce_is_injective_over_the_counter_range() {
        let base = [0xA5u8; 12];
        // XOR with a big-endian counter only touches the last four bytes,
        // bijectively: distinct counters give distinct IVs.
        let samples = [0u32, 1, 2, 255, 256, 65_535, 1 << 24, u32::MAX - 1, u32::MAX];
        let mut seen = std::collections::HashSet::new();
        for c in samples {
            assert!(seen.insert(frame_nonce(&base, c)), "collision at {c}");
        }
        // Base bytes outside the counter window are untouched.
        assert_eq!(frame_nonce(&base, 7)[..8], base[..8]);
    }

    #[test]
    fn seal_open_roundtrip_advances_counters() {
        let key = dir_key(3);
        let mut tx = FrameCipher::new(&key);
        let mut rx = FrameCipher::new(&key);

        for i in 0..4u32 {
            let frame = format!("frame-{i}");
            let wire = tx.seal_next(frame.as_bytes()).unwrap();
            assert_eq!(rx.open(&wire).unwrap(), frame.as_bytes());
        }
        assert_eq!(tx.counter(), 4);
        assert_eq!(rx.counter(), 4);
    }

    #[test]
    fn frames_survive_loss_and_reordering() {
        let key = dir_key(9);
        let mut tx = FrameCipher::new(&key);
        let mut rx = FrameCipher::new(&key);

        let w0 = tx.seal_next(b"f0").unwrap();
        let _lost = tx.seal_next(b"f1").unwrap();
        let w2 = tx.seal_next(b"f2").unwrap();

        assert_eq!(rx.open(&w2).unwrap(), b"f2");
        assert_eq!(rx.counter(), 3);
        // Late frame still opens; counter keeps the high-water mark.
        assert_eq!(rx.open(&w0).unwrap(), b"f0");
        assert_eq!(rx.counter(), 3);
    }

    #[test]
    fn tampered_frame_is_dropped_without_advancing() {
        let key = dir_key(5);
        let mut tx = FrameCipher::new(&key);
        let mut rx = FrameCipher::new(&key);

        let mut wire = tx.seal_next(b"media").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert_eq!(rx.open(&wire).unwrap_err().code(), "DECRYPT_FAILED");
        assert_eq!(rx.counter(), 0);
    }

    #[test]
    fn cross_direction_keys_do_not_decrypt() {
        let mut tx = FrameCipher::new(&dir_key(1));
        let mut rx = FrameCipher::new(&dir_key(2));
        let wire = tx.seal_next(b"media").unwrap();
        assert!(rx.open(&wire).is_err());
    }

    #[test]
    fn truncated_wire_rejected() {
        let mut rx = FrameCipher::new(&dir_key(8));
        assert!(rx.open(&[0, 0, 0, 1]).is_err());
    }
}
