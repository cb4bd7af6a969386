//! Key derivation.
//!
//! `hkdf_expand` — HKDF-SHA256, the workhorse behind every derived key in
//!   this core (envelope keys, conversation tokens, ratchet roots, call
//!   keys).
//!
//! `kdf_rk` / `kdf_ck` — the two Double-Ratchet KDFs:
//!   KDF_RK(rk, dh) = HKDF-SHA256(ikm=dh, salt=rk, info="sentry/dr/rk", 64)
//!                    split into (new root key, chain key)
//!   KDF_CK(ck)     = (HMAC-SHA256(ck, 0x02), HMAC-SHA256(ck, 0x01))
//!                    i.e. (next chain key, message key)

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

pub const DR_ROOT_INFO: &[u8] = b"sentry/dr/rk";

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
/// `salt` of `None` means a zeroed salt per RFC 5869.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Root-key ratchet step. Returns (new_root_key, chain_key).
pub fn kdf_rk(rk: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut okm = [0u8; 64];
    hkdf_expand(dh_output, Some(rk), DR_ROOT_INFO, &mut okm)?;
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    new_rk.copy_from_slice(&okm[..32]);
    ck.copy_from_slice(&okm[32..]);
    Ok((new_rk, ck))
}

/// Symmetric chain step. Returns (next_chain_key, message_key).
pub fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    Ok((hmac_sha256(ck, &[0x02]), hmac_sha256(ck, &[0x01])))
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time HMAC-SHA256 verification.
pub fn hmac_sha256_verify(key: &[u8], data: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(tag)
        .map_err(|_| CryptoError::CallProofMismatch)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_step_matches_hmac_constants() {
        let ck = [0x11u8; 32];
        let (next_ck, mk) = kdf_ck(&ck).unwrap();
        assert_eq!(next_ck, hmac_sha256(&ck, &[0x02]));
        assert_eq!(mk, hmac_sha256(&ck, &[0x01]));
        assert_ne!(next_ck, mk);
    }

    #[test]
    fn adjacent_chain_keys_are_linked_by_hmac_0x02() {
        // ck_{n+1} == HMAC(ck_n, 0x02) for every step
        let mut ck = [0x42u8; 32];
        for _ in 0..16 {
            let (next, _) = kdf_ck(&ck).unwrap();
            assert_eq!(next, hmac_sha256(&ck, &[0x02]));
            ck = next;
        }
    }

    #[test]
    fn root_step_splits_64_bytes() {
        let rk = [1u8; 32];
        let (rk1, ck1) = kdf_rk(&rk, &[2u8; 32]).unwrap();
        let (rk2, ck2) = kdf_rk(&rk, &[2u8; 32]).unwrap();
        assert_eq!(rk1, rk2);
        assert_eq!(ck1, ck2);
        assert_ne!(rk1, ck1);
        // Different DH input diverges both halves
        let (rk3, ck3) = kdf_rk(&rk, &[3u8; 32]).unwrap();
        assert_ne!(rk1, rk3);
        assert_ne!(ck1, ck3);
    }
}
