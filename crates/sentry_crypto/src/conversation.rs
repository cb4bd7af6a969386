//! Conversation context derivation and the token-keyed transport envelope.
//!
//! Derivations (all deterministic, so both ends of an invite agree):
//!   conversationToken = HKDF-SHA256(ikm=inviteSecret, salt=0*32,
//!                                   info="sentry/conv-token/"+deviceId, 32)
//!   conversationId    = base64url(SHA-256(token)) truncated to 44 chars
//!   accessFingerprint = HMAC-SHA256(key=token, data=UPPER(accountDigest))
//!
//! A non-empty deviceId is required — the token is bound to the requesting
//! device so two devices sharing an invite secret never collide on a token.
//!
//! Transport envelopes are raw AES-256-GCM keyed by the token (no HKDF, no
//! salt). IV MUST be a fresh random 12 bytes per seal; (key, iv) uniqueness
//! is the only integrity defence at this layer.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;

use crate::{b64, error::CryptoError, kdf};

pub const CONV_TOKEN_INFO_PREFIX: &str = "sentry/conv-token/";
pub const CONVERSATION_ID_LEN: usize = 44;

/// Derive the 32-byte conversation token from an invite secret.
pub fn derive_token(invite_secret: &[u8], device_id: &str) -> Result<[u8; 32], CryptoError> {
    if device_id.is_empty() {
        return Err(CryptoError::InvalidInput(
            "deviceId required for token derivation".into(),
        ));
    }
    if invite_secret.len() != 32 {
        return Err(CryptoError::InvalidInput(format!(
            "invite secret must be 32 bytes, got {}",
            invite_secret.len()
        )));
    }
    let info = format!("{CONV_TOKEN_INFO_PREFIX}{device_id}");
    let mut token = [0u8; 32];
    kdf::hkdf_expand(invite_secret, Some(&[0u8; 32]), info.as_bytes(), &mut token)?;
    Ok(token)
}

/// Conversation id: base64url(SHA-256(token)), capped at 44 characters.
pub fn conversation_id(token: &[u8; 32]) -> String {
    let mut id = b64::encode(&kdf::sha256(token));
    id.truncate(CONVERSATION_ID_LEN);
    id
}

/// Hex HMAC binding an account digest to a conversation.
pub fn access_fingerprint(token: &[u8; 32], account_digest: &str) -> String {
    hex::encode(kdf::hmac_sha256(
        token,
        account_digest.to_uppercase().as_bytes(),
    ))
}

/// Encrypt a transport payload. Returns (iv, ciphertext).
pub fn seal(token: &[u8; 32], plaintext: &[u8]) -> Result<([u8; 12], Vec<u8>), CryptoError> {
    let mut iv = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let cipher = Aes256Gcm::new_from_slice(token)
        .map_err(|_| CryptoError::InvalidKey("conversation token".into()))?;
    let ct = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    Ok((iv, ct))
}

/// Decrypt a transport payload.
pub fn open(token: &[u8; 32], iv: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(token)
        .map_err(|_| CryptoError::InvalidKey("conversation token".into()))?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_derivation_is_deterministic_per_device() {
        // Two parties supplying the same deviceId derive identical values.
        let secret = [0x01u8; 32];
        let a = derive_token(&secret, "device-A").unwrap();
        let b = derive_token(&secret, "device-A").unwrap();
        assert_eq!(a, b);
        assert_eq!(conversation_id(&a), conversation_id(&b));

        let other = derive_token(&secret, "device-B").unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn conversation_id_is_sha256_of_token() {
        let secret = [0x01u8; 32];
        let token = derive_token(&secret, "device-A").unwrap();
        let id = conversation_id(&token);
        assert!(id.len() <= CONVERSATION_ID_LEN);
        assert!(b64::encode(&kdf::sha256(&token)).starts_with(&id));
    }

    #[test]
    fn empty_device_id_rejected() {
        assert!(derive_token(&[0x01u8; 32], "").is_err());
    }

    #[test]
    fn short_secret_rejected() {
        assert!(derive_token(&[0x01u8; 16], "device-A").is_err());
    }

    #[test]
    fn fingerprint_uppercases_digest() {
        let token = derive_token(&[0x05u8; 32], "device-A").unwrap();
        let lower = access_fingerprint(&token, "abcdef");
        let upper = access_fingerprint(&token, "ABCDEF");
        assert_eq!(lower, upper);
    }

    #[test]
    fn seal_open_roundtrip_with_fresh_ivs() {
        let token = derive_token(&[0x09u8; 32], "device-A").unwrap();
        let (iv1, ct1) = seal(&token, b"payload").unwrap();
        let (iv2, ct2) = seal(&token, b"payload").unwrap();
        assert_ne!(iv1, iv2);
        assert_ne!(ct1, ct2);
        assert_eq!(open(&token, &iv1, &ct1).unwrap(), b"payload");
        assert_eq!(open(&token, &iv2, &ct2).unwrap(), b"payload");
    }

    #[test]
    fn tampered_payload_fails() {
        let token = derive_token(&[0x09u8; 32], "device-A").unwrap();
        let (iv, mut ct) = seal(&token, b"payload").unwrap();
        ct[0] ^= 0xff;
        assert_eq!(open(&token, &iv, &ct).unwrap_err().code(), "DECRYPT_FAILED");
    }
}
