//! MK-wrapped AEAD envelope for at-rest payloads.
//!
//! Wire shape: `{v:1, aead:"aes-256-gcm", info, salt_b64, iv_b64, ct_b64}`.
//! Per wrap: fresh 16-byte salt, fresh 12-byte IV,
//! `k = HKDF-SHA256(ikm=mk, salt, info, 32)`, AES-256-GCM.
//!
//! `info` is a closed allow-list; an unknown tag never reaches the cipher.
//! A failed decrypt surfaces as `ENVELOPE_DECRYPT_FAILED` and is never
//! retried by this layer.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{b64, error::CryptoError, kdf};

pub const ENVELOPE_VERSION: u8 = 1;
pub const ENVELOPE_AEAD: &str = "aes-256-gcm";

/// Allow-listed envelope domains. Everything persisted through the MK goes
/// under exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoTag {
    Blob,
    Media,
    Profile,
    Settings,
    Snapshot,
    ContactSecretsBackup,
    DevKeys,
    Contact,
}

impl InfoTag {
    pub const ALL: [InfoTag; 8] = [
        InfoTag::Blob,
        InfoTag::Media,
        InfoTag::Profile,
        InfoTag::Settings,
        InfoTag::Snapshot,
        InfoTag::ContactSecretsBackup,
        InfoTag::DevKeys,
        InfoTag::Contact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InfoTag::Blob => "blob/v1",
            InfoTag::Media => "media/v1",
            InfoTag::Profile => "profile/v1",
            InfoTag::Settings => "settings/v1",
            InfoTag::Snapshot => "snapshot/v1",
            InfoTag::ContactSecretsBackup => "contact-secrets/backup/v1",
            InfoTag::DevKeys => "devkeys/v1",
            InfoTag::Contact => "contact/v1",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CryptoError::BadEnvelope(format!("info tag {s:?} not allow-listed")))
    }
}

/// An MK-wrapped payload as it is persisted or shipped to backup storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub v: u8,
    pub aead: String,
    pub info: String,
    pub salt_b64: String,
    pub iv_b64: String,
    pub ct_b64: String,
}

/// Encrypt `plaintext` under a key derived from `wrap_key` for `info`.
pub fn wrap(
    plaintext: &[u8],
    wrap_key: &[u8; 32],
    info: InfoTag,
) -> Result<SealedEnvelope, CryptoError> {
    let mut salt = [0u8; 16];
    let mut iv = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let mut key = Zeroizing::new([0u8; 32]);
    kdf::hkdf_expand(wrap_key, Some(&salt), info.as_str().as_bytes(), key.as_mut())?;

    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|_| CryptoError::InvalidKey("envelope key".into()))?;
    let ct = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    Ok(SealedEnvelope {
        v: ENVELOPE_VERSION,
        aead: ENVELOPE_AEAD.to_string(),
        info: info.as_str().to_string(),
        salt_b64: b64::encode_std(&salt),
        iv_b64: b64::encode_std(&iv),
        ct_b64: b64::encode_std(&ct),
    })
}

/// Validate and decrypt an envelope. The plaintext is zeroized on drop.
pub fn unwrap(
    envelope: &SealedEnvelope,
    wrap_key: &[u8; 32],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let info = validate(envelope)?;

    let salt = b64::decode_exact::<16>(&envelope.salt_b64)
        .map_err(|_| CryptoError::BadEnvelope("salt_b64".into()))?;
    let iv = b64::decode_exact::<12>(&envelope.iv_b64)
        .map_err(|_| CryptoError::BadEnvelope("iv_b64".into()))?;
    let ct = b64::decode(&envelope.ct_b64).map_err(|_| CryptoError::BadEnvelope("ct_b64".into()))?;

    let mut key = Zeroizing::new([0u8; 32]);
    kdf::hkdf_expand(wrap_key, Some(&salt), info.as_str().as_bytes(), key.as_mut())?;

    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|_| CryptoError::InvalidKey("envelope key".into()))?;
    let pt = cipher
        .decrypt(Nonce::from_slice(&iv), ct.as_slice())
        .map_err(|_| CryptoError::EnvelopeDecrypt)?;

    Ok(Zeroizing::new(pt))
}

/// Structural validation, independent of key material.
pub fn validate(envelope: &SealedEnvelope) -> Result<InfoTag, CryptoError> {
    if envelope.v != ENVELOPE_VERSION {
        return Err(CryptoError::BadEnvelope(format!("v={}", envelope.v)));
    }
    if envelope.aead != ENVELOPE_AEAD {
        return Err(CryptoError::BadEnvelope(format!("aead={:?}", envelope.aead)));
    }
    let info = InfoTag::parse(&envelope.info)?;
    for (name, field) in [
        ("salt_b64", &envelope.salt_b64),
        ("iv_b64", &envelope.iv_b64),
        ("ct_b64", &envelope.ct_b64),
    ] {
        if field.is_empty() {
            return Err(CryptoError::BadEnvelope(format!("{name} empty")));
        }
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MK: [u8; 32] = [0x2a; 32];

    #[test]
    fn wrap_unwrap_roundtrip_for_every_tag() {
        let plaintext = br#"{"hello":"world"}"#;
        for tag in InfoTag::ALL {
            let env = wrap(plaintext, &MK, tag).unwrap();
            assert_eq!(env.v, 1);
            assert_eq!(env.aead, "aes-256-gcm");
            let out = unwrap(&env, &MK).unwrap();
            assert_eq!(out.as_slice(), plaintext, "tag {}", tag.as_str());
        }
    }

    #[test]
    fn ciphertext_mutation_fails_decrypt() {
        let env = wrap(br#"{"hello":"world"}"#, &MK, InfoTag::Blob).unwrap();
        let mut ct = b64::decode(&env.ct_b64).unwrap();
        ct[0] ^= 0x01;
        let tampered = SealedEnvelope {
            ct_b64: b64::encode_std(&ct),
            ..env
        };
        let err = unwrap(&tampered, &MK).unwrap_err();
        assert_eq!(err.code(), "ENVELOPE_DECRYPT_FAILED");
    }

    #[test]
    fn unknown_info_tag_rejected_before_decrypt() {
        let mut env = wrap(b"x", &MK, InfoTag::Blob).unwrap();
        env.info = "blob/v2".into();
        let err = unwrap(&env, &MK).unwrap_err();
        assert_eq!(err.code(), "BAD_ENVELOPE");
    }

    #[test]
    fn wrong_aead_and_empty_fields_rejected() {
        let good = wrap(b"x", &MK, InfoTag::Settings).unwrap();

        let mut env = good.clone();
        env.aead = "chacha20-poly1305".into();
        assert_eq!(unwrap(&env, &MK).unwrap_err().code(), "BAD_ENVELOPE");

        let mut env = good.clone();
        env.iv_b64.clear();
        assert_eq!(unwrap(&env, &MK).unwrap_err().code(), "BAD_ENVELOPE");

        let mut env = good;
        env.v = 2;
        assert_eq!(unwrap(&env, &MK).unwrap_err().code(), "BAD_ENVELOPE");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let env = wrap(b"secret", &MK, InfoTag::Profile).unwrap();
        let other = [0x2bu8; 32];
        assert_eq!(unwrap(&env, &other).unwrap_err().code(), "ENVELOPE_DECRYPT_FAILED");
    }

    #[test]
    fn salts_and_ivs_are_fresh_per_wrap() {
        let a = wrap(b"x", &MK, InfoTag::Blob).unwrap();
        let b = wrap(b"x", &MK, InfoTag::Blob).unwrap();
        assert_ne!(a.salt_b64, b.salt_b64);
        assert_ne!(a.iv_b64, b.iv_b64);
        assert_ne!(a.ct_b64, b.ct_b64);
    }
}
