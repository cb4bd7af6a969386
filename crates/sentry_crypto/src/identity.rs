//! Long-term device identity (Ed25519).
//!
//! The identity key signs the signed prekey and participates in X3DH after
//! conversion to X25519. Secrets are zeroized on drop.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::{b64, error::CryptoError};

#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    public: [u8; 32],
    secret: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: signing_key.verifying_key().to_bytes(),
            secret: signing_key.to_bytes(),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity secret must be 32 bytes".into()))?;
        let signing_key = SigningKey::from_bytes(&secret);
        Ok(Self {
            public: signing_key.verifying_key().to_bytes(),
            secret,
        })
    }

    pub fn public_bytes(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn public_b64(&self) -> String {
        b64::encode(&self.public)
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Sign arbitrary bytes; 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.secret).sign(msg).to_bytes()
    }

    /// Verify a signature made by any Ed25519 public key.
    pub fn verify(public: &[u8; 32], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(public)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig_bytes: [u8; 64] = sig
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("signature must be 64 bytes".into()))?;
        vk.verify(msg, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let ik = IdentityKeyPair::generate();
        let sig = ik.sign(b"payload");
        IdentityKeyPair::verify(ik.public_bytes(), b"payload", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_message_and_wrong_key() {
        let ik = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        let sig = ik.sign(b"payload");
        assert!(IdentityKeyPair::verify(ik.public_bytes(), b"other", &sig).is_err());
        assert!(IdentityKeyPair::verify(other.public_bytes(), b"payload", &sig).is_err());
    }

    #[test]
    fn secret_roundtrips_through_bytes() {
        let ik = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret_bytes(ik.secret_bytes()).unwrap();
        assert_eq!(ik.public_bytes(), restored.public_bytes());
    }
}
