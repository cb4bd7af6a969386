//! X3DH key agreement bootstrapping a ratchet session.
//!
//! The initiator fetches the peer's published bundle and computes, with one
//! ephemeral key EK:
//!   DH1 = DH(IK_A, SPK_B)
//!   DH2 = DH(EK_A, IK_B)
//!   DH3 = DH(EK_A, SPK_B)
//!   DH4 = DH(EK_A, OPK_B)
//!   rk0 = HKDF-SHA256(ikm=DH1‖DH2‖DH3‖DH4, salt=0*32,
//!                     info="sentry/x3dh/root", 32)
//!
//! The SPK signature MUST verify before any DH is computed, and a one-time
//! prekey is always consumed. The prologue `{ik_pub, ek_pub, opk_id}` rides
//! with the first message so the responder can mirror the derivation.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{
    b64,
    error::CryptoError,
    identity::IdentityKeyPair,
    kdf,
    prekeys::{DevicePriv, PrekeyBundle},
};

pub const X3DH_ROOT_INFO: &[u8] = b"sentry/x3dh/root";

/// Convert an Ed25519 signing key (32-byte seed) to an X25519 static secret
/// via the clamped SHA-512 expansion ed25519-dalek uses internally.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key to an X25519 public key via the
/// birational Edwards → Montgomery map.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("Ed25519 public key decompression failed".into()))?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

/// Sent inside the first message of a session so the responder can derive
/// the same root key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X3dhPrologue {
    /// Initiator's Ed25519 identity public key (base64url)
    pub ik_pub: String,
    /// Initiator's ephemeral X25519 public key (base64url)
    pub ek_pub: String,
    /// Which one-time prekey was consumed
    pub opk_id: u32,
}

pub struct X3dhOutcome {
    /// Initial Double-Ratchet root key.
    pub root_key: [u8; 32],
    pub prologue: X3dhPrologue,
    /// Peer's signed prekey, already signature-checked — becomes the first
    /// remote ratchet key.
    pub peer_spk: X25519Public,
}

fn derive_root(parts: &[&[u8; 32]]) -> Result<[u8; 32], CryptoError> {
    let mut ikm = Vec::with_capacity(parts.len() * 32);
    for p in parts {
        ikm.extend_from_slice(*p);
    }
    let mut rk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), X3DH_ROOT_INFO, &mut rk)?;
    ikm.zeroize();
    Ok(rk)
}

/// Initiator side: verify the bundle, consume one OPK, derive rk0.
pub fn initiate(my_ik: &IdentityKeyPair, bundle: &PrekeyBundle) -> Result<X3dhOutcome, CryptoError> {
    let ik_b_ed = b64::decode_exact::<32>(&bundle.ik_pub)?;
    let spk_b_raw = b64::decode_exact::<32>(&bundle.spk_pub)?;
    let spk_sig = b64::decode(&bundle.spk_sig)?;

    // Signature check comes first; an unsigned prekey never touches DH.
    IdentityKeyPair::verify(&ik_b_ed, &spk_b_raw, &spk_sig)?;

    let opk = bundle.opks.first().ok_or(CryptoError::PrekeyExhausted)?;
    let opk_b = X25519Public::from(b64::decode_exact::<32>(&opk.pub_b64)?);

    let ik_a_x = ed25519_secret_to_x25519(my_ik.secret_bytes());
    let ik_b_x = ed25519_pub_to_x25519(&ik_b_ed)?;
    let spk_b = X25519Public::from(spk_b_raw);

    let ek = StaticSecret::random_from_rng(OsRng);
    let ek_pub = X25519Public::from(&ek);

    let dh1 = ik_a_x.diffie_hellman(&spk_b);
    let dh2 = ek.diffie_hellman(&ik_b_x);
    let dh3 = ek.diffie_hellman(&spk_b);
    let dh4 = ek.diffie_hellman(&opk_b);

    let root_key = derive_root(&[dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes(), dh4.as_bytes()])?;

    Ok(X3dhOutcome {
        root_key,
        prologue: X3dhPrologue {
            ik_pub: my_ik.public_b64(),
            ek_pub: b64::encode(ek_pub.as_bytes()),
            opk_id: opk.id,
        },
        peer_spk: spk_b,
    })
}

/// Responder side: mirror the derivation, consuming the named OPK secret
/// from the device blob.
pub fn respond(device: &mut DevicePriv, prologue: &X3dhPrologue) -> Result<[u8; 32], CryptoError> {
    let sender_ik_ed = b64::decode_exact::<32>(&prologue.ik_pub)?;
    let ek_a = X25519Public::from(b64::decode_exact::<32>(&prologue.ek_pub)?);

    let sender_ik_x = ed25519_pub_to_x25519(&sender_ik_ed)?;
    let my_ik_x = ed25519_secret_to_x25519(device.identity()?.secret_bytes());
    let my_spk = device.spk_secret()?;
    let my_opk = device.take_opk(prologue.opk_id)?;

    // Mirror the initiator's DH order exactly (DH is commutative per pair):
    let dh1 = my_spk.diffie_hellman(&sender_ik_x);
    let dh2 = my_ik_x.diffie_hellman(&ek_a);
    let dh3 = my_spk.diffie_hellman(&ek_a);
    let dh4 = my_opk.diffie_hellman(&ek_a);

    derive_root(&[dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes(), dh4.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prekeys::generate_initial_bundle;

    #[test]
    fn both_sides_derive_the_same_root_key() {
        let alice_ik = IdentityKeyPair::generate();
        let (mut bob_device, bob_bundle) = generate_initial_bundle(0, 2).unwrap();

        let outcome = initiate(&alice_ik, &bob_bundle).unwrap();
        let bob_rk = respond(&mut bob_device, &outcome.prologue).unwrap();

        assert_eq!(outcome.root_key, bob_rk);
        assert_eq!(outcome.prologue.opk_id, 0);
        // The consumed OPK is gone from the blob
        assert!(matches!(
            bob_device.take_opk(0),
            Err(CryptoError::UnknownOpk(0))
        ));
    }

    #[test]
    fn rejects_spk_signed_by_wrong_identity() {
        let alice_ik = IdentityKeyPair::generate();
        let evil_ik = IdentityKeyPair::generate();
        let (_, mut bundle) = generate_initial_bundle(0, 1).unwrap();

        let spk_pub = b64::decode(&bundle.spk_pub).unwrap();
        bundle.spk_sig = b64::encode(&evil_ik.sign(&spk_pub));

        assert!(matches!(
            initiate(&alice_ik, &bundle),
            Err(CryptoError::SignatureVerification)
        ));
    }

    #[test]
    fn requires_a_one_time_prekey() {
        let alice_ik = IdentityKeyPair::generate();
        let (_, mut bundle) = generate_initial_bundle(0, 1).unwrap();
        bundle.opks.clear();
        assert!(matches!(
            initiate(&alice_ik, &bundle),
            Err(CryptoError::PrekeyExhausted)
        ));
    }

    #[test]
    fn responder_fails_on_unknown_opk_id() {
        let alice_ik = IdentityKeyPair::generate();
        let (mut bob_device, bob_bundle) = generate_initial_bundle(0, 1).unwrap();
        let mut outcome = initiate(&alice_ik, &bob_bundle).unwrap();
        outcome.prologue.opk_id = 99;
        assert!(matches!(
            respond(&mut bob_device, &outcome.prologue),
            Err(CryptoError::UnknownOpk(99))
        ));
    }
}
