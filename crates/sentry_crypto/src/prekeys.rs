//! Prekey generation and the device-private key blob.
//!
//! Each device publishes a bundle `{ik_pub, spk_pub, spk_sig, opks}` and
//! keeps the matching secrets in a `DevicePriv` blob, persisted MK-wrapped
//! under the `devkeys/v1` envelope tag. One-time prekey ids are monotonic;
//! `next_opk_id` travels inside the blob so replenishment and persistence
//! stay atomic.
//!
//! The OPK secrets live in the blob until consumed: the responder side of
//! X3DH cannot mirror DH4 without them.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::{b64, error::CryptoError, identity::IdentityKeyPair};

/// Published one-time prekey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyPub {
    pub id: u32,
    #[serde(rename = "pub")]
    pub pub_b64: String,
}

/// Published per-device bundle, consumed by session initiators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    /// Ed25519 identity public key (base64url)
    pub ik_pub: String,
    /// X25519 signed prekey (base64url)
    pub spk_pub: String,
    /// Ed25519 signature over the raw SPK public bytes (base64url)
    pub spk_sig: String,
    pub opks: Vec<OneTimePrekeyPub>,
}

/// A one-time prekey with its secret, as stored in the device blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredOpk {
    pub id: u32,
    #[serde(rename = "priv")]
    pub priv_b64: String,
    #[serde(rename = "pub")]
    pub pub_b64: String,
}

/// Device-private key material. Serialized as JSON and persisted only inside
/// a `devkeys/v1` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePriv {
    pub ik_priv: String,
    pub ik_pub: String,
    pub spk_priv: String,
    pub spk_pub: String,
    pub spk_sig: String,
    #[serde(default)]
    pub opks: Vec<StoredOpk>,
    pub next_opk_id: u32,
}

impl DevicePriv {
    pub fn identity(&self) -> Result<IdentityKeyPair, CryptoError> {
        IdentityKeyPair::from_secret_bytes(&b64::decode(&self.ik_priv)?)
    }

    pub fn spk_secret(&self) -> Result<StaticSecret, CryptoError> {
        Ok(StaticSecret::from(b64::decode_exact::<32>(&self.spk_priv)?))
    }

    pub fn spk_public(&self) -> Result<X25519Public, CryptoError> {
        Ok(X25519Public::from(b64::decode_exact::<32>(&self.spk_pub)?))
    }

    /// Remove and return a one-time prekey secret. Single use: a second
    /// call with the same id fails.
    pub fn take_opk(&mut self, id: u32) -> Result<StaticSecret, CryptoError> {
        let idx = self
            .opks
            .iter()
            .position(|o| o.id == id)
            .ok_or(CryptoError::UnknownOpk(id))?;
        let opk = self.opks.remove(idx);
        Ok(StaticSecret::from(b64::decode_exact::<32>(&opk.priv_b64)?))
    }

    /// Rebuild the publishable bundle from the stored secrets.
    pub fn public_bundle(&self) -> PrekeyBundle {
        PrekeyBundle {
            ik_pub: self.ik_pub.clone(),
            spk_pub: self.spk_pub.clone(),
            spk_sig: self.spk_sig.clone(),
            opks: self
                .opks
                .iter()
                .map(|o| OneTimePrekeyPub {
                    id: o.id,
                    pub_b64: o.pub_b64.clone(),
                })
                .collect(),
        }
    }
}

/// Generate a fresh device identity, signed prekey, and `count` one-time
/// prekeys with ids starting at `start_id`.
pub fn generate_initial_bundle(
    start_id: u32,
    count: u32,
) -> Result<(DevicePriv, PrekeyBundle), CryptoError> {
    let identity = IdentityKeyPair::generate();

    let spk_secret = StaticSecret::random_from_rng(OsRng);
    let spk_public = X25519Public::from(&spk_secret);
    let spk_sig = identity.sign(spk_public.as_bytes());

    let mut device = DevicePriv {
        ik_priv: b64::encode(identity.secret_bytes()),
        ik_pub: identity.public_b64(),
        spk_priv: b64::encode(&spk_secret.to_bytes()),
        spk_pub: b64::encode(spk_public.as_bytes()),
        spk_sig: b64::encode(&spk_sig),
        opks: Vec::new(),
        next_opk_id: start_id,
    };
    generate_opks(&mut device, count);

    let bundle = device.public_bundle();
    Ok((device, bundle))
}

/// Replenish `count` one-time prekeys, advancing the id counter. Returns the
/// publishable halves of the new keys.
pub fn generate_opks(device: &mut DevicePriv, count: u32) -> Vec<OneTimePrekeyPub> {
    let mut published = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = device.next_opk_id;
        device.next_opk_id += 1;
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        device.opks.push(StoredOpk {
            id,
            priv_b64: b64::encode(&secret.to_bytes()),
            pub_b64: b64::encode(public.as_bytes()),
        });
        published.push(OneTimePrekeyPub {
            id,
            pub_b64: b64::encode(public.as_bytes()),
        });
    }
    published
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_bundle_carries_signed_prekey() {
        let (device, bundle) = generate_initial_bundle(0, 4).unwrap();
        assert_eq!(bundle.opks.len(), 4);
        assert_eq!(device.next_opk_id, 4);

        let ik_pub = b64::decode_exact::<32>(&bundle.ik_pub).unwrap();
        let spk_pub = b64::decode(&bundle.spk_pub).unwrap();
        let sig = b64::decode(&bundle.spk_sig).unwrap();
        IdentityKeyPair::verify(&ik_pub, &spk_pub, &sig).unwrap();
    }

    #[test]
    fn opk_ids_are_monotonic_across_replenishment() {
        let (mut device, _) = generate_initial_bundle(10, 2).unwrap();
        let batch = generate_opks(&mut device, 3);
        let ids: Vec<u32> = batch.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![12, 13, 14]);
        assert_eq!(device.next_opk_id, 15);
    }

    #[test]
    fn take_opk_is_single_use() {
        let (mut device, bundle) = generate_initial_bundle(0, 1).unwrap();
        let id = bundle.opks[0].id;
        let secret = device.take_opk(id).unwrap();
        let public = X25519Public::from(&secret);
        assert_eq!(b64::encode(public.as_bytes()), bundle.opks[0].pub_b64);
        assert!(matches!(
            device.take_opk(id),
            Err(CryptoError::UnknownOpk(_))
        ));
    }

    #[test]
    fn device_blob_survives_json_roundtrip() {
        let (device, _) = generate_initial_bundle(0, 2).unwrap();
        let json = serde_json::to_vec(&device).unwrap();
        let restored: DevicePriv = serde_json::from_slice(&json).unwrap();
        assert_eq!(restored.next_opk_id, device.next_opk_id);
        assert_eq!(restored.opks.len(), 2);
        restored.identity().unwrap();
        restored.spk_secret().unwrap();
    }
}
