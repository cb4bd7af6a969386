//! Device-private blob wrapping.
//!
//! The `DevicePriv` blob (identity + signed prekey secrets + one-time
//! prekey secrets + `next_opk_id`) persists only MK-wrapped under
//! `devkeys/v1`. Wrapping the whole blob keeps the id counter and the key
//! material atomic: a replenished batch is either fully persisted with its
//! advanced counter or not at all.

use sentry_crypto::{
    envelope::{self, InfoTag, SealedEnvelope},
    prekeys::DevicePriv,
};

use crate::error::StoreError;

pub fn seal_device_priv(mk: &[u8; 32], device: &DevicePriv) -> Result<SealedEnvelope, StoreError> {
    let json = serde_json::to_vec(device)?;
    Ok(envelope::wrap(&json, mk, InfoTag::DevKeys)?)
}

pub fn open_device_priv(mk: &[u8; 32], sealed: &SealedEnvelope) -> Result<DevicePriv, StoreError> {
    if sealed.info != InfoTag::DevKeys.as_str() {
        return Err(StoreError::Crypto(
            sentry_crypto::CryptoError::BadEnvelope(format!(
                "expected devkeys/v1, got {:?}",
                sealed.info
            )),
        ));
    }
    let plaintext = envelope::unwrap(sealed, mk)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentry_crypto::prekeys::generate_initial_bundle;

    #[test]
    fn device_blob_roundtrip_preserves_opk_counter() {
        let mk = [3u8; 32];
        let (device, _) = generate_initial_bundle(5, 3).unwrap();
        let sealed = seal_device_priv(&mk, &device).unwrap();
        assert_eq!(sealed.info, "devkeys/v1");

        let restored = open_device_priv(&mk, &sealed).unwrap();
        assert_eq!(restored.next_opk_id, 8);
        assert_eq!(restored.opks.len(), 3);
    }

    #[test]
    fn foreign_info_tag_is_refused() {
        let mk = [3u8; 32];
        let (device, _) = generate_initial_bundle(0, 1).unwrap();
        let mut sealed = seal_device_priv(&mk, &device).unwrap();
        sealed.info = "blob/v1".into();
        assert!(open_device_priv(&mk, &sealed).is_err());
    }
}
