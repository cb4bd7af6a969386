//! Call signalling payloads.
//!
//! The call-key envelope travels with the call invite (and again on every
//! epoch rotation): `{type:"call-key-envelope", version:1, callId, epoch,
//! cmkSalt, cmkProof, media, capabilities, createdAt}`. The salt is public;
//! only a holder of the conversation token can reproduce the proof.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sentry_crypto::b64;

use crate::error::ProtoError;

pub const CALL_KEY_ENVELOPE_TYPE: &str = "call-key-envelope";
pub const CALL_KEY_ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
}

/// Which media the caller intends to send.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MediaDescription {
    pub audio: bool,
    pub video: bool,
}

impl MediaDescription {
    pub fn for_kind(kind: CallKind) -> Self {
        Self {
            audio: true,
            video: matches!(kind, CallKind::Video),
        }
    }
}

/// Peer capabilities relevant to frame encryption.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CallCapabilities {
    /// Whether the peer can attach encoded-stream transforms. Without it,
    /// media is explicitly unencrypted (`E2E_SKIPPED`), never silently so.
    #[serde(rename = "insertableStreams")]
    pub insertable_streams: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallKeyEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u8,
    #[serde(rename = "callId")]
    pub call_id: String,
    pub epoch: u32,
    /// base64 32 bytes
    #[serde(rename = "cmkSalt")]
    pub cmk_salt: String,
    /// base64 32 bytes
    #[serde(rename = "cmkProof")]
    pub cmk_proof: String,
    pub media: MediaDescription,
    pub capabilities: CallCapabilities,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl CallKeyEnvelope {
    pub fn new(
        call_id: String,
        epoch: u32,
        cmk_salt: &[u8; 32],
        cmk_proof: &[u8; 32],
        media: MediaDescription,
        capabilities: CallCapabilities,
    ) -> Self {
        Self {
            kind: CALL_KEY_ENVELOPE_TYPE.to_string(),
            version: CALL_KEY_ENVELOPE_VERSION,
            call_id,
            epoch,
            cmk_salt: b64::encode(cmk_salt),
            cmk_proof: b64::encode(cmk_proof),
            media,
            capabilities,
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<([u8; 32], [u8; 32]), ProtoError> {
        if self.kind != CALL_KEY_ENVELOPE_TYPE {
            return Err(ProtoError::malformed("type", self.kind.clone()));
        }
        if self.version != CALL_KEY_ENVELOPE_VERSION {
            return Err(ProtoError::malformed("version", format!("{}", self.version)));
        }
        if self.call_id.is_empty() {
            return Err(ProtoError::malformed("callId", "empty"));
        }
        let salt = b64::decode_exact::<32>(&self.cmk_salt)
            .map_err(|e| ProtoError::malformed("cmkSalt", e.to_string()))?;
        let proof = b64::decode_exact::<32>(&self.cmk_proof)
            .map_err(|e| ProtoError::malformed("cmkProof", e.to_string()))?;
        Ok((salt, proof))
    }
}

/// Signals the core hands to / receives from the signalling transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum CallSignal {
    Invite {
        #[serde(rename = "callId")]
        call_id: String,
        kind: CallKind,
        envelope: CallKeyEnvelope,
    },
    Accept {
        #[serde(rename = "callId")]
        call_id: String,
        capabilities: CallCapabilities,
    },
    RotateKeys {
        #[serde(rename = "callId")]
        call_id: String,
        envelope: CallKeyEnvelope,
    },
    End {
        #[serde(rename = "callId")]
        call_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> CallKeyEnvelope {
        CallKeyEnvelope::new(
            "11111111-1111-4111-8111-111111111111".into(),
            1,
            &[7u8; 32],
            &[9u8; 32],
            MediaDescription::for_kind(CallKind::Audio),
            CallCapabilities {
                insertable_streams: true,
            },
        )
    }

    #[test]
    fn wire_shape_matches_the_signal_format() {
        let json = serde_json::to_value(envelope()).unwrap();
        assert_eq!(json["type"], "call-key-envelope");
        assert_eq!(json["version"], 1);
        assert!(json["cmkSalt"].is_string());
        assert!(json["cmkProof"].is_string());
        assert!(json["createdAt"].is_string());
        assert_eq!(json["capabilities"]["insertableStreams"], true);
    }

    #[test]
    fn validate_recovers_salt_and_proof() {
        let (salt, proof) = envelope().validate().unwrap();
        assert_eq!(salt, [7u8; 32]);
        assert_eq!(proof, [9u8; 32]);
    }

    #[test]
    fn validate_rejects_foreign_type_and_short_salt() {
        let mut env = envelope();
        env.kind = "call-invite".into();
        assert!(env.validate().is_err());

        let mut env = envelope();
        env.cmk_salt = b64::encode(&[1u8; 16]);
        assert!(env.validate().is_err());
    }

    #[test]
    fn media_description_tracks_call_kind() {
        assert!(!MediaDescription::for_kind(CallKind::Audio).video);
        assert!(MediaDescription::for_kind(CallKind::Video).video);
    }
}
