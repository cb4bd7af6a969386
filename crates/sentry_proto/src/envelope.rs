//! Transport envelopes — what the relay sees, and what hides inside.
//!
//! The relay is a dumb pipe: a conversation envelope exposes nothing beyond
//! its version and an opaque (iv, payload) pair keyed by the conversation
//! token. The decrypted payload is a `DrPlaintext` carrying the ratchet
//! header, the DR-encrypted body, and minimal metadata.
//!
//! Wire format (bit-exact):
//!   conversation envelope: {"v":1, "iv_b64":..., "payload_b64":...}
//!   DR plaintext:          {"v":1, "hdr_b64":..., "ct_b64":...,
//!                           "meta":{"ts","sender_fingerprint","msg_type"}}
//! The optional `x3dh` prologue appears only on the first message of a
//! session and is dropped after the first ratchet turn.

use serde::{Deserialize, Serialize};

use sentry_crypto::{b64, x3dh::X3dhPrologue};

use crate::{error::ProtoError, message::MsgType};

pub const CONVERSATION_ENVELOPE_VERSION: u8 = 1;
pub const DR_PLAINTEXT_VERSION: u8 = 1;

/// Token-keyed AES-256-GCM envelope, one per message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEnvelope {
    pub v: u8,
    pub iv_b64: String,
    pub payload_b64: String,
}

impl ConversationEnvelope {
    pub fn from_parts(iv: [u8; 12], ciphertext: &[u8]) -> Self {
        Self {
            v: CONVERSATION_ENVELOPE_VERSION,
            iv_b64: b64::encode(&iv),
            payload_b64: b64::encode(ciphertext),
        }
    }

    /// Validate and split back into (iv, ciphertext).
    pub fn to_parts(&self) -> Result<([u8; 12], Vec<u8>), ProtoError> {
        if self.v != CONVERSATION_ENVELOPE_VERSION {
            return Err(ProtoError::malformed("v", format!("{}", self.v)));
        }
        if self.iv_b64.is_empty() {
            return Err(ProtoError::malformed("iv_b64", "empty"));
        }
        if self.payload_b64.is_empty() {
            return Err(ProtoError::malformed("payload_b64", "empty"));
        }
        let iv = b64::decode_exact::<12>(&self.iv_b64)
            .map_err(|e| ProtoError::malformed("iv_b64", e.to_string()))?;
        let ct = b64::decode(&self.payload_b64)
            .map_err(|e| ProtoError::malformed("payload_b64", e.to_string()))?;
        Ok((iv, ct))
    }
}

/// Metadata travelling with every DR message, inside the outer encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Sender timestamp, unix milliseconds.
    pub ts: i64,
    /// Hex HMAC binding the sender's account digest to the conversation.
    pub sender_fingerprint: String,
    pub msg_type: MsgType,
}

/// Decrypted conversation-envelope payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrPlaintext {
    pub v: u8,
    /// base64url(JSON ratchet header)
    pub hdr_b64: String,
    /// base64url(AES-256-GCM body under the message key)
    pub ct_b64: String,
    pub meta: MessageMeta,
    /// X3DH prologue, first message of a session only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x3dh: Option<X3dhPrologue>,
}

impl DrPlaintext {
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtoError> {
        let parsed: DrPlaintext = serde_json::from_slice(bytes)?;
        if parsed.v != DR_PLAINTEXT_VERSION {
            return Err(ProtoError::malformed("v", format!("{}", parsed.v)));
        }
        if parsed.hdr_b64.is_empty() {
            return Err(ProtoError::malformed("hdr_b64", "empty"));
        }
        if parsed.ct_b64.is_empty() {
            return Err(ProtoError::malformed("ct_b64", "empty"));
        }
        Ok(parsed)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_envelope_roundtrip() {
        let env = ConversationEnvelope::from_parts([9u8; 12], b"ciphertext");
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"v\":1"));
        assert!(json.contains("iv_b64"));
        assert!(json.contains("payload_b64"));

        let back: ConversationEnvelope = serde_json::from_str(&json).unwrap();
        let (iv, ct) = back.to_parts().unwrap();
        assert_eq!(iv, [9u8; 12]);
        assert_eq!(ct, b"ciphertext");
    }

    #[test]
    fn envelope_validation_names_the_failed_field() {
        let mut env = ConversationEnvelope::from_parts([0u8; 12], b"x");
        env.iv_b64 = "short".into();
        match env.to_parts().unwrap_err() {
            ProtoError::Malformed { field, .. } => assert_eq!(field, "iv_b64"),
            other => panic!("unexpected error {other:?}"),
        }

        let env = ConversationEnvelope {
            v: 2,
            iv_b64: "AAAAAAAAAAAAAAAA".into(),
            payload_b64: "AAAA".into(),
        };
        assert!(matches!(
            env.to_parts().unwrap_err(),
            ProtoError::Malformed { field: "v", .. }
        ));
    }

    #[test]
    fn dr_plaintext_drops_absent_prologue_from_wire() {
        let pt = DrPlaintext {
            v: DR_PLAINTEXT_VERSION,
            hdr_b64: "aGRy".into(),
            ct_b64: "Y3Q".into(),
            meta: MessageMeta {
                ts: 1_700_000_000_000,
                sender_fingerprint: "ab".repeat(32),
                msg_type: MsgType::Text,
            },
            x3dh: None,
        };
        let bytes = pt.to_bytes().unwrap();
        assert!(!String::from_utf8_lossy(&bytes).contains("x3dh"));
        let parsed = DrPlaintext::parse(&bytes).unwrap();
        assert!(parsed.x3dh.is_none());
        assert_eq!(parsed.meta.msg_type, MsgType::Text);
    }

    #[test]
    fn dr_plaintext_rejects_missing_fields() {
        assert!(DrPlaintext::parse(br#"{"v":1,"hdr_b64":"","ct_b64":"Y3Q","meta":{"ts":0,"sender_fingerprint":"f","msg_type":"text"}}"#).is_err());
        assert!(DrPlaintext::parse(br#"{"v":9,"hdr_b64":"aGRy","ct_b64":"Y3Q","meta":{"ts":0,"sender_fingerprint":"f","msg_type":"text"}}"#).is_err());
    }
}
