//! DTOs crossing the core's external interfaces, plus the strict input
//! validation the boundary applies before anything reaches crypto.

use serde::{Deserialize, Serialize};

use crate::{envelope::ConversationEnvelope, error::ProtoError};

/// `peerKey`: the primary key across vault, ratchet arena, and call state.
pub fn peer_key(account_digest: &str, device_id: &str) -> String {
    format!("{account_digest}::{device_id}")
}

/// Account digest: exactly 64 hex chars, uppercased on entry.
pub fn validate_account_digest(s: &str) -> Result<String, ProtoError> {
    let upper = s.to_uppercase();
    if upper.len() != 64 || !upper.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ProtoError::malformed(
            "accountDigest",
            format!("expected 64 hex chars, got {:?} chars", s.len()),
        ));
    }
    Ok(upper)
}

/// NFC-tag UID: 14–64 hex chars, uppercased.
pub fn validate_uid_hex(s: &str) -> Result<String, ProtoError> {
    let upper = s.to_uppercase();
    if !(14..=64).contains(&upper.len()) || !upper.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ProtoError::malformed(
            "uid",
            format!("expected 14-64 hex chars, got {} chars", s.len()),
        ));
    }
    Ok(upper)
}

/// SDM challenge parameters as read from the tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdmParams {
    pub uid: String,
    pub sdmmac: String,
    pub sdmcounter: String,
    pub nonce: String,
}

/// Result of the SDM exchange with the account server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdmExchange {
    #[serde(rename = "accountDigest")]
    pub account_digest: String,
    #[serde(rename = "accountToken")]
    pub account_token: String,
    #[serde(rename = "opaqueServerId", default, skip_serializing_if = "Option::is_none")]
    pub opaque_server_id: Option<String>,
}

/// What `bootstrap` hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapResult {
    #[serde(rename = "accountDigest")]
    pub account_digest: String,
    #[serde(rename = "accountToken")]
    pub account_token: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

/// Transport acknowledgement for an outbound conversation envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAck {
    #[serde(rename = "serverMessageId")]
    pub server_message_id: String,
}

/// What the caller gets back from a successful send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    #[serde(rename = "convId")]
    pub conv_id: String,
    #[serde(rename = "serverMessageId")]
    pub server_message_id: String,
    pub counter: u64,
    #[serde(rename = "messageId")]
    pub message_id: String,
    /// Present when this receipt belongs to a replacement of a rejected
    /// message; names the id it superseded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_message_id: Option<String>,
}

/// Inbound unit handed over by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub envelope: ConversationEnvelope,
    pub ts: i64,
    #[serde(rename = "messageId")]
    pub message_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_uppercased_and_length_checked() {
        let lower = "ab".repeat(32);
        assert_eq!(validate_account_digest(&lower).unwrap(), "AB".repeat(32));
        assert!(validate_account_digest("AB").is_err());
        let mut bad = "AB".repeat(31);
        bad.push_str("ZZ");
        assert!(validate_account_digest(&bad).is_err());
    }

    #[test]
    fn uid_hex_bounds() {
        assert!(validate_uid_hex(&"a".repeat(13)).is_err());
        assert_eq!(validate_uid_hex(&"a".repeat(14)).unwrap(), "A".repeat(14));
        assert_eq!(validate_uid_hex(&"f".repeat(64)).unwrap(), "F".repeat(64));
        assert!(validate_uid_hex(&"f".repeat(65)).is_err());
        assert!(validate_uid_hex(&"g".repeat(20)).is_err());
    }

    #[test]
    fn peer_key_concatenation() {
        assert_eq!(peer_key("ABCD", "device-1"), "ABCD::device-1");
    }
}
