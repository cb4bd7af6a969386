//! Plaintext message types (inside the DR-encrypted body) and the timeline
//! entries the pipeline maintains.

use serde::{Deserialize, Serialize};

use sentry_crypto::envelope::SealedEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "media")]
    Media,
    #[serde(rename = "contact-share")]
    ContactShare,
    #[serde(rename = "call-log")]
    CallLog,
    #[serde(rename = "control")]
    Control,
}

/// Deserialised DR body, classified by `msg_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        body: String,
    },
    /// The object itself lives in blob storage; the DR message carries the
    /// key material needed to unwrap it.
    Media {
        object_key: String,
        mime_type: String,
        size_bytes: u64,
        /// AEAD envelope protecting the stored object (`media/v1`).
        envelope: SealedEnvelope,
        /// base64url 32-byte unwrap key for the object envelope.
        wrap_key: String,
    },
    ContactShare {
        account_digest: String,
        device_id: String,
        nickname: Option<String>,
        avatar_ref: Option<String>,
    },
    CallLog {
        call_id: String,
        kind: String,
        outcome: String,
        duration_ms: u64,
    },
    Control {
        action: ControlAction,
    },
}

impl MessageBody {
    pub fn msg_type(&self) -> MsgType {
        match self {
            MessageBody::Text { .. } => MsgType::Text,
            MessageBody::Media { .. } => MsgType::Media,
            MessageBody::ContactShare { .. } => MsgType::ContactShare,
            MessageBody::CallLog { .. } => MsgType::CallLog,
            MessageBody::Control { .. } => MsgType::Control,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// Peer reports an unrecoverable session error; the local side must mark
    /// the conversation failed and await an explicit reset.
    SessionError { reason: String },
    /// Explicit conversation reset request.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sending,
    Sent,
    Failed,
}

/// One row of the per-conversation timeline. Upserts are idempotent, keyed
/// by `message_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub message_id: String,
    pub conversation_id: String,
    pub outgoing: bool,
    pub msg_type: MsgType,
    pub body: MessageBody,
    pub status: DeliveryState,
    /// Reason code when `status == Failed` (e.g. COUNTER_TOO_LOW_REPLACED).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Unix milliseconds.
    pub ts: i64,
    /// Ratchet send counter attached at encrypt time (outgoing only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<u64>,
    /// Set on a replacement message: the id it supersedes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces_message_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_tags_are_stable() {
        assert_eq!(serde_json::to_string(&MsgType::Text).unwrap(), "\"text\"");
        assert_eq!(
            serde_json::to_string(&MsgType::ContactShare).unwrap(),
            "\"contact-share\""
        );
        assert_eq!(
            serde_json::to_string(&MsgType::CallLog).unwrap(),
            "\"call-log\""
        );
    }

    #[test]
    fn body_classification_matches_serde_tag() {
        let body = MessageBody::Text {
            body: "hi".into(),
        };
        assert_eq!(body.msg_type(), MsgType::Text);
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"type\":\"text\""));

        let ctrl = MessageBody::Control {
            action: ControlAction::SessionError {
                reason: "RATCHET_INVARIANT".into(),
            },
        };
        assert_eq!(ctrl.msg_type(), MsgType::Control);
        let back: MessageBody =
            serde_json::from_str(&serde_json::to_string(&ctrl).unwrap()).unwrap();
        assert_eq!(back.msg_type(), MsgType::Control);
    }
}
