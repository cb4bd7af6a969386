//! Friend-invite records and the owner→guest contact share.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sentry_crypto::prekeys::PrekeyBundle;

/// Server-issued invite. Single-acceptor; the server enforces that, the
/// client enforces the TTL at accept time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    #[serde(rename = "inviteId")]
    pub invite_id: String,
    /// 32 random bytes, base64url. Never leaves the two endpoints in clear.
    pub secret: String,
    #[serde(rename = "ownerAccountDigest")]
    pub owner_account_digest: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    /// Owner's published bundle, attached so the guest can bootstrap a
    /// session without a directory round-trip.
    #[serde(rename = "prekeyBundle", default, skip_serializing_if = "Option::is_none")]
    pub prekey_bundle: Option<PrekeyBundle>,
}

impl Invite {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Contact payload the owner attaches for the guest, carried inside a
/// `contact/v1` envelope keyed by the invite secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactShare {
    #[serde(rename = "accountDigest")]
    pub account_digest: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(rename = "avatarRef", default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    #[serde(rename = "prekeyBundle", default, skip_serializing_if = "Option::is_none")]
    pub prekey_bundle: Option<PrekeyBundle>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expiry_is_checked_against_the_given_clock() {
        let now = Utc::now();
        let invite = Invite {
            invite_id: "inv-1".into(),
            secret: "czNjcjN0".into(),
            owner_account_digest: "AB".repeat(32),
            expires_at: now + Duration::seconds(60),
            prekey_bundle: None,
        };
        assert!(!invite.expired_at(now));
        assert!(invite.expired_at(now + Duration::seconds(61)));
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let invite = Invite {
            invite_id: "inv-1".into(),
            secret: "cw".into(),
            owner_account_digest: "AB".repeat(32),
            expires_at: Utc::now(),
            prekey_bundle: None,
        };
        let json = serde_json::to_string(&invite).unwrap();
        assert!(json.contains("inviteId"));
        assert!(json.contains("ownerAccountDigest"));
        assert!(json.contains("expiresAt"));
        assert!(!json.contains("prekeyBundle"), "absent bundle omitted");
    }
}
