//! Contact-secret vault.
//!
//! One record per (peerAccountDigest, peerDeviceId), holding the invite
//! secret's derivates (conversation token + id), the invite role, the
//! Double-Ratchet state, and profile fields. The vault serializes to a
//! snapshot that goes to backup storage MK-wrapped under
//! `contact-secrets/backup/v1`, carrying a content checksum.
//!
//! A contact marked corrupt is never reused silently: every send path must
//! check `ensure_usable` first and fail `CONTACT_CORRUPT`. A fetched backup
//! that fails to decrypt marks that backup key corrupt for the session and
//! is never retried.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use sentry_crypto::{
    envelope::{self, InfoTag, SealedEnvelope},
    kdf,
    ratchet::{DrState, Role},
    x3dh::X3dhPrologue,
};

use crate::error::StoreError;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptMark {
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    #[serde(rename = "peerAccountDigest")]
    pub peer_account_digest: String,
    #[serde(rename = "peerDeviceId")]
    pub peer_device_id: String,
    #[serde(rename = "peerKey")]
    pub peer_key: String,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    /// base64url 32 bytes
    #[serde(rename = "conversationToken")]
    pub conversation_token: String,
    pub role: Role,
    #[serde(rename = "drState", default, skip_serializing_if = "Option::is_none")]
    pub dr_state: Option<DrState>,
    /// X3DH prologue still owed to the peer; attached to every outgoing
    /// message until the first inbound message proves the session mirrored.
    #[serde(rename = "x3dhPending", default, skip_serializing_if = "Option::is_none")]
    pub x3dh_pending: Option<X3dhPrologue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(rename = "avatarRef", default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    #[serde(rename = "addedAt")]
    pub added_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrupt: Option<CorruptMark>,
}

/// Snapshot as persisted (before MK-wrapping).
#[derive(Clone, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub version: u32,
    #[serde(rename = "generatedAt")]
    pub generated_at: DateTime<Utc>,
    pub contacts: Vec<ContactRecord>,
}

/// Cheap descriptive stats for the upload scheduler and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub version: u32,
    pub entries: usize,
    #[serde(rename = "withDrState")]
    pub with_dr_state: usize,
    #[serde(rename = "generatedAt")]
    pub generated_at: DateTime<Utc>,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    Restored { entries: usize },
}

struct Inner {
    contacts: HashMap<String, ContactRecord>,
    /// Checksum of the last successfully uploaded snapshot.
    last_uploaded: Option<String>,
    /// Backup keys that failed to decrypt this session.
    corrupt_backups: HashSet<String>,
}

/// The vault proper. Writes take the exclusive guard; reads clone out.
#[derive(Clone)]
pub struct ContactVault {
    inner: Arc<RwLock<Inner>>,
}

impl ContactVault {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                contacts: HashMap::new(),
                last_uploaded: None,
                corrupt_backups: HashSet::new(),
            })),
        }
    }

    /// Insert or replace a record, bumping `version` and `updatedAt`.
    pub async fn upsert_contact(&self, mut record: ContactRecord) {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.contacts.get(&record.peer_key) {
            record.version = existing.version + 1;
        } else {
            record.version = 1;
        }
        record.updated_at = Utc::now();
        inner.contacts.insert(record.peer_key.clone(), record);
    }

    pub async fn get(&self, peer_key: &str) -> Option<ContactRecord> {
        self.inner.read().await.contacts.get(peer_key).cloned()
    }

    pub async fn list(&self) -> Vec<ContactRecord> {
        let mut all: Vec<_> = self.inner.read().await.contacts.values().cloned().collect();
        all.sort_by(|a, b| a.peer_key.cmp(&b.peer_key));
        all
    }

    pub async fn remove(&self, peer_key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .contacts
            .remove(peer_key)
            .map(|_| ())
            .ok_or_else(|| StoreError::UnknownContact(peer_key.to_string()))
    }

    /// Replace the persisted DR state for a peer (atomic replace-state).
    pub async fn replace_dr_state(
        &self,
        peer_key: &str,
        state: DrState,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .contacts
            .get_mut(peer_key)
            .ok_or_else(|| StoreError::UnknownContact(peer_key.to_string()))?;
        record.dr_state = Some(state);
        record.version += 1;
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Pin a record as corrupt. Irreversible short of deleting the contact.
    pub async fn mark_corrupt(&self, peer_key: &str, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .contacts
            .get_mut(peer_key)
            .ok_or_else(|| StoreError::UnknownContact(peer_key.to_string()))?;
        tracing::warn!(
            target: "sentry_store",
            event = "contact_marked_corrupt",
            peer_key = %peer_key,
            reason = %reason
        );
        record.corrupt = Some(CorruptMark {
            reason: reason.to_string(),
            at: Utc::now(),
        });
        record.version += 1;
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Gate every send path: a corrupt record must never be reused.
    pub async fn ensure_usable(&self, peer_key: &str) -> Result<ContactRecord, StoreError> {
        let record = self
            .get(peer_key)
            .await
            .ok_or_else(|| StoreError::UnknownContact(peer_key.to_string()))?;
        if let Some(ref mark) = record.corrupt {
            return Err(StoreError::ContactCorrupt {
                peer_key: peer_key.to_string(),
                reason: mark.reason.clone(),
            });
        }
        Ok(record)
    }

    // ── Snapshots ────────────────────────────────────────────────────────

    pub async fn build_snapshot(&self) -> VaultSnapshot {
        VaultSnapshot {
            version: SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            contacts: self.list().await,
        }
    }

    /// SHA-256 hex over the contact content, independent of `generatedAt`
    /// so an unchanged vault keeps an unchanged checksum.
    pub fn compute_checksum(snapshot: &VaultSnapshot) -> Result<String, StoreError> {
        let content = serde_json::to_vec(&snapshot.contacts)?;
        Ok(hex::encode(kdf::sha256(&content)))
    }

    pub fn summarize(snapshot: &VaultSnapshot) -> Result<SnapshotSummary, StoreError> {
        let bytes = serde_json::to_vec(snapshot)?.len();
        Ok(SnapshotSummary {
            version: snapshot.version,
            entries: snapshot.contacts.len(),
            with_dr_state: snapshot
                .contacts
                .iter()
                .filter(|c| c.dr_state.is_some())
                .count(),
            generated_at: snapshot.generated_at,
            bytes,
        })
    }

    /// Upload gate, driven by an external scheduler:
    /// MK present is the caller's business; this checks content state only.
    pub async fn should_upload(&self, force: bool) -> Result<bool, StoreError> {
        let snapshot = self.build_snapshot().await;
        if force {
            return Ok(true);
        }
        let summary = Self::summarize(&snapshot)?;
        if summary.entries == 0 || summary.with_dr_state == 0 {
            return Ok(false);
        }
        let checksum = Self::compute_checksum(&snapshot)?;
        let inner = self.inner.read().await;
        Ok(inner.last_uploaded.as_deref() != Some(checksum.as_str()))
    }

    /// MK-wrap the current snapshot and record its checksum as uploaded.
    pub async fn seal_snapshot(&self, mk: &[u8; 32]) -> Result<SealedEnvelope, StoreError> {
        let snapshot = self.build_snapshot().await;
        let checksum = Self::compute_checksum(&snapshot)?;
        let sealed = envelope::wrap(
            &serde_json::to_vec(&snapshot)?,
            mk,
            InfoTag::ContactSecretsBackup,
        )?;
        let mut inner = self.inner.write().await;
        inner.last_uploaded = Some(checksum);
        Ok(sealed)
    }

    /// Import a snapshot. `replace` clears first; merge keeps the newer
    /// record per peerKey.
    pub async fn import_snapshot(
        &self,
        snapshot: VaultSnapshot,
        replace: bool,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        if replace {
            inner.contacts.clear();
        }
        let mut imported = 0usize;
        for record in snapshot.contacts {
            match inner.contacts.get(&record.peer_key) {
                Some(existing) if existing.updated_at >= record.updated_at => {}
                _ => {
                    inner.contacts.insert(record.peer_key.clone(), record);
                    imported += 1;
                }
            }
        }
        Ok(imported)
    }

    /// Hydrate from a fetched backup blob. A decrypt failure marks
    /// `backup_key` corrupt for the rest of the session.
    pub async fn hydrate(
        &self,
        mk: &[u8; 32],
        backup_key: &str,
        sealed: &SealedEnvelope,
    ) -> Result<VaultEvent, StoreError> {
        {
            let inner = self.inner.read().await;
            if inner.corrupt_backups.contains(backup_key) {
                return Err(StoreError::BackupCorrupt(backup_key.to_string()));
            }
        }
        if sealed.info != InfoTag::ContactSecretsBackup.as_str() {
            return Err(StoreError::Crypto(
                sentry_crypto::CryptoError::BadEnvelope(format!(
                    "expected contact-secrets/backup/v1, got {:?}",
                    sealed.info
                )),
            ));
        }

        let plaintext = match envelope::unwrap(sealed, mk) {
            Ok(pt) => pt,
            Err(e) => {
                let mut inner = self.inner.write().await;
                inner.corrupt_backups.insert(backup_key.to_string());
                tracing::error!(
                    target: "sentry_store",
                    event = "backup_decrypt_failed",
                    backup_key = %backup_key,
                    code = e.code()
                );
                return Err(e.into());
            }
        };

        let snapshot: VaultSnapshot = serde_json::from_slice(&plaintext)?;
        let entries = self.import_snapshot(snapshot, true).await?;
        tracing::info!(
            target: "sentry_store",
            event = "vault_restored",
            entries = entries
        );
        Ok(VaultEvent::Restored { entries })
    }

    /// Clear everything in memory (logout).
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.contacts.clear();
        inner.last_uploaded = None;
        inner.corrupt_backups.clear();
    }
}

impl Default for ContactVault {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentry_crypto::{b64, conversation};

    fn record(digest_byte: u8, device: &str) -> ContactRecord {
        let digest = hex::encode_upper([digest_byte; 32]);
        let token = conversation::derive_token(&[digest_byte; 32], device).unwrap();
        let now = Utc::now();
        ContactRecord {
            peer_key: format!("{digest}::{device}"),
            peer_account_digest: digest,
            peer_device_id: device.to_string(),
            conversation_id: conversation::conversation_id(&token),
            conversation_token: b64::encode(&token),
            role: Role::Initiator,
            dr_state: None,
            x3dh_pending: None,
            nickname: None,
            avatar_ref: None,
            added_at: now,
            updated_at: now,
            version: 0,
            corrupt: None,
        }
    }

    fn with_dr(mut r: ContactRecord) -> ContactRecord {
        use rand::rngs::OsRng;
        use x25519_dalek::{PublicKey, StaticSecret};
        let spk = StaticSecret::random_from_rng(OsRng);
        let state =
            DrState::init_sender([1u8; 32], &PublicKey::from(&spk), Role::Initiator).unwrap();
        r.dr_state = Some(state);
        r
    }

    #[tokio::test]
    async fn upsert_bumps_versions() {
        let vault = ContactVault::new();
        let r = record(1, "dev-a");
        let key = r.peer_key.clone();
        vault.upsert_contact(r.clone()).await;
        assert_eq!(vault.get(&key).await.unwrap().version, 1);
        vault.upsert_contact(r).await;
        assert_eq!(vault.get(&key).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn corrupt_contact_blocks_use() {
        let vault = ContactVault::new();
        let r = record(2, "dev-a");
        let key = r.peer_key.clone();
        vault.upsert_contact(r).await;
        vault.ensure_usable(&key).await.unwrap();

        vault.mark_corrupt(&key, "RATCHET_GAP_EXCEEDED").await.unwrap();
        let err = vault.ensure_usable(&key).await.unwrap_err();
        assert_eq!(err.code(), "CONTACT_CORRUPT");
        // The mark survives snapshots.
        let snap = vault.build_snapshot().await;
        assert!(snap.contacts[0].corrupt.is_some());
    }

    #[tokio::test]
    async fn snapshot_checksum_ignores_generation_time() {
        let vault = ContactVault::new();
        vault.upsert_contact(record(3, "dev-a")).await;
        let s1 = vault.build_snapshot().await;
        let s2 = vault.build_snapshot().await;
        assert_eq!(
            ContactVault::compute_checksum(&s1).unwrap(),
            ContactVault::compute_checksum(&s2).unwrap()
        );
    }

    #[tokio::test]
    async fn upload_gate_requires_dr_state_and_novelty() {
        let vault = ContactVault::new();
        // Empty vault: nothing to upload, force still wins.
        assert!(!vault.should_upload(false).await.unwrap());
        assert!(vault.should_upload(true).await.unwrap());

        // Entries but no DR state: still gated.
        vault.upsert_contact(record(4, "dev-a")).await;
        assert!(!vault.should_upload(false).await.unwrap());

        // DR state present: upload until the checksum is recorded.
        vault.upsert_contact(with_dr(record(5, "dev-b"))).await;
        assert!(vault.should_upload(false).await.unwrap());

        let mk = [9u8; 32];
        let _sealed = vault.seal_snapshot(&mk).await.unwrap();
        assert!(!vault.should_upload(false).await.unwrap());

        // Any change reopens the gate.
        vault.upsert_contact(with_dr(record(6, "dev-c"))).await;
        assert!(vault.should_upload(false).await.unwrap());
    }

    #[tokio::test]
    async fn hydrate_roundtrip_restores_contacts() {
        let mk = [7u8; 32];
        let vault = ContactVault::new();
        vault.upsert_contact(with_dr(record(8, "dev-a"))).await;
        vault.upsert_contact(record(9, "dev-b")).await;
        let sealed = vault.seal_snapshot(&mk).await.unwrap();

        let fresh = ContactVault::new();
        let event = fresh.hydrate(&mk, "backup-1", &sealed).await.unwrap();
        assert_eq!(event, VaultEvent::Restored { entries: 2 });
        assert_eq!(fresh.list().await.len(), 2);
        let summary = ContactVault::summarize(&fresh.build_snapshot().await).unwrap();
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.with_dr_state, 1);
        assert!(summary.bytes > 0);
    }

    #[tokio::test]
    async fn bad_backup_is_marked_and_never_retried() {
        let vault = ContactVault::new();
        vault.upsert_contact(record(10, "dev-a")).await;
        let sealed = vault.seal_snapshot(&[1u8; 32]).await.unwrap();

        let fresh = ContactVault::new();
        // Wrong MK: decrypt fails and the backup key is poisoned.
        let err = fresh.hydrate(&[2u8; 32], "backup-9", &sealed).await.unwrap_err();
        assert_eq!(err.code(), "ENVELOPE_DECRYPT_FAILED");
        // Even with the right MK, this session refuses the key.
        let err = fresh.hydrate(&[1u8; 32], "backup-9", &sealed).await.unwrap_err();
        assert_eq!(err.code(), "BACKUP_CORRUPT");
    }

    #[tokio::test]
    async fn merge_import_keeps_newer_records() {
        let vault = ContactVault::new();
        let mut old = record(11, "dev-a");
        old.nickname = Some("old".into());
        old.updated_at = Utc::now() - chrono::Duration::hours(1);
        let mut newer = old.clone();
        newer.nickname = Some("new".into());
        newer.updated_at = Utc::now();

        vault.upsert_contact(newer.clone()).await;
        let imported = vault
            .import_snapshot(
                VaultSnapshot {
                    version: SNAPSHOT_VERSION,
                    generated_at: Utc::now(),
                    contacts: vec![old],
                },
                false,
            )
            .await
            .unwrap();
        assert_eq!(imported, 0, "stale record does not overwrite");
        assert_eq!(
            vault.get(&newer.peer_key).await.unwrap().nickname.as_deref(),
            Some("new")
        );
    }
}
