//! The engine facade: one `MessengerCore` per logged-in account process.
//!
//! All shared mutable state (MK vault, contact vault, DR arena, processed
//! set, call table) hangs off this struct and is reached through explicit
//! handles — no ambient singletons. The UI, transport, and storage sides
//! talk to the collaborator traits in `traits.rs`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, RwLock};

use sentry_crypto::prekeys::DevicePriv;
use sentry_proto::signal::CallCapabilities;
use sentry_store::{contacts::ContactVault, vault::MasterKeyVault};

use crate::{
    call_manager::CallMediaState,
    error::EngineError,
    pipeline::{ProcessedSet, Timeline},
    sessions::SessionArena,
    status::StatusBoard,
    traits::{AccountApi, BackupApi, BlobStore, InviteApi, Transport},
};

/// Everything the core needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub account_api: Arc<dyn AccountApi>,
    pub invite_api: Arc<dyn InviteApi>,
    pub transport: Arc<dyn Transport>,
    pub backup_api: Arc<dyn BackupApi>,
    pub blob_store: Arc<dyn BlobStore>,
}

#[derive(Debug, Clone)]
pub struct AccountState {
    pub account_digest: String,
    pub account_token: String,
    pub device_id: String,
}

pub struct MessengerCore {
    pub(crate) collab: Collaborators,
    pub(crate) mk: MasterKeyVault,
    pub(crate) contacts: ContactVault,
    pub(crate) arena: SessionArena,
    pub(crate) status: StatusBoard,
    pub(crate) account: RwLock<Option<AccountState>>,
    pub(crate) device: RwLock<Option<DevicePriv>>,
    pub(crate) timeline: StdMutex<Timeline>,
    pub(crate) processed: StdMutex<ProcessedSet>,
    pub(crate) calls: Mutex<HashMap<String, CallMediaState>>,
    pub(crate) local_capabilities: CallCapabilities,
}

/// Bound on the processed-message dedup set.
pub(crate) const PROCESSED_SET_CAP: usize = 4096;

impl MessengerCore {
    pub fn new(collab: Collaborators, local_capabilities: CallCapabilities) -> Self {
        Self {
            collab,
            mk: MasterKeyVault::new(),
            contacts: ContactVault::new(),
            arena: SessionArena::new(),
            status: StatusBoard::new(),
            account: RwLock::new(None),
            device: RwLock::new(None),
            timeline: StdMutex::new(Timeline::new()),
            processed: StdMutex::new(ProcessedSet::new(PROCESSED_SET_CAP)),
            calls: Mutex::new(HashMap::new()),
            local_capabilities,
        }
    }

    pub(crate) async fn account_state(&self) -> Result<AccountState, EngineError> {
        self.account
            .read()
            .await
            .clone()
            .ok_or(EngineError::NotLoggedIn)
    }

    /// Copy of the MK for a wrapping operation. Fails when logged out.
    pub(crate) async fn require_mk(&self) -> Result<[u8; 32], EngineError> {
        Ok(self.mk.with_key(|k| Ok(*k)).await?)
    }

    pub(crate) fn device_blob_key(account_digest: &str) -> String {
        format!("devkeys/v1/{account_digest}")
    }

    // ── Status surface (C12) ─────────────────────────────────────────────

    pub fn secure_status(&self, peer_key: &str) -> crate::status::SecureStatus {
        self.status.get(peer_key)
    }

    pub fn subscribe_status<F>(&self, listener: F)
    where
        F: Fn(&str, crate::status::SecureStatus, crate::status::SecureStatus)
            + Send
            + Sync
            + 'static,
    {
        self.status.subscribe(listener)
    }

    /// Explicit recovery from `failed`; the only path out of it.
    pub fn reset_status(&self, peer_key: &str) {
        self.status.reset(peer_key)
    }

    /// Pin a contact as corrupt (e.g. on an out-of-band session error).
    /// Sends to it fail `CONTACT_CORRUPT` until the conversation is deleted.
    pub async fn mark_contact_corrupt(
        &self,
        peer_key: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        self.contacts.mark_corrupt(peer_key, reason).await?;
        self.status
            .transition(peer_key, crate::status::SecureStatus::Failed);
        Ok(())
    }

    // ── Timeline surface ─────────────────────────────────────────────────

    pub fn conversation_timeline(
        &self,
        conversation_id: &str,
    ) -> Vec<sentry_proto::message::TimelineEntry> {
        self.timeline
            .lock()
            .expect("timeline lock")
            .conversation(conversation_id)
    }

    // ── Vault pass-throughs (scheduler is external, no timers here) ──────

    pub async fn build_snapshot(&self) -> sentry_store::contacts::VaultSnapshot {
        self.contacts.build_snapshot().await
    }

    pub async fn import_snapshot(
        &self,
        snapshot: sentry_store::contacts::VaultSnapshot,
        replace: bool,
    ) -> Result<usize, EngineError> {
        Ok(self.contacts.import_snapshot(snapshot, replace).await?)
    }

    /// Upload gate: MK present AND (force OR content-driven novelty).
    pub async fn should_upload_backup(&self, force: bool) -> Result<bool, EngineError> {
        if self.mk.is_locked().await {
            return Ok(false);
        }
        Ok(self.contacts.should_upload(force).await?)
    }

    /// Wrap and ship the current snapshot through the backup collaborator.
    pub async fn upload_backup(&self, force: bool) -> Result<bool, EngineError> {
        if !self.should_upload_backup(force).await? {
            return Ok(false);
        }
        let mk = self.require_mk().await?;
        let snapshot = self.contacts.build_snapshot().await;
        let summary = ContactVault::summarize(&snapshot).map_err(EngineError::Store)?;
        let sealed = self.contacts.seal_snapshot(&mk).await?;
        self.collab.backup_api.upload_backup(&sealed, &summary).await?;
        tracing::info!(
            target: "sentry_engine",
            event = "backup_uploaded",
            entries = summary.entries,
            bytes = summary.bytes
        );
        Ok(true)
    }

    // ── Conversation lifecycle ───────────────────────────────────────────

    /// Explicit "delete conversation": the only destructor for a contact.
    pub async fn delete_conversation(&self, peer_key: &str) -> Result<(), EngineError> {
        self.contacts.remove(peer_key).await?;
        self.arena.forget(peer_key).await;
        self.status.reset(peer_key);
        Ok(())
    }

    // ── Logout ───────────────────────────────────────────────────────────

    /// Zeroize the MK and drop every in-memory secret.
    pub async fn logout(&self) {
        self.mk.lock().await;
        self.contacts.clear().await;
        *self.account.write().await = None;
        *self.device.write().await = None;
        self.calls.lock().await.clear();
        self.timeline.lock().expect("timeline lock").clear();
        self.processed.lock().expect("processed lock").clear();
        tracing::info!(target: "sentry_engine", event = "logout");
    }
}
