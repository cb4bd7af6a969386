//! External collaborators.
//!
//! The core is transport-, server-, and storage-agnostic: everything that
//! crosses a network or touches a disk goes through one of these traits.
//! Implementations decide their own retry policy for `TRANSIENT` failures;
//! the core never retries.

use async_trait::async_trait;

use sentry_crypto::{envelope::SealedEnvelope, prekeys::PrekeyBundle};
use sentry_proto::{
    api::{SdmExchange, SdmParams, SendAck},
    envelope::ConversationEnvelope,
    invite::Invite,
    signal::CallSignal,
};
use sentry_store::contacts::SnapshotSummary;

use crate::error::EngineError;

/// Account server: SDM challenge exchange, OPAQUE message ferrying, device
/// registration, prekey directory.
#[async_trait]
pub trait AccountApi: Send + Sync {
    /// Server-side SDM verification; fails `SDM_BAD_MAC` on a bad tag MAC.
    async fn exchange_from_sdm(&self, params: &SdmParams) -> Result<SdmExchange, EngineError>;

    async fn opaque_register_start(
        &self,
        account_digest: &str,
        request: Vec<u8>,
    ) -> Result<Vec<u8>, EngineError>;

    async fn opaque_register_finish(
        &self,
        account_digest: &str,
        upload: Vec<u8>,
    ) -> Result<(), EngineError>;

    async fn opaque_login_start(
        &self,
        account_digest: &str,
        request: Vec<u8>,
    ) -> Result<Vec<u8>, EngineError>;

    async fn opaque_login_finish(
        &self,
        account_digest: &str,
        finalization: Vec<u8>,
    ) -> Result<(), EngineError>;

    /// Register this installation; returns the stable per-device id.
    async fn register_device(&self, account_digest: &str) -> Result<String, EngineError>;

    async fn publish_prekeys(
        &self,
        account_digest: &str,
        device_id: &str,
        bundle: &PrekeyBundle,
    ) -> Result<(), EngineError>;

    async fn fetch_peer_bundle(
        &self,
        peer_account_digest: &str,
        peer_device_id: &str,
    ) -> Result<PrekeyBundle, EngineError>;
}

/// Invite rendezvous server.
#[async_trait]
pub trait InviteApi: Send + Sync {
    async fn create_invite(
        &self,
        owner_account_digest: &str,
        ttl_seconds: u64,
    ) -> Result<Invite, EngineError>;

    async fn attach_contact_envelope(
        &self,
        invite_id: &str,
        envelope: &SealedEnvelope,
    ) -> Result<(), EngineError>;

    async fn fetch_invite(&self, invite_id: &str) -> Result<Invite, EngineError>;

    async fn fetch_contact_envelope(
        &self,
        invite_id: &str,
    ) -> Result<Option<SealedEnvelope>, EngineError>;

    /// Single-acceptor enforcement lives server-side; a second accept fails.
    async fn mark_accepted(&self, invite_id: &str) -> Result<(), EngineError>;
}

/// Message and signal transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ship one conversation envelope. May fail `TRANSIENT` or
    /// `COUNTER_TOO_LOW` (server high-water rejection).
    async fn send_conversation(
        &self,
        conversation_id: &str,
        envelope: &ConversationEnvelope,
        message_id: &str,
        counter: u64,
    ) -> Result<SendAck, EngineError>;

    async fn send_signal(&self, peer_key: &str, signal: &CallSignal) -> Result<(), EngineError>;
}

/// Backup storage for the MK-wrapped contact-secret snapshot.
#[async_trait]
pub trait BackupApi: Send + Sync {
    async fn upload_backup(
        &self,
        sealed: &SealedEnvelope,
        summary: &SnapshotSummary,
    ) -> Result<(), EngineError>;

    /// Most recent backup, with an opaque key identifying it.
    async fn fetch_latest_backup(
        &self,
    ) -> Result<Option<(String, SealedEnvelope)>, EngineError>;
}

/// Adapter for MK-wrapped blobs (device keys and friends).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, sealed: &SealedEnvelope) -> Result<(), EngineError>;
    async fn get(&self, key: &str) -> Result<Option<SealedEnvelope>, EngineError>;
}
