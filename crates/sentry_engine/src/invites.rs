//! Friend invites: issuance, contact-share exchange, session bootstrap.
//!
//! The rendezvous: an owner-issued invite carries a 32-byte secret; both
//! ends derive the conversation token from it, bound to the owner's device
//! id (which travels inside the contact-share envelope). The share itself
//! is a `contact/v1` AEAD envelope keyed directly by the invite secret —
//! the one secret both sides hold before any session exists.
//!
//! On accept the guest derives the context, absorbs the owner's contact,
//! bootstraps the ratchet against the shared bundle, and answers with its
//! own contact-share as the first message of the conversation; the owner's
//! inbound path re-keys its placeholder record with the guest's identity.

use chrono::Utc;
use uuid::Uuid;

use sentry_crypto::{
    b64, conversation,
    envelope::{self, InfoTag},
    ratchet::{DrState, Role},
    x3dh,
};
use sentry_proto::{
    api::{peer_key as make_peer_key, validate_account_digest},
    invite::{ContactShare, Invite},
    message::MessageBody,
};
use sentry_store::contacts::ContactRecord;

use crate::{error::EngineError, status::SecureStatus, MessengerCore};

/// Profile fields a side may attach to its contact share.
#[derive(Debug, Clone, Default)]
pub struct ContactPayload {
    pub nickname: Option<String>,
    pub avatar_ref: Option<String>,
}

impl MessengerCore {
    /// Issue an invite and pre-derive the conversation context. The record
    /// starts as a placeholder until the guest identifies itself.
    pub async fn create_invite(&self, ttl_seconds: u64) -> Result<Invite, EngineError> {
        let account = self.account_state().await?;
        let mut invite = self
            .collab
            .invite_api
            .create_invite(&account.account_digest, ttl_seconds)
            .await?;

        let secret = b64::decode(&invite.secret).map_err(EngineError::Crypto)?;
        let token = conversation::derive_token(&secret, &account.device_id)?;
        let conversation_id = conversation::conversation_id(&token);
        let now = Utc::now();

        self.contacts
            .upsert_contact(ContactRecord {
                peer_account_digest: String::new(),
                peer_device_id: String::new(),
                peer_key: format!("invite::{}", invite.invite_id),
                conversation_id,
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
            })
            .await;

        {
            let guard = self.device.read().await;
            let device = guard.as_ref().ok_or(EngineError::NotLoggedIn)?;
            invite.prekey_bundle = Some(device.public_bundle());
        }

        tracing::info!(
            target: "sentry_engine",
            event = "invite_created",
            invite_id = %invite.invite_id,
            ttl_seconds = ttl_seconds
        );
        Ok(invite)
    }

    /// Attach the owner→guest contact envelope: identity, device binding,
    /// prekey bundle, and optional profile fields, sealed under the invite
    /// secret.
    pub async fn attach_invite_contact(
        &self,
        invite_id: &str,
        secret: &str,
        payload: &ContactPayload,
    ) -> Result<(), EngineError> {
        let account = self.account_state().await?;
        let secret_key =
            b64::decode_exact::<32>(secret).map_err(EngineError::Crypto)?;

        let share = {
            let guard = self.device.read().await;
            let device = guard.as_ref().ok_or(EngineError::NotLoggedIn)?;
            ContactShare {
                account_digest: account.account_digest.clone(),
                device_id: account.device_id.clone(),
                nickname: payload.nickname.clone(),
                avatar_ref: payload.avatar_ref.clone(),
                prekey_bundle: Some(device.public_bundle()),
            }
        };

        let sealed = envelope::wrap(
            &serde_json::to_vec(&share).map_err(sentry_proto::ProtoError::Serialisation)?,
            &secret_key,
            InfoTag::Contact,
        )?;
        self.collab
            .invite_api
            .attach_contact_envelope(invite_id, &sealed)
            .await
    }

    /// Guest side: accept an invite, derive the context, bootstrap the
    /// ratchet, and introduce ourselves with a contact-share message.
    pub async fn accept_invite(
        &self,
        invite_id: &str,
        secret: &str,
        payload: &ContactPayload,
    ) -> Result<ContactRecord, EngineError> {
        let account = self.account_state().await?;

        let invite = self.collab.invite_api.fetch_invite(invite_id).await?;
        if invite.expired_at(Utc::now()) {
            return Err(EngineError::InviteExpired);
        }

        let secret_key = b64::decode_exact::<32>(secret).map_err(EngineError::Crypto)?;
        let sealed = self
            .collab
            .invite_api
            .fetch_contact_envelope(invite_id)
            .await?
            .ok_or_else(|| {
                EngineError::Crypto(sentry_crypto::CryptoError::BadEnvelope(
                    "invite has no contact envelope".into(),
                ))
            })?;
        if sealed.info != InfoTag::Contact.as_str() {
            return Err(EngineError::Crypto(sentry_crypto::CryptoError::BadEnvelope(
                format!("expected contact/v1, got {:?}", sealed.info),
            )));
        }
        let share_bytes = envelope::unwrap(&sealed, &secret_key)?;
        let share: ContactShare = serde_json::from_slice(&share_bytes)
            .map_err(sentry_proto::ProtoError::Serialisation)?;

        let owner_digest = validate_account_digest(&share.account_digest)?;
        if owner_digest != validate_account_digest(&invite.owner_account_digest)? {
            return Err(EngineError::Crypto(sentry_crypto::CryptoError::BadEnvelope(
                "contact share does not match invite owner".into(),
            )));
        }

        // Token bound to the owner's device id — identical on both ends.
        let token = conversation::derive_token(&secret_key, &share.device_id)?;
        let conversation_id = conversation::conversation_id(&token);
        let peer_key = make_peer_key(&owner_digest, &share.device_id);
        let now = Utc::now();

        let mut record = ContactRecord {
            peer_account_digest: owner_digest,
            peer_device_id: share.device_id.clone(),
            peer_key: peer_key.clone(),
            conversation_id,
            conversation_token: b64::encode(&token),
            role: Role::Guest,
            dr_state: None,
            x3dh_pending: None,
            nickname: share.nickname.clone(),
            avatar_ref: share.avatar_ref.clone(),
            added_at: now,
            updated_at: now,
            version: 0,
            corrupt: None,
        };

        // Eager ratchet bootstrap against the bundle in the share.
        if let Some(ref bundle) = share.prekey_bundle {
            let outcome = {
                let guard = self.device.read().await;
                let device = guard.as_ref().ok_or(EngineError::NotLoggedIn)?;
                x3dh::initiate(&device.identity()?, bundle)?
            };
            record.dr_state = Some(DrState::init_sender(
                outcome.root_key,
                &outcome.peer_spk,
                Role::Guest,
            )?);
            record.x3dh_pending = Some(outcome.prologue);
        }

        self.contacts.upsert_contact(record.clone()).await;
        self.collab.invite_api.mark_accepted(invite_id).await?;
        self.status.transition(&peer_key, SecureStatus::Pending);

        // Introduce ourselves through the new conversation. A transport
        // hiccup here is not fatal to the accept: the share can be resent.
        let my_share = MessageBody::ContactShare {
            account_digest: account.account_digest.clone(),
            device_id: account.device_id.clone(),
            nickname: payload.nickname.clone(),
            avatar_ref: payload.avatar_ref.clone(),
        };
        if let Err(e) = self
            .send_with_replacement(&peer_key, my_share, Uuid::new_v4().to_string())
            .await
        {
            tracing::warn!(
                target: "sentry_engine",
                event = "accept_share_send_failed",
                invite_id = %invite_id,
                code = e.code()
            );
        }

        tracing::info!(
            target: "sentry_engine",
            event = "invite_accepted",
            invite_id = %invite_id,
            peer_key = %peer_key
        );

        self.contacts
            .get(&peer_key)
            .await
            .ok_or_else(|| EngineError::Store(sentry_store::StoreError::UnknownContact(peer_key)))
    }
}
