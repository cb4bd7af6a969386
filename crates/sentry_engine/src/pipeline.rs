//! Message pipeline: outbox, inbox, de-duplication, timeline.
//!
//! Outbound: composer precondition → DR encrypt → conversation envelope →
//! transport, with an optimistic timeline entry keyed by a fresh UUIDv4.
//! A server `COUNTER_TOO_LOW` rejection triggers the explicit replacement
//! path: the original is marked `failed(COUNTER_TOO_LOW_REPLACED)` and the
//! same plaintext flows again under a fresh message id. Nothing retries
//! silently.
//!
//! Inbound: outer envelope → DR → bounded processed-set de-dup → classify →
//! idempotent timeline upsert. Ratchet invariant violations are fatal for
//! the peer: the contact is marked corrupt and the conversation failed.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use uuid::Uuid;

use sentry_crypto::{
    b64, conversation,
    ratchet::{self, DrState, RatchetHeader},
    x3dh::{self, X3dhPrologue},
};
use sentry_proto::{
    api::{peer_key as make_peer_key, validate_account_digest, InboundMessage, SendReceipt},
    envelope::{ConversationEnvelope, DrPlaintext, MessageMeta, DR_PLAINTEXT_VERSION},
    message::{ControlAction, DeliveryState, MessageBody, TimelineEntry},
};
use sentry_store::contacts::ContactRecord;
use sentry_store::device::seal_device_priv;

use crate::{error::EngineError, status::SecureStatus, MessengerCore};

pub(crate) const REPLACED_REASON: &str = "COUNTER_TOO_LOW_REPLACED";

// ── Bounded de-dup set ───────────────────────────────────────────────────────

/// Idempotency guard keyed by (conversationId, messageId), FIFO-evicting.
pub struct ProcessedSet {
    cap: usize,
    seen: HashSet<(String, String)>,
    order: VecDeque<(String, String)>,
}

impl ProcessedSet {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, conversation_id: &str, message_id: &str) -> bool {
        self.seen
            .contains(&(conversation_id.to_string(), message_id.to_string()))
    }

    /// Record a processed message; false when it was already present.
    pub fn insert(&mut self, conversation_id: &str, message_id: &str) -> bool {
        let key = (conversation_id.to_string(), message_id.to_string());
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

// ── Timeline ─────────────────────────────────────────────────────────────────

/// Per-account message timeline; upserts are idempotent by message id.
pub struct Timeline {
    entries: HashMap<String, TimelineEntry>,
    order: Vec<String>,
}

impl Timeline {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn upsert(&mut self, entry: TimelineEntry) {
        if !self.entries.contains_key(&entry.message_id) {
            self.order.push(entry.message_id.clone());
        }
        self.entries.insert(entry.message_id.clone(), entry);
    }

    pub fn set_status(&mut self, message_id: &str, status: DeliveryState, reason: Option<String>) {
        if let Some(entry) = self.entries.get_mut(message_id) {
            entry.status = status;
            entry.reason = reason;
        }
    }

    pub fn get(&self, message_id: &str) -> Option<&TimelineEntry> {
        self.entries.get(message_id)
    }

    pub fn conversation(&self, conversation_id: &str) -> Vec<TimelineEntry> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|e| e.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

// ── Outbox / inbox ───────────────────────────────────────────────────────────

impl MessengerCore {
    /// Send a text message. `message_id` defaults to a fresh UUIDv4; passing
    /// the previous id after a `TRANSIENT` failure is the sanctioned retry.
    pub async fn send_text(
        &self,
        peer_account_digest: &str,
        peer_device_id: &str,
        text: &str,
        message_id: Option<String>,
    ) -> Result<SendReceipt, EngineError> {
        let digest = validate_account_digest(peer_account_digest)?;
        let peer_key = make_peer_key(&digest, peer_device_id);
        let message_id = message_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.send_with_replacement(
            &peer_key,
            MessageBody::Text {
                body: text.to_string(),
            },
            message_id,
        )
        .await
    }

    /// Send a media message. The object is wrapped under a random one-shot
    /// key carried inside the DR message; the sealed object comes back to
    /// the caller for upload under `object_key`. `progress` is
    /// observational only — it never touches ratchet state.
    pub async fn send_media(
        &self,
        peer_account_digest: &str,
        peer_device_id: &str,
        object_key: &str,
        mime_type: &str,
        object_bytes: &[u8],
        message_id: Option<String>,
        progress: Option<&(dyn Fn(f32) + Send + Sync)>,
    ) -> Result<(SendReceipt, sentry_crypto::envelope::SealedEnvelope), EngineError> {
        let digest = validate_account_digest(peer_account_digest)?;
        let peer_key = make_peer_key(&digest, peer_device_id);
        let message_id = message_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut wrap_key = [0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut wrap_key);
        let sealed_object = sentry_crypto::envelope::wrap(
            object_bytes,
            &wrap_key,
            sentry_crypto::envelope::InfoTag::Media,
        )?;
        if let Some(cb) = progress {
            cb(0.5);
        }

        let body = MessageBody::Media {
            object_key: object_key.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes: object_bytes.len() as u64,
            envelope: sealed_object.clone(),
            wrap_key: b64::encode(&wrap_key),
        };

        let receipt = self
            .send_with_replacement(&peer_key, body, message_id)
            .await?;
        if let Some(cb) = progress {
            cb(1.0);
        }
        Ok((receipt, sealed_object))
    }

    /// Shared outbound path with the explicit replacement-on-counter-too-low.
    pub(crate) async fn send_with_replacement(
        &self,
        peer_key: &str,
        body: MessageBody,
        message_id: String,
    ) -> Result<SendReceipt, EngineError> {
        let record = self.contacts.ensure_usable(peer_key).await?;
        self.timeline_optimistic(&record, &body, &message_id, None);

        match self.send_body(peer_key, &body, &message_id).await {
            Ok(receipt) => {
                self.mark_message(&message_id, DeliveryState::Sent, None);
                Ok(receipt)
            }
            Err(EngineError::CounterTooLow) => {
                tracing::warn!(
                    target: "sentry_engine",
                    event = "send_counter_too_low",
                    peer_key = %peer_key,
                    message_id = %message_id
                );
                self.mark_message(
                    &message_id,
                    DeliveryState::Failed,
                    Some(REPLACED_REASON.to_string()),
                );

                // Explicit re-send with a fresh id — never a silent retry.
                let replacement_id = Uuid::new_v4().to_string();
                self.timeline_optimistic(&record, &body, &replacement_id, Some(message_id.clone()));
                match self.send_body(peer_key, &body, &replacement_id).await {
                    Ok(mut receipt) => {
                        self.mark_message(&replacement_id, DeliveryState::Sent, None);
                        receipt.replaced_message_id = Some(message_id);
                        Ok(receipt)
                    }
                    Err(e) => {
                        self.mark_message(
                            &replacement_id,
                            DeliveryState::Failed,
                            Some(e.code().to_string()),
                        );
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.mark_message(&message_id, DeliveryState::Failed, Some(e.code().to_string()));
                Err(e)
            }
        }
    }

    /// One DR-encrypted send under the peer's exclusive lock.
    async fn send_body(
        &self,
        peer_key: &str,
        body: &MessageBody,
        message_id: &str,
    ) -> Result<SendReceipt, EngineError> {
        let account = self.account_state().await?;
        let _guard = self.arena.lock(peer_key).await;

        let mut record = self.contacts.ensure_usable(peer_key).await?;
        // Composer precondition: identity triplet complete.
        if record.conversation_id.is_empty() || record.conversation_token.is_empty() {
            return Err(EngineError::NotReady("conversation context missing".into()));
        }
        let token = b64::decode_exact::<32>(&record.conversation_token)
            .map_err(EngineError::Crypto)?;

        if record.dr_state.is_none() {
            self.status.transition(peer_key, SecureStatus::Pending);
            self.bootstrap_outbound_session(&mut record).await?;
        }

        // Step a clone; commit only the fully-advanced state.
        let mut state = record.dr_state.clone().ok_or_else(|| {
            EngineError::NotReady("ratchet state missing after bootstrap".into())
        })?;
        if !state.ready_to_send() {
            return Err(EngineError::NotReady("ratchet incomplete".into()));
        }
        let (header, message_key) = state.encrypt_step()?;
        let counter = header.counter;

        let body_json = serde_json::to_vec(body).map_err(|e| {
            EngineError::Proto(sentry_proto::ProtoError::Serialisation(e))
        })?;
        let ciphertext = ratchet::encrypt_body(&message_key, &body_json)?;

        let plaintext = DrPlaintext {
            v: DR_PLAINTEXT_VERSION,
            hdr_b64: header.encode()?,
            ct_b64: b64::encode(&ciphertext),
            meta: MessageMeta {
                ts: Utc::now().timestamp_millis(),
                sender_fingerprint: conversation::access_fingerprint(
                    &token,
                    &account.account_digest,
                ),
                msg_type: body.msg_type(),
            },
            x3dh: record.x3dh_pending.clone(),
        };
        let (iv, payload) = conversation::seal(&token, &plaintext.to_bytes()?)?;
        let envelope = ConversationEnvelope::from_parts(iv, &payload);

        // The counter and message key are burned whatever the transport
        // says, so the advanced state commits first.
        self.contacts.replace_dr_state(peer_key, state).await?;

        tracing::debug!(
            target: "sentry_engine",
            event = "send_message",
            peer_key = %peer_key,
            message_id = %message_id,
            counter = counter
        );

        let ack = self
            .collab
            .transport
            .send_conversation(&record.conversation_id, &envelope, message_id, counter)
            .await?;

        self.status.transition(peer_key, SecureStatus::Ready);

        Ok(SendReceipt {
            conv_id: record.conversation_id.clone(),
            server_message_id: ack.server_message_id,
            counter,
            message_id: message_id.to_string(),
            replaced_message_id: None,
        })
    }

    /// Notify the peer of an unrecoverable session error, then pin the
    /// contact locally. The send goes first — a corrupt record refuses it.
    pub async fn send_session_error(
        &self,
        peer_key: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        let body = MessageBody::Control {
            action: ControlAction::SessionError {
                reason: reason.to_string(),
            },
        };
        if let Err(e) = self
            .send_with_replacement(peer_key, body, Uuid::new_v4().to_string())
            .await
        {
            tracing::warn!(
                target: "sentry_engine",
                event = "session_error_notify_failed",
                peer_key = %peer_key,
                code = e.code()
            );
        }
        self.fail_peer(peer_key, reason).await;
        Ok(())
    }

    /// Ask the peer to reset the secure conversation state.
    pub async fn send_reset(&self, peer_key: &str) -> Result<SendReceipt, EngineError> {
        self.send_with_replacement(
            peer_key,
            MessageBody::Control {
                action: ControlAction::Reset,
            },
            Uuid::new_v4().to_string(),
        )
        .await
    }

    /// Lazy X3DH as the sending side, against the peer's published bundle.
    async fn bootstrap_outbound_session(
        &self,
        record: &mut ContactRecord,
    ) -> Result<(), EngineError> {
        let bundle = self
            .collab
            .account_api
            .fetch_peer_bundle(&record.peer_account_digest, &record.peer_device_id)
            .await?;
        let outcome = {
            let guard = self.device.read().await;
            let device = guard.as_ref().ok_or(EngineError::NotLoggedIn)?;
            x3dh::initiate(&device.identity()?, &bundle)?
        };
        let state = DrState::init_sender(outcome.root_key, &outcome.peer_spk, record.role)?;
        record.dr_state = Some(state);
        record.x3dh_pending = Some(outcome.prologue);
        self.contacts.upsert_contact(record.clone()).await;
        Ok(())
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// Decrypt one inbound unit. `Ok(None)` means an idempotent duplicate
    /// or an intentionally dropped message.
    pub async fn on_inbound_message(
        &self,
        inbound: &InboundMessage,
    ) -> Result<Option<TimelineEntry>, EngineError> {
        let record = self
            .find_by_conversation(&inbound.conversation_id)
            .await
            .ok_or_else(|| {
                EngineError::Store(sentry_store::StoreError::UnknownContact(
                    inbound.conversation_id.clone(),
                ))
            })?;
        let peer_key = record.peer_key.clone();
        self.contacts.ensure_usable(&peer_key).await?;

        // Idempotency first: a duplicate must not touch the ratchet.
        if self
            .processed
            .lock()
            .expect("processed lock")
            .contains(&inbound.conversation_id, &inbound.message_id)
        {
            return Ok(None);
        }

        let token =
            b64::decode_exact::<32>(&record.conversation_token).map_err(EngineError::Crypto)?;
        let (iv, outer_ct) = inbound.envelope.to_parts()?;
        let payload = conversation::open(&token, &iv, &outer_ct)?;
        let plaintext = DrPlaintext::parse(&payload)?;
        let header = RatchetHeader::decode(&plaintext.hdr_b64)?;

        let _guard = self.arena.lock(&peer_key).await;
        let mut record = self.contacts.ensure_usable(&peer_key).await?;

        let mut state = match record.dr_state.clone() {
            Some(state) => state,
            None => match self
                .bootstrap_inbound_session(&record, plaintext.x3dh.as_ref())
                .await
            {
                Ok(state) => state,
                Err(e) => {
                    self.fail_peer(&peer_key, e.code()).await;
                    return Err(e);
                }
            },
        };

        let message_key = match state.decrypt_step(&header) {
            Ok(mk) => mk,
            Err(e) => {
                return match e {
                    sentry_crypto::CryptoError::GapExceeded(_)
                    | sentry_crypto::CryptoError::RatchetInvariant(_) => {
                        self.fail_peer(&peer_key, e.code()).await;
                        Err(e.into())
                    }
                    // COUNTER_TOO_LOW, DECRYPT_FAILED etc.: drop the
                    // message, keep the session; no state was committed.
                    other => Err(other.into()),
                };
            }
        };

        let body_bytes = ratchet::decrypt_body(&message_key, &b64::decode(&plaintext.ct_b64)?)?;
        let body: MessageBody = serde_json::from_slice(&body_bytes)
            .map_err(sentry_proto::ProtoError::Serialisation)?;

        // Full success: atomic replace-state, prologue no longer owed.
        record.dr_state = Some(state);
        record.x3dh_pending = None;
        let record = self.absorb_inbound_body(record, &body).await;
        let peer_key = record.peer_key.clone();
        self.contacts.upsert_contact(record).await;

        self.processed
            .lock()
            .expect("processed lock")
            .insert(&inbound.conversation_id, &inbound.message_id);

        match &body {
            MessageBody::Control {
                action: ControlAction::SessionError { reason },
            } => {
                self.fail_peer(&peer_key, reason).await;
            }
            MessageBody::Control {
                action: ControlAction::Reset,
            } => {
                self.status.reset(&peer_key);
            }
            _ => {
                self.status.transition(&peer_key, SecureStatus::Ready);
            }
        }

        let entry = TimelineEntry {
            message_id: inbound.message_id.clone(),
            conversation_id: inbound.conversation_id.clone(),
            outgoing: false,
            msg_type: plaintext.meta.msg_type,
            body,
            status: DeliveryState::Sent,
            reason: None,
            ts: inbound.ts,
            counter: Some(header.counter),
            replaces_message_id: None,
        };
        self.timeline
            .lock()
            .expect("timeline lock")
            .upsert(entry.clone());

        Ok(Some(entry))
    }

    /// First inbound message on a fresh session: mirror X3DH from the
    /// prologue, consuming the named one-time prekey.
    async fn bootstrap_inbound_session(
        &self,
        record: &ContactRecord,
        prologue: Option<&X3dhPrologue>,
    ) -> Result<DrState, EngineError> {
        let prologue = prologue.ok_or_else(|| {
            EngineError::Crypto(sentry_crypto::CryptoError::RatchetInvariant(
                "first inbound message without X3DH prologue".into(),
            ))
        })?;

        let account = self.account_state().await?;
        let mk = self.require_mk().await?;

        let mut guard = self.device.write().await;
        let device = guard.as_mut().ok_or(EngineError::NotLoggedIn)?;
        let root_key = x3dh::respond(device, prologue)?;
        let spk_secret = device.spk_secret()?;

        // The consumed OPK must not survive a restart: persist the blob
        // before any message key derives from this session.
        let sealed = seal_device_priv(&mk, device)?;
        self.collab
            .blob_store
            .put(&Self::device_blob_key(&account.account_digest), &sealed)
            .await?;

        Ok(DrState::init_receiver(root_key, &spk_secret, record.role))
    }

    /// Contact-share bodies enrich (or re-key) the vault record.
    async fn absorb_inbound_body(
        &self,
        mut record: ContactRecord,
        body: &MessageBody,
    ) -> ContactRecord {
        if let MessageBody::ContactShare {
            account_digest,
            device_id,
            nickname,
            avatar_ref,
        } = body
        {
            if record.peer_account_digest.is_empty() {
                // Invite placeholder: the guest just identified itself.
                let old_key = record.peer_key.clone();
                record.peer_account_digest = account_digest.clone();
                record.peer_device_id = device_id.clone();
                record.peer_key = make_peer_key(account_digest, device_id);
                let _ = self.contacts.remove(&old_key).await;
                self.arena.forget(&old_key).await;
            }
            if nickname.is_some() {
                record.nickname = nickname.clone();
            }
            if avatar_ref.is_some() {
                record.avatar_ref = avatar_ref.clone();
            }
        }
        record
    }

    async fn find_by_conversation(&self, conversation_id: &str) -> Option<ContactRecord> {
        self.contacts
            .list()
            .await
            .into_iter()
            .find(|r| r.conversation_id == conversation_id)
    }

    /// Fatal per-peer failure: corrupt mark + failed status. Further sends
    /// are rejected until an explicit reset deletes the conversation.
    async fn fail_peer(&self, peer_key: &str, reason: &str) {
        if let Err(e) = self.contacts.mark_corrupt(peer_key, reason).await {
            tracing::error!(
                target: "sentry_engine",
                event = "mark_corrupt_failed",
                peer_key = %peer_key,
                code = e.code()
            );
        }
        self.status.transition(peer_key, SecureStatus::Failed);
    }

    fn timeline_optimistic(
        &self,
        record: &ContactRecord,
        body: &MessageBody,
        message_id: &str,
        replaces: Option<String>,
    ) {
        let entry = TimelineEntry {
            message_id: message_id.to_string(),
            conversation_id: record.conversation_id.clone(),
            outgoing: true,
            msg_type: body.msg_type(),
            body: body.clone(),
            status: DeliveryState::Sending,
            reason: None,
            ts: Utc::now().timestamp_millis(),
            counter: None,
            replaces_message_id: replaces,
        };
        self.timeline.lock().expect("timeline lock").upsert(entry);
    }

    fn mark_message(&self, message_id: &str, status: DeliveryState, reason: Option<String>) {
        self.timeline
            .lock()
            .expect("timeline lock")
            .set_status(message_id, status, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentry_proto::message::MsgType;

    #[test]
    fn processed_set_is_idempotent_and_bounded() {
        let mut set = ProcessedSet::new(3);
        assert!(set.insert("c1", "m1"));
        assert!(!set.insert("c1", "m1"), "second apply is a duplicate");
        assert!(set.insert("c1", "m2"));
        assert!(set.insert("c1", "m3"));
        assert!(set.insert("c1", "m4"), "eviction keeps accepting");
        assert!(
            !set.contains("c1", "m1"),
            "oldest entry evicted at capacity"
        );
        assert!(set.contains("c1", "m4"));
    }

    #[test]
    fn processed_set_keys_on_conversation_too() {
        let mut set = ProcessedSet::new(8);
        assert!(set.insert("c1", "m1"));
        assert!(set.insert("c2", "m1"), "same id in another conversation");
    }

    #[test]
    fn timeline_upsert_is_idempotent() {
        let mut timeline = Timeline::new();
        let entry = TimelineEntry {
            message_id: "m1".into(),
            conversation_id: "c1".into(),
            outgoing: true,
            msg_type: MsgType::Text,
            body: MessageBody::Text { body: "hi".into() },
            status: DeliveryState::Sending,
            reason: None,
            ts: 1,
            counter: None,
            replaces_message_id: None,
        };
        timeline.upsert(entry.clone());
        timeline.upsert(entry);
        assert_eq!(timeline.conversation("c1").len(), 1);

        timeline.set_status("m1", DeliveryState::Sent, None);
        assert_eq!(timeline.get("m1").unwrap().status, DeliveryState::Sent);
    }
}
