//! Per-call media state machine.
//!
//! Status flow: {idle → key_pending → ready}, ready ↔ rotating around an
//! epoch bump, any → failed, and `skipped` when the peer advertises no
//! insertable-streams capability (media then flows unencrypted — explicit,
//! surfaced, never silent). Transitions are monotone within a call except
//! rotating → ready.
//!
//! Senders MUST NOT encrypt until the receiver-side transform is confirmed:
//! encoded-stream transforms cannot attach late, so the tx path is gated on
//! `confirm_receiver_transform`.

use chrono::{DateTime, Utc};
use rand::RngCore;
use uuid::Uuid;

use sentry_crypto::{
    b64,
    calls::{self, CallKeySet, CallRole},
    frame::FrameCipher,
};
use sentry_proto::signal::{
    CallCapabilities, CallKeyEnvelope, CallKind, CallSignal, MediaDescription,
};

use crate::{error::EngineError, MessengerCore};

/// Minimum spacing the external scheduler should keep between automatic
/// epoch rotations.
pub const ROTATION_INTERVAL_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    KeyPending,
    Ready,
    Rotating,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Tx,
    Rx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

pub(crate) struct CallCiphers {
    audio_tx: FrameCipher,
    audio_rx: FrameCipher,
    video_tx: FrameCipher,
    video_rx: FrameCipher,
}

impl CallCiphers {
    fn from_keys(keys: &CallKeySet) -> Self {
        Self {
            audio_tx: FrameCipher::new(&keys.audio_tx),
            audio_rx: FrameCipher::new(&keys.audio_rx),
            video_tx: FrameCipher::new(&keys.video_tx),
            video_rx: FrameCipher::new(&keys.video_rx),
        }
    }

    fn pick(&mut self, direction: FrameDirection, kind: MediaKind) -> &mut FrameCipher {
        match (direction, kind) {
            (FrameDirection::Tx, MediaKind::Audio) => &mut self.audio_tx,
            (FrameDirection::Rx, MediaKind::Audio) => &mut self.audio_rx,
            (FrameDirection::Tx, MediaKind::Video) => &mut self.video_tx,
            (FrameDirection::Rx, MediaKind::Video) => &mut self.video_rx,
        }
    }
}

pub struct CallMediaState {
    pub call_id: String,
    pub peer_key: String,
    pub kind: CallKind,
    pub role: CallRole,
    pub epoch: u32,
    pub cmk_salt: [u8; 32],
    pub cmk_proof: [u8; 32],
    pub status: CallStatus,
    pub media: MediaDescription,
    pub peer_capabilities: Option<CallCapabilities>,
    pub receiver_confirmed: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub(crate) ciphers: Option<CallCiphers>,
}

impl CallMediaState {
    /// Monotone within a call, except rotating → ready after epoch++.
    fn allowed(from: CallStatus, to: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (from, to),
            (Idle, KeyPending)
                | (Idle, Ready)
                | (KeyPending, Ready)
                | (KeyPending, Skipped)
                | (Ready, Rotating)
                | (Rotating, Ready)
                | (Ready, Skipped)
                | (Idle, Failed)
                | (KeyPending, Failed)
                | (Ready, Failed)
                | (Rotating, Failed)
        )
    }

    fn set_status(&mut self, to: CallStatus) -> Result<(), EngineError> {
        if self.status == to {
            return Ok(());
        }
        if !Self::allowed(self.status, to) {
            return Err(EngineError::CallState(format!(
                "{:?} -> {:?} not permitted",
                self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }
}

impl MessengerCore {
    /// Caller side: derive the epoch-1 key set, build the key envelope, and
    /// send the invite signal. Returns (callId, envelope signal).
    pub async fn start_call(
        &self,
        peer_key: &str,
        kind: CallKind,
    ) -> Result<(String, CallSignal), EngineError> {
        let record = self.contacts.ensure_usable(peer_key).await?;
        let token =
            b64::decode_exact::<32>(&record.conversation_token).map_err(EngineError::Crypto)?;

        let call_id = Uuid::new_v4().to_string();
        let epoch = 1u32;
        let mut cmk_salt = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut cmk_salt);

        let keys = calls::derive_call_keys(&token, &call_id, epoch, &cmk_salt, CallRole::Caller)?;
        let media = MediaDescription::for_kind(kind);
        let envelope = CallKeyEnvelope::new(
            call_id.clone(),
            epoch,
            &cmk_salt,
            &keys.cmk_proof,
            media,
            self.local_capabilities,
        );

        let mut state = CallMediaState {
            call_id: call_id.clone(),
            peer_key: peer_key.to_string(),
            kind,
            role: CallRole::Caller,
            epoch,
            cmk_salt,
            cmk_proof: keys.cmk_proof,
            status: CallStatus::KeyPending,
            media,
            peer_capabilities: None,
            receiver_confirmed: false,
            created_at: Utc::now(),
            rotated_at: None,
            ciphers: Some(CallCiphers::from_keys(&keys)),
        };
        state.set_status(CallStatus::Ready)?;

        let signal = CallSignal::Invite {
            call_id: call_id.clone(),
            kind,
            envelope,
        };
        self.collab.transport.send_signal(peer_key, &signal).await?;
        self.calls.lock().await.insert(call_id.clone(), state);

        tracing::info!(
            target: "sentry_engine",
            event = "call_started",
            call_id = %call_id,
            peer_key = %peer_key
        );
        Ok((call_id, signal))
    }

    /// Inbound signalling: invite, accept, rotation, end.
    pub async fn handle_call_signal(
        &self,
        from_peer_key: &str,
        signal: &CallSignal,
    ) -> Result<(), EngineError> {
        match signal {
            CallSignal::Invite {
                call_id,
                kind,
                envelope,
            } => {
                self.handle_call_invite(from_peer_key, call_id, *kind, envelope)
                    .await
            }
            CallSignal::Accept {
                call_id,
                capabilities,
            } => {
                let mut calls = self.calls.lock().await;
                let state = calls
                    .get_mut(call_id)
                    .ok_or_else(|| EngineError::UnknownCall(call_id.clone()))?;
                state.peer_capabilities = Some(*capabilities);
                if !capabilities.insertable_streams {
                    state.set_status(CallStatus::Skipped)?;
                    tracing::warn!(
                        target: "sentry_engine",
                        event = "call_e2e_skipped",
                        call_id = %call_id
                    );
                }
                Ok(())
            }
            CallSignal::RotateKeys { call_id, envelope } => {
                self.handle_rotation(call_id, envelope).await
            }
            CallSignal::End { call_id } => {
                self.calls.lock().await.remove(call_id);
                Ok(())
            }
        }
    }

    async fn handle_call_invite(
        &self,
        from_peer_key: &str,
        call_id: &str,
        kind: CallKind,
        envelope: &CallKeyEnvelope,
    ) -> Result<(), EngineError> {
        let record = self.contacts.ensure_usable(from_peer_key).await?;
        let token =
            b64::decode_exact::<32>(&record.conversation_token).map_err(EngineError::Crypto)?;
        let (cmk_salt, cmk_proof) = envelope.validate()?;

        let mut state = CallMediaState {
            call_id: call_id.to_string(),
            peer_key: from_peer_key.to_string(),
            kind,
            role: CallRole::Callee,
            epoch: envelope.epoch,
            cmk_salt,
            cmk_proof,
            status: CallStatus::KeyPending,
            media: envelope.media,
            peer_capabilities: Some(envelope.capabilities),
            receiver_confirmed: false,
            created_at: Utc::now(),
            rotated_at: None,
            ciphers: None,
        };

        // Proof mismatch: reject the call before any key is installed.
        if let Err(e) =
            calls::verify_cmk_proof(&token, call_id, envelope.epoch, &cmk_salt, &cmk_proof)
        {
            state.status = CallStatus::Failed;
            self.calls.lock().await.insert(call_id.to_string(), state);
            tracing::error!(
                target: "sentry_engine",
                event = "call_proof_mismatch",
                call_id = %call_id
            );
            return Err(e.into());
        }

        let keys =
            calls::derive_call_keys(&token, call_id, envelope.epoch, &cmk_salt, CallRole::Callee)?;
        state.ciphers = Some(CallCiphers::from_keys(&keys));

        if !envelope.capabilities.insertable_streams || !self.local_capabilities.insertable_streams
        {
            state.set_status(CallStatus::Skipped)?;
        } else {
            state.set_status(CallStatus::Ready)?;
        }
        self.calls.lock().await.insert(call_id.to_string(), state);
        Ok(())
    }

    /// Callee accepts: answer with our capabilities.
    pub async fn accept_call(&self, call_id: &str) -> Result<CallSignal, EngineError> {
        let peer_key = {
            let calls = self.calls.lock().await;
            let state = calls
                .get(call_id)
                .ok_or_else(|| EngineError::UnknownCall(call_id.to_string()))?;
            if state.status == CallStatus::Failed {
                return Err(EngineError::CallState("call already failed".into()));
            }
            state.peer_key.clone()
        };
        let signal = CallSignal::Accept {
            call_id: call_id.to_string(),
            capabilities: self.local_capabilities,
        };
        self.collab.transport.send_signal(&peer_key, &signal).await?;
        Ok(signal)
    }

    /// The receiver-side transform attached successfully; tx may encrypt.
    pub async fn confirm_receiver_transform(&self, call_id: &str) -> Result<(), EngineError> {
        let mut calls = self.calls.lock().await;
        let state = calls
            .get_mut(call_id)
            .ok_or_else(|| EngineError::UnknownCall(call_id.to_string()))?;
        state.receiver_confirmed = true;
        Ok(())
    }

    /// Explicit epoch rotation (the 10-minute cadence is the scheduler's
    /// job; see `ROTATION_INTERVAL_SECS`).
    pub async fn rotate_call_keys(&self, call_id: &str) -> Result<CallSignal, EngineError> {
        let peer_key = {
            let calls = self.calls.lock().await;
            let state = calls
                .get(call_id)
                .ok_or_else(|| EngineError::UnknownCall(call_id.to_string()))?;
            if state.role != CallRole::Caller {
                return Err(EngineError::CallState("only the caller rotates keys".into()));
            }
            state.peer_key.clone()
        };

        let record = self.contacts.ensure_usable(&peer_key).await?;
        let token =
            b64::decode_exact::<32>(&record.conversation_token).map_err(EngineError::Crypto)?;

        let signal = {
            let mut calls = self.calls.lock().await;
            let state = calls
                .get_mut(call_id)
                .ok_or_else(|| EngineError::UnknownCall(call_id.to_string()))?;

            state.set_status(CallStatus::Rotating)?;
            let epoch = state.epoch + 1;
            let mut cmk_salt = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut cmk_salt);
            let keys = calls::derive_call_keys(&token, call_id, epoch, &cmk_salt, state.role)?;

            state.epoch = epoch;
            state.cmk_salt = cmk_salt;
            state.cmk_proof = keys.cmk_proof;
            state.ciphers = Some(CallCiphers::from_keys(&keys));
            state.rotated_at = Some(Utc::now());
            state.set_status(CallStatus::Ready)?;

            CallSignal::RotateKeys {
                call_id: call_id.to_string(),
                envelope: CallKeyEnvelope::new(
                    call_id.to_string(),
                    epoch,
                    &cmk_salt,
                    &keys.cmk_proof,
                    state.media,
                    self.local_capabilities,
                ),
            }
        };
        self.collab.transport.send_signal(&peer_key, &signal).await?;
        tracing::info!(
            target: "sentry_engine",
            event = "call_keys_rotated",
            call_id = %call_id
        );
        Ok(signal)
    }

    /// True when the epoch is older than `ROTATION_INTERVAL_SECS` — for the
    /// external scheduler.
    pub async fn rotation_due(&self, call_id: &str) -> Result<bool, EngineError> {
        let calls = self.calls.lock().await;
        let state = calls
            .get(call_id)
            .ok_or_else(|| EngineError::UnknownCall(call_id.to_string()))?;
        let last = state.rotated_at.unwrap_or(state.created_at);
        Ok((Utc::now() - last).num_seconds() >= ROTATION_INTERVAL_SECS)
    }

    async fn handle_rotation(
        &self,
        call_id: &str,
        envelope: &CallKeyEnvelope,
    ) -> Result<(), EngineError> {
        let peer_key = {
            let calls = self.calls.lock().await;
            let state = calls
                .get(call_id)
                .ok_or_else(|| EngineError::UnknownCall(call_id.to_string()))?;
            if envelope.epoch != state.epoch + 1 {
                return Err(EngineError::CallState(format!(
                    "rotation epoch {} does not follow {}",
                    envelope.epoch, state.epoch
                )));
            }
            state.peer_key.clone()
        };

        let record = self.contacts.ensure_usable(&peer_key).await?;
        let token =
            b64::decode_exact::<32>(&record.conversation_token).map_err(EngineError::Crypto)?;
        let (cmk_salt, cmk_proof) = envelope.validate()?;
        calls::verify_cmk_proof(&token, call_id, envelope.epoch, &cmk_salt, &cmk_proof)?;
        let role = {
            let calls = self.calls.lock().await;
            calls
                .get(call_id)
                .ok_or_else(|| EngineError::UnknownCall(call_id.to_string()))?
                .role
        };
        let keys = calls::derive_call_keys(&token, call_id, envelope.epoch, &cmk_salt, role)?;

        let mut calls = self.calls.lock().await;
        let state = calls
            .get_mut(call_id)
            .ok_or_else(|| EngineError::UnknownCall(call_id.to_string()))?;
        state.set_status(CallStatus::Rotating)?;
        state.epoch = envelope.epoch;
        state.cmk_salt = cmk_salt;
        state.cmk_proof = cmk_proof;
        state.ciphers = Some(CallCiphers::from_keys(&keys));
        state.rotated_at = Some(Utc::now());
        state.set_status(CallStatus::Ready)?;
        Ok(())
    }

    /// Encrypt (tx) or decrypt (rx) one encoded media frame.
    ///
    /// `Ok(None)` is a dropped inbound frame (bad tag — media is lossy; log
    /// and continue). In `skipped` state frames pass through untouched.
    pub async fn process_frame(
        &self,
        call_id: &str,
        direction: FrameDirection,
        kind: MediaKind,
        frame: &[u8],
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let mut calls = self.calls.lock().await;
        let state = calls
            .get_mut(call_id)
            .ok_or_else(|| EngineError::UnknownCall(call_id.to_string()))?;

        match state.status {
            CallStatus::Skipped => Ok(Some(frame.to_vec())),
            CallStatus::Ready | CallStatus::Rotating => {
                if direction == FrameDirection::Tx && !state.receiver_confirmed {
                    return Err(EngineError::E2eNotConfirmed(call_id.to_string()));
                }
                let cipher = state
                    .ciphers
                    .as_mut()
                    .ok_or_else(|| EngineError::CallState("keys absent".into()))?
                    .pick(direction, kind);
                match direction {
                    FrameDirection::Tx => Ok(Some(cipher.seal_next(frame)?)),
                    FrameDirection::Rx => match cipher.open(frame) {
                        Ok(plaintext) => Ok(Some(plaintext)),
                        Err(sentry_crypto::CryptoError::Decrypt) => {
                            tracing::warn!(
                                target: "sentry_engine",
                                event = "frame_dropped",
                                call_id = %call_id
                            );
                            Ok(None)
                        }
                        Err(e) => Err(e.into()),
                    },
                }
            }
            CallStatus::KeyPending => Err(EngineError::CallState("key_pending".into())),
            CallStatus::Failed => Err(EngineError::CallState("failed".into())),
            CallStatus::Idle => Err(EngineError::CallState("idle".into())),
        }
    }

    pub async fn end_call(&self, call_id: &str) -> Result<(), EngineError> {
        let (peer_key, kind, status, created_at) = {
            let mut calls = self.calls.lock().await;
            let state = calls
                .remove(call_id)
                .ok_or_else(|| EngineError::UnknownCall(call_id.to_string()))?;
            (state.peer_key, state.kind, state.status, state.created_at)
        };
        let _ = self
            .collab
            .transport
            .send_signal(
                &peer_key,
                &CallSignal::End {
                    call_id: call_id.to_string(),
                },
            )
            .await;

        // Best-effort call-log entry for the conversation timeline.
        let body = sentry_proto::message::MessageBody::CallLog {
            call_id: call_id.to_string(),
            kind: match kind {
                CallKind::Audio => "audio".to_string(),
                CallKind::Video => "video".to_string(),
            },
            outcome: match status {
                CallStatus::Failed => "failed".to_string(),
                CallStatus::Skipped => "ended_unencrypted".to_string(),
                _ => "ended".to_string(),
            },
            duration_ms: (Utc::now() - created_at).num_milliseconds().max(0) as u64,
        };
        if let Err(e) = self
            .send_with_replacement(&peer_key, body, Uuid::new_v4().to_string())
            .await
        {
            tracing::warn!(
                target: "sentry_engine",
                event = "call_log_send_failed",
                call_id = %call_id,
                code = e.code()
            );
        }
        Ok(())
    }

    pub async fn call_status(&self, call_id: &str) -> Result<CallStatus, EngineError> {
        let calls = self.calls.lock().await;
        calls
            .get(call_id)
            .map(|s| s.status)
            .ok_or_else(|| EngineError::UnknownCall(call_id.to_string()))
    }

    pub async fn call_epoch(&self, call_id: &str) -> Result<u32, EngineError> {
        let calls = self.calls.lock().await;
        calls
            .get(call_id)
            .map(|s| s.epoch)
            .ok_or_else(|| EngineError::UnknownCall(call_id.to_string()))
    }
}
