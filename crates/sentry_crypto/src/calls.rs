//! Per-call media key derivation.
//!
//! The caller draws a fresh 32-byte salt per (call, epoch) and both sides
//! derive:
//!   masterKey = HKDF-SHA256(ikm=conversationToken, salt=cmkSalt,
//!                           info="call-master-key:"+callId+":"+epoch, 64)
//!   cmkProof  = HMAC-SHA256(masterKey, callId+":"+epoch)
//!
//! Directional sub-keys use four labels with the role baked in; one side's
//! tx label is the other side's rx derivation, so swapping roles swaps
//! tx↔rx byte-for-byte:
//!   key   = HKDF(masterKey, salt=0*32, "call-audio-tx:"+role, 32)
//!   nonce = HKDF(masterKey, salt=0*32, "call-audio-nonce:"+role, 12)
//! (same pattern with "video").
//!
//! The callee recomputes the proof from the received salt and rejects the
//! call on mismatch before any media flows.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{error::CryptoError, kdf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

impl CallRole {
    pub fn other(self) -> Self {
        match self {
            CallRole::Caller => CallRole::Callee,
            CallRole::Callee => CallRole::Caller,
        }
    }

    fn label(self) -> &'static str {
        match self {
            CallRole::Caller => "caller",
            CallRole::Callee => "callee",
        }
    }
}

/// One direction of one media kind: AES-256-GCM key + 96-bit base nonce.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionalKey {
    pub key: [u8; 32],
    pub nonce: [u8; 12],
}

/// Everything a call needs for one epoch.
#[derive(ZeroizeOnDrop)]
pub struct CallKeySet {
    pub audio_tx: DirectionalKey,
    pub audio_rx: DirectionalKey,
    pub video_tx: DirectionalKey,
    pub video_rx: DirectionalKey,
    #[zeroize(skip)]
    pub cmk_proof: [u8; 32],
}

fn directional(
    master: &[u8; 64],
    kind: &str,
    role: CallRole,
) -> Result<DirectionalKey, CryptoError> {
    let mut key = [0u8; 32];
    let mut nonce = [0u8; 12];
    let key_info = format!("call-{kind}-tx:{}", role.label());
    let nonce_info = format!("call-{kind}-nonce:{}", role.label());
    kdf::hkdf_expand(master, Some(&[0u8; 32]), key_info.as_bytes(), &mut key)?;
    kdf::hkdf_expand(master, Some(&[0u8; 32]), nonce_info.as_bytes(), &mut nonce)?;
    Ok(DirectionalKey { key, nonce })
}

/// Derive the full key set for `role` in (call_id, epoch).
pub fn derive_call_keys(
    conversation_token: &[u8; 32],
    call_id: &str,
    epoch: u32,
    cmk_salt: &[u8; 32],
    role: CallRole,
) -> Result<CallKeySet, CryptoError> {
    let info = format!("call-master-key:{call_id}:{epoch}");
    let mut master = [0u8; 64];
    kdf::hkdf_expand(conversation_token, Some(cmk_salt), info.as_bytes(), &mut master)?;

    let proof_data = format!("{call_id}:{epoch}");
    let cmk_proof = kdf::hmac_sha256(&master, proof_data.as_bytes());

    let set = CallKeySet {
        audio_tx: directional(&master, "audio", role)?,
        audio_rx: directional(&master, "audio", role.other())?,
        video_tx: directional(&master, "video", role)?,
        video_rx: directional(&master, "video", role.other())?,
        cmk_proof,
    };
    master.zeroize();
    Ok(set)
}

/// Recompute and check the proof for a received call-key envelope.
pub fn verify_cmk_proof(
    conversation_token: &[u8; 32],
    call_id: &str,
    epoch: u32,
    cmk_salt: &[u8; 32],
    proof: &[u8],
) -> Result<(), CryptoError> {
    let info = format!("call-master-key:{call_id}:{epoch}");
    let mut master = [0u8; 64];
    kdf::hkdf_expand(conversation_token, Some(cmk_salt), info.as_bytes(), &mut master)?;
    let proof_data = format!("{call_id}:{epoch}");
    let result = kdf::hmac_sha256_verify(&master, proof_data.as_bytes(), proof);
    master.zeroize();
    result
}
