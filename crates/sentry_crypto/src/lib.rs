//! sentry_crypto — cryptographic primitives of the Sentry messaging core.
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize secret material on drop.
//! - Fail loudly: every invariant violation surfaces a tagged error; nothing
//!   retries or re-derives silently.
//!
//! # Module layout
//! - `b64`          — strict byte ↔ base64/base64url conversions
//! - `envelope`     — MK-wrapped AEAD envelopes with info-tag allow-list
//! - `identity`     — long-term Ed25519 device identity
//! - `prekeys`      — signed prekey + one-time prekey generation, device blob
//! - `conversation` — invite-secret → token/id/fingerprint, transport AEAD
//! - `x3dh`         — asynchronous key agreement (SPK verification, DH1..DH4)
//! - `ratchet`      — Double Ratchet with DH turns + skipped-key cache
//! - `calls`        — per-call master key + directional media sub-keys
//! - `frame`        — per-frame AES-GCM with counter-derived nonces
//! - `kdf`          — HKDF / HMAC building blocks
//! - `error`        — unified error type with canonical reason codes

pub mod b64;
pub mod calls;
pub mod conversation;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod identity;
pub mod kdf;
pub mod prekeys;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
