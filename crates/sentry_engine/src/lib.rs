//! sentry_engine — the end-to-end secure messaging and call core.
//!
//! One `MessengerCore` per logged-in account process. The UI, the transport
//! that ferries JSON envelopes and signals, and the storage adapter for
//! MK-wrapped blobs are external collaborators behind the traits in
//! [`traits`]; the core owns the cryptographic state machine and fails
//! loudly on every invariant violation — no fallback crypto, no silent
//! retries, no auto-repair of ratchet state.
//!
//! - `core`         — the facade struct, shared handles, logout
//! - `bootstrap`    — SDM exchange + OPAQUE login → MK, device keys
//! - `invites`      — invite issuance / accept, contact-share exchange
//! - `sessions`     — per-peer exclusive locks for ratchet mutations
//! - `pipeline`     — outbox/inbox, dedup, timeline, replacement path
//! - `call_manager` — per-call media keys, epochs, frame processing
//! - `status`       — per-peer secure-conversation status machine
//! - `traits`       — collaborator interfaces (server, transport, storage)
//! - `error`        — engine error taxonomy with canonical reason codes

pub mod bootstrap;
pub mod call_manager;
pub mod core;
pub mod error;
pub mod invites;
pub mod pipeline;
pub mod sessions;
pub mod status;
pub mod traits;

pub use crate::core::{AccountState, Collaborators, MessengerCore};
pub use error::EngineError;
