//! sentry_proto — protocol types of the Sentry messaging core.
//!
//! - `envelope` — conversation envelope + DR plaintext (wire formats)
//! - `message`  — message bodies, delivery states, timeline entries
//! - `invite`   — invite records and the owner→guest contact share
//! - `signal`   — call-key envelope and call signalling
//! - `api`      — boundary DTOs and strict input validation
//! - `error`    — unified error type

pub mod api;
pub mod envelope;
pub mod error;
pub mod invite;
pub mod message;
pub mod signal;

pub use error::ProtoError;
