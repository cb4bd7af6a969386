//! sentry_store — in-memory vaults of the Sentry messaging core.
//!
//! - `vault`    — master-key lifecycle (login → logout, zeroized on lock)
//! - `contacts` — contact-secret vault, snapshots, corruption tracking
//! - `device`   — MK-wrapped device-private blob
//!
//! Nothing here touches disk: persisted state leaves this crate as
//! MK-wrapped envelopes, handed to an external storage adapter.

pub mod contacts;
pub mod device;
pub mod error;
pub mod vault;

pub use error::StoreError;
