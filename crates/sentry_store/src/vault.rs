//! In-memory master-key vault.
//!
//! The MK exists from OPAQUE login until explicit logout. It is never
//! persisted; `lock()` zeroizes it. Every MK-wrapped operation goes through
//! `with_key`, which fails closed when the vault is locked.

use std::sync::Arc;

use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use crate::error::StoreError;

#[derive(ZeroizeOnDrop)]
struct VaultInner {
    key: [u8; 32],
}

/// Thread-safe vault handle. Clone to share across the engine.
#[derive(Clone)]
pub struct MasterKeyVault {
    inner: Arc<RwLock<Option<VaultInner>>>,
}

impl MasterKeyVault {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Install the MK after a successful OPAQUE login.
    pub async fn unlock(&self, key: [u8; 32]) {
        let mut guard = self.inner.write().await;
        *guard = Some(VaultInner { key });
    }

    /// Drop and zeroize the MK (logout).
    pub async fn lock(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.read().await.is_none()
    }

    /// Run an operation with the raw key. Fails `VAULT_LOCKED` otherwise.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, StoreError>,
    {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(inner) => f(&inner.key),
            None => Err(StoreError::VaultLocked),
        }
    }
}

impl Default for MasterKeyVault {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locked_vault_refuses_key_access() {
        let vault = MasterKeyVault::new();
        assert!(vault.is_locked().await);
        let err = vault.with_key(|_| Ok(())).await.unwrap_err();
        assert_eq!(err.code(), "VAULT_LOCKED");
    }

    #[tokio::test]
    async fn unlock_then_lock_lifecycle() {
        let vault = MasterKeyVault::new();
        vault.unlock([7u8; 32]).await;
        assert!(!vault.is_locked().await);
        let copy = vault.with_key(|k| Ok(*k)).await.unwrap();
        assert_eq!(copy, [7u8; 32]);

        vault.lock().await;
        assert!(vault.is_locked().await);
        assert!(vault.with_key(|_| Ok(())).await.is_err());
    }
}
