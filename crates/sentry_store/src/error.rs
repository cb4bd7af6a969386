use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("master key not present (locked or logged out)")]
    VaultLocked,

    #[error("contact {peer_key} is marked corrupt: {reason}")]
    ContactCorrupt { peer_key: String, reason: String },

    #[error("no contact record for {0}")]
    UnknownContact(String),

    #[error("backup {0} previously failed to decrypt; not retried this session")]
    BackupCorrupt(String),

    #[error(transparent)]
    Crypto(#[from] sentry_crypto::CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::VaultLocked => "VAULT_LOCKED",
            StoreError::ContactCorrupt { .. } => "CONTACT_CORRUPT",
            StoreError::UnknownContact(_) => "UNKNOWN_CONTACT",
            StoreError::BackupCorrupt(_) => "BACKUP_CORRUPT",
            StoreError::Crypto(e) => e.code(),
            StoreError::Serialisation(_) => "SERIALISATION",
        }
    }
}
