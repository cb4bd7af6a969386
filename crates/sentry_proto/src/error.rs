use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed {field}: {detail}")]
    Malformed {
        field: &'static str,
        detail: String,
    },

    #[error(transparent)]
    Crypto(#[from] sentry_crypto::CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl ProtoError {
    pub fn malformed(field: &'static str, detail: impl Into<String>) -> Self {
        ProtoError::Malformed {
            field,
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProtoError::Malformed { .. } => "BAD_ENVELOPE",
            ProtoError::Crypto(e) => e.code(),
            ProtoError::Serialisation(_) => "BAD_ENVELOPE",
        }
    }
}
