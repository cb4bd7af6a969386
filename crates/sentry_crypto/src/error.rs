use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("base64 decode rejected: {0}")]
    Base64(String),

    #[error("envelope field invalid: {0}")]
    BadEnvelope(String),

    #[error("envelope decrypt failed (authentication tag mismatch)")]
    EnvelopeDecrypt,

    #[error("AEAD encryption failed")]
    Encrypt,

    #[error("decrypt failed")]
    Decrypt,

    #[error("message counter below receive chain and not in skipped cache")]
    CounterTooLow,

    #[error("ratchet gap of {0} exceeds skipped-key budget")]
    GapExceeded(u64),

    #[error("ratchet invariant violated: {0}")]
    RatchetInvariant(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("signature verification failed")]
    SignatureVerification,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("one-time prekey {0} not available")]
    UnknownOpk(u32),

    #[error("prekey bundle has no one-time prekey left")]
    PrekeyExhausted,

    #[error("call key proof mismatch")]
    CallProofMismatch,

    #[error("frame counter exhausted, key rotation required")]
    FrameCounterExhausted,

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl CryptoError {
    /// Canonical reason code, stable across layers and surfaced in diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            CryptoError::Base64(_) => "B64_REJECTED",
            CryptoError::BadEnvelope(_) => "BAD_ENVELOPE",
            CryptoError::EnvelopeDecrypt => "ENVELOPE_DECRYPT_FAILED",
            CryptoError::Encrypt => "ENCRYPT_FAILED",
            CryptoError::Decrypt => "DECRYPT_FAILED",
            CryptoError::CounterTooLow => "COUNTER_TOO_LOW",
            CryptoError::GapExceeded(_) => "RATCHET_GAP_EXCEEDED",
            CryptoError::RatchetInvariant(_) => "RATCHET_INVARIANT",
            CryptoError::InvalidKey(_) => "INVALID_KEY",
            CryptoError::KeyDerivation(_) => "KDF_FAILED",
            CryptoError::SignatureVerification => "BAD_SIGNATURE",
            CryptoError::InvalidInput(_) => "INVALID_INPUT",
            CryptoError::UnknownOpk(_) => "UNKNOWN_OPK",
            CryptoError::PrekeyExhausted => "PREKEY_EXHAUSTED",
            CryptoError::CallProofMismatch => "CALL_KEY_PROOF_MISMATCH",
            CryptoError::FrameCounterExhausted => "FRAME_COUNTER_EXHAUSTED",
            CryptoError::Serialisation(_) => "SERIALISATION",
        }
    }
}
