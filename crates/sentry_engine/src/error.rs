use thiserror::Error;

use sentry_crypto::CryptoError;
use sentry_proto::ProtoError;
use sentry_store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport-level failure (missing ack, 5xx). The caller may retry
    /// with the same messageId; this core never retries on its own.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// The server's high-water mark for this conversation is ahead of the
    /// attached counter. The pipeline answers with an explicit replacement.
    #[error("server rejected counter as too low")]
    CounterTooLow,

    #[error("invite expired")]
    InviteExpired,

    #[error("invite already accepted")]
    InviteConsumed,

    #[error("SDM challenge rejected")]
    SdmBadMac,

    #[error("OPAQUE registration failed: {0}")]
    OpaqueRegisterFailed(String),

    #[error("OPAQUE login failed: {0}")]
    OpaqueLoginFailed(String),

    #[error("device registration failed: {0}")]
    DeviceRegisterFailed(String),

    #[error("not logged in")]
    NotLoggedIn,

    #[error("conversation not ready to send: {0}")]
    NotReady(String),

    #[error("end-to-end encryption skipped: peer lacks insertable streams")]
    E2eSkipped,

    #[error("sender transform gated: receiver transform not confirmed for call {0}")]
    E2eNotConfirmed(String),

    #[error("unknown call {0}")]
    UnknownCall(String),

    #[error("invalid call state: {0}")]
    CallState(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Canonical reason code. Crypto/store codes pass through unmasked.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Transient(_) => "TRANSIENT",
            EngineError::CounterTooLow => "COUNTER_TOO_LOW",
            EngineError::InviteExpired => "INVITE_EXPIRED",
            EngineError::InviteConsumed => "INVITE_CONSUMED",
            EngineError::SdmBadMac => "SDM_BAD_MAC",
            EngineError::OpaqueRegisterFailed(_) => "OPAQUE_REGISTER_FAILED",
            EngineError::OpaqueLoginFailed(_) => "OPAQUE_LOGIN_FAILED",
            EngineError::DeviceRegisterFailed(_) => "DEVICE_REGISTER_FAILED",
            EngineError::NotLoggedIn => "NOT_LOGGED_IN",
            EngineError::NotReady(_) => "NOT_READY",
            EngineError::E2eSkipped => "E2E_SKIPPED",
            EngineError::E2eNotConfirmed(_) => "E2E_NOT_CONFIRMED",
            EngineError::UnknownCall(_) => "UNKNOWN_CALL",
            EngineError::CallState(_) => "CALL_STATE",
            EngineError::Crypto(e) => e.code(),
            EngineError::Proto(e) => e.code(),
            EngineError::Store(e) => e.code(),
        }
    }
}
