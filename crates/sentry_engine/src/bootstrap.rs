//! Account bootstrap: SDM challenge exchange + OPAQUE login → MK, device
//! keys, published prekeys.
//!
//! The SDM challenge is opaque to this core — the tag's MAC is verified
//! server-side; the client only validates shape. OPAQUE runs client-side
//! with `opaque-ke` (ristretto255 suite, Argon2 key stretching); the server
//! half sits behind `AccountApi`. The MK is derived from the OPAQUE export
//! key, so it never exists server-side.
//!
//! Every failure is terminal for the attempt: on any error the vault stays
//! (or returns to) locked and no partial account state survives.

use argon2::Argon2;
use opaque_ke::{
    ClientLogin, ClientLoginFinishParameters, ClientRegistration,
    ClientRegistrationFinishParameters, CipherSuite, CredentialResponse, RegistrationResponse,
};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use sentry_crypto::{kdf, prekeys};
use sentry_proto::api::{validate_account_digest, validate_uid_hex, BootstrapResult, SdmParams};
use sentry_store::device::{open_device_priv, seal_device_priv};

use crate::{core::AccountState, error::EngineError, MessengerCore};

/// OPAQUE ciphersuite: ristretto255 OPRF + key exchange, Argon2id KSF.
pub struct SentrySuite;

impl CipherSuite for SentrySuite {
    type OprfCs = opaque_ke::Ristretto255;
    type KeGroup = opaque_ke::Ristretto255;
    type KeyExchange = opaque_ke::key_exchange::tripledh::TripleDh;
    type Ksf = Argon2<'static>;
}

pub const MK_INFO: &[u8] = b"sentry/mk/v1";

/// One-time prekeys generated on first bootstrap and per replenishment.
pub const OPK_BATCH: u32 = 32;

impl MessengerCore {
    /// Full bootstrap: SDM exchange, OPAQUE register (first run) + login,
    /// MK derivation, device key load-or-generate, prekey publication.
    pub async fn bootstrap(
        &self,
        sdm: &SdmParams,
        password: &str,
    ) -> Result<BootstrapResult, EngineError> {
        match self.bootstrap_inner(sdm, password).await {
            Ok(result) => Ok(result),
            Err(e) => {
                // No partial state may leak from a failed attempt.
                self.logout().await;
                tracing::error!(
                    target: "sentry_engine",
                    event = "bootstrap_failed",
                    code = e.code()
                );
                Err(e)
            }
        }
    }

    async fn bootstrap_inner(
        &self,
        sdm: &SdmParams,
        password: &str,
    ) -> Result<BootstrapResult, EngineError> {
        let mut params = sdm.clone();
        params.uid = validate_uid_hex(&sdm.uid)?;

        // ── SDM challenge → account identity ────────────────────────────
        let exchange = self.collab.account_api.exchange_from_sdm(&params).await?;
        let account_digest = validate_account_digest(&exchange.account_digest)?;

        // ── OPAQUE ──────────────────────────────────────────────────────
        if exchange.opaque_server_id.is_none() {
            self.opaque_register(&account_digest, password).await?;
        }
        let export_key = self.opaque_login(&account_digest, password).await?;

        // MK = HKDF(export_key) — bound to the account, never server-held.
        let mut mk = [0u8; 32];
        kdf::hkdf_expand(
            &export_key,
            Some(account_digest.as_bytes()),
            MK_INFO,
            &mut mk,
        )
        .map_err(EngineError::Crypto)?;

        // ── Device registration + key material ──────────────────────────
        let device_id = self
            .collab
            .account_api
            .register_device(&account_digest)
            .await
            .map_err(|e| match e {
                EngineError::Transient(msg) => EngineError::DeviceRegisterFailed(msg),
                other => other,
            })?;

        let blob_key = Self::device_blob_key(&account_digest);
        let device = match self.collab.blob_store.get(&blob_key).await? {
            Some(sealed) => open_device_priv(&mk, &sealed)?,
            None => {
                let (device, _) = prekeys::generate_initial_bundle(0, OPK_BATCH)?;
                device
            }
        };

        self.collab
            .account_api
            .publish_prekeys(&account_digest, &device_id, &device.public_bundle())
            .await?;
        self.collab
            .blob_store
            .put(&blob_key, &seal_device_priv(&mk, &device)?)
            .await?;

        // ── Commit: unlock vault, install state, hydrate contacts ───────
        self.mk.unlock(mk).await;
        *self.device.write().await = Some(device);
        *self.account.write().await = Some(AccountState {
            account_digest: account_digest.clone(),
            account_token: exchange.account_token.clone(),
            device_id: device_id.clone(),
        });

        self.hydrate_contacts().await;

        tracing::info!(
            target: "sentry_engine",
            event = "bootstrap_ok",
            device_id = %device_id
        );

        Ok(BootstrapResult {
            account_digest,
            account_token: exchange.account_token,
            device_id,
        })
    }

    async fn opaque_register(
        &self,
        account_digest: &str,
        password: &str,
    ) -> Result<(), EngineError> {
        let mut rng = OsRng;
        let start = ClientRegistration::<SentrySuite>::start(&mut rng, password.as_bytes())
            .map_err(|e| EngineError::OpaqueRegisterFailed(e.to_string()))?;
        let response_bytes = self
            .collab
            .account_api
            .opaque_register_start(account_digest, start.message.serialize().to_vec())
            .await?;
        let response = RegistrationResponse::deserialize(&response_bytes)
            .map_err(|e| EngineError::OpaqueRegisterFailed(e.to_string()))?;
        let finish = start
            .state
            .finish(
                &mut rng,
                password.as_bytes(),
                response,
                ClientRegistrationFinishParameters::default(),
            )
            .map_err(|e| EngineError::OpaqueRegisterFailed(e.to_string()))?;
        self.collab
            .account_api
            .opaque_register_finish(account_digest, finish.message.serialize().to_vec())
            .await?;
        Ok(())
    }

    async fn opaque_login(
        &self,
        account_digest: &str,
        password: &str,
    ) -> Result<Zeroizing<Vec<u8>>, EngineError> {
        let mut rng = OsRng;
        let start = ClientLogin::<SentrySuite>::start(&mut rng, password.as_bytes())
            .map_err(|e| EngineError::OpaqueLoginFailed(e.to_string()))?;
        let response_bytes = self
            .collab
            .account_api
            .opaque_login_start(account_digest, start.message.serialize().to_vec())
            .await?;
        let response = CredentialResponse::deserialize(&response_bytes)
            .map_err(|e| EngineError::OpaqueLoginFailed(e.to_string()))?;
        let finish = start
            .state
            .finish(
                password.as_bytes(),
                response,
                ClientLoginFinishParameters::default(),
            )
            .map_err(|_| EngineError::OpaqueLoginFailed("credential response rejected".into()))?;
        self.collab
            .account_api
            .opaque_login_finish(account_digest, finish.message.serialize().to_vec())
            .await?;
        Ok(Zeroizing::new(finish.export_key.to_vec()))
    }

    /// Pull the newest backup and restore the contact vault. A missing or
    /// previously-corrupt backup is not fatal to login.
    async fn hydrate_contacts(&self) {
        let fetched = match self.collab.backup_api.fetch_latest_backup().await {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    target: "sentry_engine",
                    event = "backup_fetch_failed",
                    code = e.code()
                );
                return;
            }
        };
        let Some((backup_key, sealed)) = fetched else {
            return;
        };
        let Ok(mk) = self.require_mk().await else {
            return;
        };
        match self.contacts.hydrate(&mk, &backup_key, &sealed).await {
            Ok(event) => {
                tracing::info!(
                    target: "sentry_engine",
                    event = "contacts_hydrated",
                    restored = matches!(event, sentry_store::contacts::VaultEvent::Restored { .. })
                );
            }
            Err(e) => {
                tracing::error!(
                    target: "sentry_engine",
                    event = "hydrate_failed",
                    backup_key = %backup_key,
                    code = e.code()
                );
            }
        }
    }

    /// Replenish one-time prekeys and republish the bundle. The id counter
    /// and the new secrets persist atomically in the device blob.
    pub async fn publish_prekeys(&self) -> Result<(), EngineError> {
        let account = self.account_state().await?;
        let mk = self.require_mk().await?;

        let mut guard = self.device.write().await;
        let device = guard.as_mut().ok_or(EngineError::NotLoggedIn)?;
        prekeys::generate_opks(device, OPK_BATCH);

        let sealed = seal_device_priv(&mk, device)?;
        self.collab
            .account_api
            .publish_prekeys(
                &account.account_digest,
                &account.device_id,
                &device.public_bundle(),
            )
            .await?;
        self.collab
            .blob_store
            .put(&Self::device_blob_key(&account.account_digest), &sealed)
            .await?;
        Ok(())
    }

    /// Directory lookup for a peer's published bundle.
    pub async fn fetch_peer_bundle(
        &self,
        peer_account_digest: &str,
        peer_device_id: &str,
    ) -> Result<sentry_crypto::prekeys::PrekeyBundle, EngineError> {
        let digest = validate_account_digest(peer_account_digest)?;
        self.collab
            .account_api
            .fetch_peer_bundle(&digest, peer_device_id)
            .await
    }
}
