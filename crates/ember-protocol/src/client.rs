//! High-level entry point tying the key coordinators to one device.

use std::collections::BTreeMap;
use std::sync::Arc;

use ember_crypto::{Account, DeviceIdentity, OneTimeKeyPool, CURVE25519, SIGNED_CURVE25519};
use parking_lot::RwLock;

use crate::claim::{ClaimResult, ClaimTargets, KeyClaimCoordinator};
use crate::config::ClientConfig;
use crate::error::KeysError;
use crate::ledger::RequestLedger;
use crate::query::{KeyQueryCoordinator, QueryResult};
use crate::session::{Session, SessionHandle};
use crate::transport::{Request, Transport};
use crate::upload::{KeyFormat, KeyUploadCoordinator, OneTimeKeyUpload};
use crate::wire::{LoginRequest, LoginResponse, UploadCounts, LOGIN};

/// One device's view of the key server.
///
/// Key operations fail with [`KeysError::SessionNotReady`] until
/// [`login`](Self::login) succeeds. After [`shutdown`](Self::shutdown) every
/// in-flight and future request resolves as [`KeysError::Cancelled`].
pub struct KeysClient {
    config: ClientConfig,
    account: Arc<dyn Account>,
    transport: Arc<dyn Transport>,
    ledger: RequestLedger,
    session: SessionHandle,
    identity: RwLock<Option<DeviceIdentity>>,
    pool: OneTimeKeyPool,
    uploader: KeyUploadCoordinator,
    querier: KeyQueryCoordinator,
    claimer: KeyClaimCoordinator,
}

impl KeysClient {
    pub fn new(config: ClientConfig, account: Arc<dyn Account>, transport: Arc<dyn Transport>) -> Self {
        let ledger = RequestLedger::new(config.request_timeout());
        let session = SessionHandle::new();
        Self {
            pool: OneTimeKeyPool::new(account.clone()),
            uploader: KeyUploadCoordinator::new(
                account.clone(),
                ledger.clone(),
                transport.clone(),
                session.clone(),
            ),
            querier: KeyQueryCoordinator::new(ledger.clone(), transport.clone(), session.clone()),
            claimer: KeyClaimCoordinator::new(ledger.clone(), transport.clone(), session.clone()),
            identity: RwLock::new(None),
            config,
            account,
            transport,
            ledger,
            session,
        }
    }

    /// Client talking to `config.homeserver` over HTTP.
    #[cfg(feature = "http")]
    pub fn connect(config: ClientConfig, account: Arc<dyn Account>) -> Result<Self, KeysError> {
        let timeout = config
            .request_timeout()
            .unwrap_or(std::time::Duration::from_secs(60));
        let transport = crate::transport::HttpTransport::new(&config.homeserver, timeout)
            .map_err(crate::transport::TransportFailure::classify)?;
        Ok(Self::new(config, account, Arc::new(transport)))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Authenticate with a password and publish the resulting session.
    ///
    /// The first login fixes the device identity from the returned ids and the
    /// account's keys. Later logins ask for the same device and fail with
    /// [`KeysError::IdentityMismatch`] if the server hands back another one;
    /// the identity and the current session are then left as they were.
    pub async fn login(&self, user: &str, password: &str) -> Result<Session, KeysError> {
        let existing = self.identity.read().clone();
        let mut request = LoginRequest::password(user, password);
        request.device_id = existing.as_ref().map(|identity| identity.device_id().to_owned());

        let body = serde_json::to_value(request)?;
        let response = self
            .ledger
            .dispatch(self.transport.clone(), Request::post(LOGIN, body))
            .await?;
        let LoginResponse {
            user_id,
            access_token,
            device_id,
        } = serde_json::from_value(response)
            .map_err(|e| KeysError::ParseError(format!("login response: {e}")))?;

        match existing {
            Some(identity) if identity.user_id() != user_id || identity.device_id() != device_id => {
                return Err(KeysError::IdentityMismatch {
                    expected: format!("{}/{}", identity.user_id(), identity.device_id()),
                    actual: format!("{user_id}/{device_id}"),
                });
            }
            Some(_) => tracing::debug!(%user_id, %device_id, "session renewed"),
            None => {
                *self.identity.write() = Some(DeviceIdentity::new(
                    &user_id,
                    &device_id,
                    self.account.identity_keys(),
                ));
            }
        }

        let session = Session {
            user_id,
            device_id,
            access_token,
        };
        self.session.set(session.clone());
        Ok(session)
    }

    pub async fn wait_ready(&self) -> Result<Session, KeysError> {
        self.session.wait_ready().await
    }

    pub fn is_ready(&self) -> bool {
        self.session.is_ready()
    }

    pub fn identity(&self) -> Result<DeviceIdentity, KeysError> {
        self.identity.read().clone().ok_or(KeysError::SessionNotReady)
    }

    pub async fn upload_identity_keys(&self) -> Result<UploadCounts, KeysError> {
        let identity = self.identity()?;
        self.uploader.upload(Some(&identity), None).await
    }

    /// Add `count` fresh keys to the unpublished pool.
    pub fn generate_one_time_keys(&self, count: i64) -> Result<usize, KeysError> {
        Ok(self.pool.generate(count)?)
    }

    pub fn unpublished_one_time_keys(&self) -> usize {
        self.pool.len()
    }

    /// Upload every unpublished key in `format`.
    ///
    /// Keys leave the pool only once the server has acknowledged them; on
    /// failure the pool is untouched and the same keys go out next time.
    pub async fn publish_one_time_keys(&self, format: KeyFormat) -> Result<UploadCounts, KeysError> {
        let keys = self.pool.snapshot();
        let upload = OneTimeKeyUpload { keys, format };
        let counts = self.uploader.upload(None, Some(&upload)).await?;

        let published = self
            .pool
            .mark_published(upload.keys.iter().map(|key| key.key_id.as_str()));
        tracing::info!(published, remaining = self.pool.len(), "one-time keys published");
        Ok(counts)
    }

    /// Top the server's stock of `format` keys back up to the configured batch size.
    ///
    /// `counts` is the server's last report. Returns it unchanged when no keys are needed.
    pub async fn replenish_one_time_keys(
        &self,
        counts: &UploadCounts,
        format: KeyFormat,
    ) -> Result<UploadCounts, KeysError> {
        let algorithm = match format {
            KeyFormat::Unsigned => CURVE25519,
            KeyFormat::Signed => SIGNED_CURVE25519,
        };
        let on_server = counts.get(algorithm).copied().unwrap_or(0);
        let pending = u64::try_from(self.pool.len()).unwrap_or(u64::MAX);
        let wanted = self
            .config
            .one_time_key_batch
            .saturating_sub(on_server)
            .saturating_sub(pending);

        if wanted == 0 && pending == 0 {
            return Ok(counts.clone());
        }
        if wanted > 0 {
            let wanted = i64::try_from(wanted).map_err(|_| KeysError::InvalidCount(i64::MAX))?;
            self.pool.generate(wanted)?;
        }
        tracing::debug!(%algorithm, on_server, generated = wanted, "replenishing one-time keys");
        self.publish_one_time_keys(format).await
    }

    /// Upload identity and/or one-time keys assembled by the caller.
    pub async fn upload(
        &self,
        identity: Option<&DeviceIdentity>,
        one_time_keys: Option<&OneTimeKeyUpload>,
    ) -> Result<UploadCounts, KeysError> {
        self.uploader.upload(identity, one_time_keys).await
    }

    pub async fn query_keys<I, S>(&self, users: I) -> Result<QueryResult, KeysError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.querier.query(users).await
    }

    pub async fn query_devices(
        &self,
        targets: BTreeMap<String, Vec<String>>,
    ) -> Result<QueryResult, KeysError> {
        self.querier.query_devices(targets).await
    }

    pub async fn claim_keys(
        &self,
        targets: ClaimTargets,
        known_devices: &QueryResult,
    ) -> Result<ClaimResult, KeysError> {
        self.claimer.claim(targets, known_devices).await
    }

    pub fn pending_requests(&self) -> usize {
        self.ledger.pending_count()
    }

    /// Cancel every outstanding request and drop the session.
    ///
    /// Returns how many requests were cancelled.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.ledger.shutdown();
        self.session.clear();
        tracing::info!(cancelled, "keys client shut down");
        cancelled
    }
}
