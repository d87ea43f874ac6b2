use std::collections::BTreeMap;
use std::sync::Arc;

use ember_crypto::{Account, DeviceIdentity, KeySigner, OneTimeKey, CURVE25519};

use crate::error::KeysError;
use crate::ledger::RequestLedger;
use crate::session::SessionHandle;
use crate::transport::{Request, Transport};
use crate::wire::{OneTimeKeyValue, UploadCounts, UploadKeysRequest, UploadKeysResponse, KEYS_UPLOAD};

/// Wire representation chosen for one-time keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// `curve25519:<id> -> "<key>"`.
    Unsigned,
    /// `signed_curve25519:<id> -> {"key": …, "signatures": …}`.
    Signed,
}

/// One-time keys to include in an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimeKeyUpload {
    pub keys: Vec<OneTimeKey>,
    pub format: KeyFormat,
}

/// Publishes identity and one-time keys and reports the server's inventory.
#[derive(Clone)]
pub struct KeyUploadCoordinator {
    account: Arc<dyn Account>,
    signer: KeySigner,
    ledger: RequestLedger,
    transport: Arc<dyn Transport>,
    session: SessionHandle,
}

impl KeyUploadCoordinator {
    pub fn new(
        account: Arc<dyn Account>,
        ledger: RequestLedger,
        transport: Arc<dyn Transport>,
        session: SessionHandle,
    ) -> Self {
        Self {
            signer: KeySigner::new(account.clone()),
            account,
            ledger,
            transport,
            session,
        }
    }

    /// Upload signed identity keys, one-time keys, both, or neither.
    ///
    /// Returns the server's `one_time_key_counts` verbatim. Uploading neither
    /// is how a client learns its current counts.
    pub async fn upload(
        &self,
        identity: Option<&DeviceIdentity>,
        one_time_keys: Option<&OneTimeKeyUpload>,
    ) -> Result<UploadCounts, KeysError> {
        let session = self.session.current()?;
        let body = self.build_request(identity, one_time_keys)?;

        tracing::debug!(
            user_id = %session.user_id,
            device_id = %session.device_id,
            identity = body.device_keys.is_some(),
            one_time_keys = body.one_time_keys.len(),
            "uploading keys"
        );

        let request = Request::post(KEYS_UPLOAD, serde_json::to_value(&body)?)
            .with_access_token(&session.access_token);
        let response = self.ledger.dispatch(self.transport.clone(), request).await?;
        let response: UploadKeysResponse = serde_json::from_value(response)
            .map_err(|e| KeysError::ParseError(format!("upload response: {e}")))?;

        tracing::info!(counts = ?response.one_time_key_counts, "keys uploaded");
        Ok(response.one_time_key_counts)
    }

    /// Build the upload body without submitting it.
    pub fn build_request(
        &self,
        identity: Option<&DeviceIdentity>,
        one_time_keys: Option<&OneTimeKeyUpload>,
    ) -> Result<UploadKeysRequest, KeysError> {
        let device_keys = identity
            .map(|identity| self.signer.sign_identity_keys(identity))
            .transpose()?;

        let one_time_keys = match one_time_keys {
            None => BTreeMap::new(),
            Some(OneTimeKeyUpload {
                keys,
                format: KeyFormat::Unsigned,
            }) => keys
                .iter()
                .map(|key| {
                    (
                        key.algorithm_key_id(CURVE25519),
                        OneTimeKeyValue::Unsigned(key.public_key.to_base64()),
                    )
                })
                .collect(),
            Some(OneTimeKeyUpload {
                keys,
                format: KeyFormat::Signed,
            }) => {
                let signing_identity = match identity {
                    Some(identity) => identity.clone(),
                    None => self.session_identity()?,
                };
                self.signer
                    .sign_one_time_keys(&signing_identity, keys)?
                    .into_iter()
                    .map(|(key_id, signed)| (key_id, OneTimeKeyValue::Signed(signed)))
                    .collect()
            }
        };

        Ok(UploadKeysRequest {
            device_keys,
            one_time_keys,
        })
    }

    fn session_identity(&self) -> Result<DeviceIdentity, KeysError> {
        let session = self.session.current()?;
        Ok(DeviceIdentity::new(
            session.user_id,
            session.device_id,
            self.account.identity_keys(),
        ))
    }
}
