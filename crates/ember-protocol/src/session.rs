use tokio::sync::watch;

use crate::error::KeysError;

/// An authenticated client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub device_id: String,
    pub access_token: String,
}

/// Readiness of the client session, observable without polling.
///
/// Clones share the same underlying state.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: std::sync::Arc<watch::Sender<Option<Session>>>,
    rx: watch::Receiver<Option<Session>>,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// The current session, or [`KeysError::SessionNotReady`] before login completes.
    pub fn current(&self) -> Result<Session, KeysError> {
        self.rx.borrow().clone().ok_or(KeysError::SessionNotReady)
    }

    pub fn is_ready(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait until a session is published.
    ///
    /// Resolves to [`KeysError::Cancelled`] if every sender is gone first.
    pub async fn wait_ready(&self) -> Result<Session, KeysError> {
        let mut rx = self.rx.clone();
        let ready = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| KeysError::Cancelled)?;
        (*ready).clone().ok_or(KeysError::SessionNotReady)
    }

    pub fn set(&self, session: Session) {
        tracing::info!(
            user_id = %session.user_id,
            device_id = %session.device_id,
            "session ready"
        );
        self.tx.send_replace(Some(session));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }
}
