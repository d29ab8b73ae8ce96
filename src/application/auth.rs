//! Authentication collaborator.
//!
//! Holds the credential used to authorize remote calls and broadcasts login
//! and logout. Obtaining the credential (password flows, token refresh) is
//! outside this crate.

use std::fmt;

use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: Uuid,
    pub access_token: String,
}

impl Credential {
    pub fn new(user_id: Uuid, access_token: impl Into<String>) -> Self {
        Self {
            user_id,
            access_token: access_token.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

pub struct AuthSession {
    sender: watch::Sender<Option<Credential>>,
}

impl AuthSession {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(None);
        Self { sender }
    }

    pub fn with_credential(credential: Credential) -> Self {
        let session = Self::new();
        session.sign_in(credential);
        session
    }

    pub fn current(&self) -> Option<Credential> {
        self.sender.borrow().clone()
    }

    /// Stream of credential changes; the receiver starts at the current value.
    pub fn changes(&self) -> watch::Receiver<Option<Credential>> {
        self.sender.subscribe()
    }

    /// Install a credential. Re-installing the same access token is a no-op
    /// and does not notify watchers.
    pub fn sign_in(&self, credential: Credential) -> bool {
        let user_id = credential.user_id;
        let changed = self.sender.send_if_modified(|current| {
            let same_token = current
                .as_ref()
                .is_some_and(|existing| existing.access_token == credential.access_token);
            if same_token {
                return false;
            }
            *current = Some(credential);
            true
        });
        if changed {
            info!(user_id = %user_id, "Credential installed");
        }
        changed
    }

    pub fn sign_out(&self) -> bool {
        let changed = self.sender.send_if_modified(|current| current.take().is_some());
        if changed {
            info!("Credential revoked");
        }
        changed
    }
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}
