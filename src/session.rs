use crate::storage::{JsonStore, SESSION_KEY};
use log::{debug, error};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::{Deserialize, Serialize};

/// Source of the backend bearer token handed to devices during provisioning
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait AuthTokenSource: Send + Sync {
    /// The current token, or `None` if the user has no usable session
    fn auth_token(&self) -> Option<String>;
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct StoredSession {
    token: Option<String>,
}

/// Session token persisted by the login flow in the local store
#[derive(Clone, Debug)]
pub struct PersistedSession {
    store: JsonStore,
}

impl PersistedSession {
    pub fn new(store: JsonStore) -> Self {
        Self { store }
    }

    /// Persist a token obtained by the login flow
    pub fn store_token(&self, token: &str) -> anyhow::Result<()> {
        self.store.save(
            SESSION_KEY,
            &StoredSession {
                token: Some(token.to_string()),
            },
        )
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        self.store.remove(SESSION_KEY)
    }
}

impl AuthTokenSource for PersistedSession {
    fn auth_token(&self) -> Option<String> {
        let session = match self.store.load::<StoredSession>(SESSION_KEY) {
            Ok(session) => session,
            Err(e) => {
                error!("failed to read persisted session: {e:#}");
                return None;
            }
        };

        let token = session.token.filter(|token| !token.trim().is_empty());
        if token.is_none() {
            debug!("no persisted session token");
        }
        token
    }
}
