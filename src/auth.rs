//! OAuth credential lifecycle.
//!
//! [`TokenRefresher`] hands out valid access tokens, refreshing and
//! persisting them when they are within five minutes of expiry. Refreshes
//! for one credential are single-flight: concurrent callers wait on a
//! per-credential lock and then read the freshly persisted token.
//!
//! [`authorize_url`] and [`exchange_code`] back the `filesync auth`
//! commands that create credentials in the first place.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, instrument};

use filesync_core::models::Credential;
use filesync_core::store::CredentialStore;
use filesync_core::{Result, SyncError};

use crate::connector::Connector;

pub struct TokenRefresher {
    store: Arc<dyn CredentialStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenRefresher {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, credential_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| SyncError::auth("credential lock table poisoned"))?;
        Ok(locks
            .entry(credential_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    /// A usable access token for `credential_id`, refreshing it first if
    /// it is missing, of unknown expiry, or expires within the margin.
    #[instrument(skip(self, connector), fields(connector = connector.name()))]
    pub async fn get_valid_access_token(
        &self,
        credential_id: &str,
        connector: &dyn Connector,
    ) -> Result<String> {
        let lock = self.lock_for(credential_id)?;
        let _guard = lock.lock().await;

        let mut credential = self
            .store
            .get_credential(credential_id)
            .await?
            .ok_or_else(|| SyncError::auth(format!("credential '{}' not found", credential_id)))?;

        let now = Utc::now();
        if !credential.needs_refresh(now) {
            if let Some(token) = credential.access_token {
                return Ok(token);
            }
        }

        if credential.refresh_token.is_none() {
            return Err(SyncError::auth(format!(
                "credential '{}' has no valid access token and no refresh token",
                credential_id
            )));
        }

        let grant = connector
            .refresh_tokens(&credential)
            .await
            .map_err(|e| match e {
                SyncError::Auth(_) => e,
                other => SyncError::auth(format!("token refresh failed: {}", other)),
            })?;
        credential.apply_grant(grant, Utc::now());
        self.store.save_credential(&credential).await?;
        info!(credential = credential_id, expires_at = ?credential.expires_at, "refreshed access token");

        credential
            .access_token
            .ok_or_else(|| SyncError::auth("refresh returned no access token"))
    }
}

/// Authorization URL and the random `state` it carries.
pub fn authorize_url(connector: &dyn Connector) -> Result<(String, String)> {
    let state = uuid::Uuid::new_v4().simple().to_string();
    let url = connector.build_authorize_url(&state)?;
    Ok((url, state))
}

/// Exchange an authorization code and store the resulting credential.
///
/// `id` defaults to a fresh UUID. An existing credential with the same id
/// is overwritten.
#[instrument(skip(store, connector, code), fields(connector = connector.name()))]
pub async fn exchange_code(
    store: &dyn CredentialStore,
    connector: &dyn Connector,
    code: &str,
    id: Option<String>,
) -> Result<Credential> {
    let grant = connector.exchange_code_for_tokens(code).await?;
    let (client_id, client_secret) = connector.client_credentials();
    let now = Utc::now();
    let mut credential = Credential {
        id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        provider: connector.name().to_string(),
        access_token: None,
        refresh_token: None,
        expires_at: None,
        client_id,
        client_secret,
        scopes: Vec::new(),
        updated_at: now,
    };
    credential.apply_grant(grant, now);
    store.save_credential(&credential).await?;
    info!(credential = %credential.id, "stored new credential");
    Ok(credential)
}
