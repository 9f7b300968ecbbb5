//! Box connector.
//!
//! Lists folders through the Box Content API, downloads file content, and
//! performs the OAuth 2.0 authorization-code and refresh-token exchanges.
//!
//! # Configuration
//!
//! ```toml
//! [connectors.box]
//! client_id = "..."
//! client_secret = "..."
//! redirect_uri = "http://localhost:7331/oauth/callback"
//! ```
//!
//! `api_base`, `authorize_url`, and `token_url` default to the public Box
//! endpoints and can be pointed at a test server.
//!
//! Document ids are `box:<file id>` and links are
//! `https://app.box.com/file/<file id>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use filesync_core::enumerate::{EntryKind, FolderSource, RemoteEntry, RemoteEnumerator};
use filesync_core::models::{Credential, FileDescriptor, ScopeConfig, TokenGrant};
use filesync_core::{Result, SyncError};

use crate::config::BoxConnectorConfig;
use crate::connector::Connector;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const LIST_FIELDS: &str = "id,type,name,modified_at,size,sha1,item_status";

pub struct BoxConnector {
    config: BoxConnectorConfig,
    client: reqwest::Client,
    enumerator: RemoteEnumerator,
}

impl BoxConnector {
    pub fn new(config: BoxConnectorConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            config,
            client,
            enumerator: RemoteEnumerator::new(),
        })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant> {
        let response = self
            .client
            .post(&self.config.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| SyncError::auth(format!("token endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::auth(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let raw: RawTokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::auth(format!("invalid token response: {}", e)))?;
        Ok(raw.into_grant())
    }
}

#[derive(Debug, Deserialize)]
struct ItemsPage {
    #[serde(default)]
    entries: Vec<BoxItem>,
}

#[derive(Debug, Deserialize)]
struct BoxItem {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    sha1: Option<String>,
    #[serde(default)]
    item_status: Option<String>,
}

impl BoxItem {
    fn into_entry(self) -> Option<RemoteEntry> {
        let kind = match self.kind.as_str() {
            "file" => EntryKind::File,
            "folder" => EntryKind::Folder,
            // web links and other item types carry no content
            _ => return None,
        };
        let trashed = matches!(self.item_status.as_deref(), Some("trashed") | Some("deleted"));
        Some(RemoteEntry {
            id: self.id,
            name: self.name,
            kind,
            size: self.size.unwrap_or(0),
            modified_at: self.modified_at,
            checksum: self.sha1,
            trashed,
        })
    }
}

/// Box token response. Box returns `restricted_to` rather than a scope list,
/// so granted scopes come from the space-separated `scope` field when present.
#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl RawTokenResponse {
    fn into_grant(self) -> TokenGrant {
        TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_in: self.expires_in,
            scopes: self
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect()),
        }
    }
}

#[async_trait]
impl FolderSource for BoxConnector {
    #[instrument(skip(self, access_token), fields(folder = folder_id))]
    async fn list_folder_page(
        &self,
        access_token: &str,
        folder_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RemoteEntry>> {
        let url = format!(
            "{}/folders/{}/items",
            self.config.api_base.trim_end_matches('/'),
            folder_id
        );
        let limit_s = limit.to_string();
        let offset_s = offset.to_string();
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .query(&[
                ("fields", LIST_FIELDS),
                ("limit", limit_s.as_str()),
                ("offset", offset_s.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SyncError::remote(format!("listing folder {}: {}", folder_id, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::remote(format!(
                "listing folder {} returned {}: {}",
                folder_id, status, body
            )));
        }

        let page: ItemsPage = response
            .json()
            .await
            .map_err(|e| SyncError::remote(format!("invalid folder listing: {}", e)))?;
        debug!(entries = page.entries.len(), offset, "fetched page");
        Ok(page
            .entries
            .into_iter()
            .filter_map(BoxItem::into_entry)
            .collect())
    }
}

#[async_trait]
impl Connector for BoxConnector {
    fn name(&self) -> &str {
        "box"
    }

    fn document_link(&self, source_id: &str) -> Option<String> {
        Some(format!("https://app.box.com/file/{}", source_id))
    }

    async fn list_all_items(
        &self,
        access_token: &str,
        config: &ScopeConfig,
    ) -> Result<Vec<FileDescriptor>> {
        self.enumerator.list_all(self, access_token, config).await
    }

    #[instrument(skip(self, access_token))]
    async fn download(&self, access_token: &str, source_id: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/files/{}/content",
            self.config.api_base.trim_end_matches('/'),
            source_id
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| SyncError::remote(format!("downloading file {}: {}", source_id, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::remote(format!(
                "downloading file {} returned {}",
                source_id, status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SyncError::remote(format!("reading file {}: {}", source_id, e)))?;
        Ok(bytes.to_vec())
    }

    fn build_authorize_url(&self, state: &str) -> Result<String> {
        let mut params = vec![
            ("response_type", "code"),
            ("client_id", self.config.client_id.as_str()),
            ("state", state),
        ];
        if let Some(redirect) = &self.config.redirect_uri {
            params.push(("redirect_uri", redirect.as_str()));
        }
        let url = reqwest::Url::parse_with_params(&self.config.authorize_url, &params)
            .map_err(|e| SyncError::auth(format!("invalid authorize_url: {}", e)))?;
        Ok(url.to_string())
    }

    #[instrument(skip_all)]
    async fn exchange_code_for_tokens(&self, code: &str) -> Result<TokenGrant> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        if let Some(redirect) = &self.config.redirect_uri {
            form.push(("redirect_uri", redirect.as_str()));
        }
        self.token_request(&form).await
    }

    #[instrument(skip_all, fields(credential = %credential.id))]
    async fn refresh_tokens(&self, credential: &Credential) -> Result<TokenGrant> {
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .ok_or_else(|| SyncError::auth(format!("credential '{}' has no refresh token", credential.id)))?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", credential.client_id.as_str()),
            ("client_secret", credential.client_secret.as_str()),
        ];
        self.token_request(&form).await
    }

    fn client_credentials(&self) -> (String, String) {
        (
            self.config.client_id.clone(),
            self.config.client_secret.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> BoxConnector {
        BoxConnector::new(BoxConnectorConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_uri: Some("http://localhost:7331/callback".into()),
            api_base: "https://api.box.com/2.0".into(),
            authorize_url: "https://account.box.com/api/oauth2/authorize".into(),
            token_url: "https://api.box.com/oauth2/token".into(),
        })
        .unwrap()
    }

    #[test]
    fn test_authorize_url_carries_client_and_state() {
        let url = connector().build_authorize_url("xyz 1").unwrap();
        assert!(url.starts_with("https://account.box.com/api/oauth2/authorize?"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("state=xyz+1"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A7331%2Fcallback"));
    }

    #[test]
    fn test_ids_and_links() {
        let c = connector();
        assert_eq!(c.document_id("123"), "box:123");
        assert_eq!(
            c.document_link("123").as_deref(),
            Some("https://app.box.com/file/123")
        );
    }

    #[test]
    fn test_items_page_parsing() {
        let page: ItemsPage = serde_json::from_value(serde_json::json!({
            "total_count": 3,
            "entries": [
                {"type": "file", "id": "11", "name": "a.pdf", "size": 10, "sha1": "abc",
                 "modified_at": "2024-05-01T10:00:00-07:00", "item_status": "active"},
                {"type": "folder", "id": "100", "name": "sub"},
                {"type": "file", "id": "12", "name": "b.pdf", "size": 5, "item_status": "trashed"},
                {"type": "web_link", "id": "13", "name": "link"}
            ]
        }))
        .unwrap();
        let entries: Vec<RemoteEntry> = page
            .entries
            .into_iter()
            .filter_map(BoxItem::into_entry)
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].checksum.as_deref(), Some("abc"));
        assert!(entries[0].modified_at.is_some());
        assert_eq!(entries[1].kind, EntryKind::Folder);
        assert!(entries[2].trashed);
    }

    #[test]
    fn test_token_response_to_grant() {
        let raw: RawTokenResponse = serde_json::from_value(serde_json::json!({
            "access_token": "at",
            "refresh_token": "rt",
            "expires_in": 4000,
            "token_type": "bearer",
            "scope": "root_readonly manage_webhook"
        }))
        .unwrap();
        let grant = raw.into_grant();
        assert_eq!(grant.access_token, "at");
        assert_eq!(grant.expires_in, Some(4000));
        assert_eq!(
            grant.scopes,
            Some(vec!["root_readonly".to_string(), "manage_webhook".to_string()])
        );
    }
}
