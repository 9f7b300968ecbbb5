//! Remote provider capability and connector registry.
//!
//! A [`Connector`] is everything the sync pipeline needs from one remote
//! document store: listing, download, and the OAuth token exchanges. The
//! orchestrator resolves connectors by name through a
//! [`ConnectorRegistry`], so adding a provider never touches the pipeline.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │      ConnectorRegistry       │
//! │  ┌───────┐  ┌─────────────┐  │
//! │  │  box  │  │ (fixtures)  │  │
//! │  └───────┘  └─────────────┘  │
//! └──────────────┬───────────────┘
//!                ▼
//!   SyncOrchestrator / TokenRefresher
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use filesync_core::models::{Credential, FileDescriptor, ScopeConfig, TokenGrant};
use filesync_core::{Result, SyncError};

use crate::config::Config;
use crate::connector_box::BoxConnector;

/// A remote document store behind a single capability interface.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Registry name, matched against a scope's `connector` field.
    fn name(&self) -> &str;

    /// Provider-prefixed document id for a provider-native id.
    fn document_id(&self, source_id: &str) -> String {
        format!("{}:{}", self.name(), source_id)
    }

    /// Web link for a file, if the provider has one.
    fn document_link(&self, source_id: &str) -> Option<String>;

    /// Every admitted file under the scope's configured roots.
    async fn list_all_items(
        &self,
        access_token: &str,
        config: &ScopeConfig,
    ) -> Result<Vec<FileDescriptor>>;

    /// Raw content of one file.
    async fn download(&self, access_token: &str, source_id: &str) -> Result<Vec<u8>>;

    /// URL the user visits to grant access. `state` is echoed back.
    fn build_authorize_url(&self, state: &str) -> Result<String>;

    async fn exchange_code_for_tokens(&self, code: &str) -> Result<TokenGrant>;

    async fn refresh_tokens(&self, credential: &Credential) -> Result<TokenGrant>;

    /// Client credentials stored with newly authorized credentials.
    fn client_credentials(&self) -> (String, String);
}

/// Connectors by name.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every connector configured in `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        if let Some(box_config) = &config.connectors.box_ {
            registry.register(Arc::new(BoxConnector::new(box_config.clone())?));
        }
        Ok(registry)
    }

    /// Register a connector, replacing any previous one with the same name.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.name().to_string(), connector);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Connector>> {
        self.connectors.get(name).cloned().ok_or_else(|| {
            SyncError::remote(format!(
                "unknown connector '{}'. Registered: {}",
                name,
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedConnector(&'static str);

    #[async_trait]
    impl Connector for NamedConnector {
        fn name(&self) -> &str {
            self.0
        }
        fn document_link(&self, _source_id: &str) -> Option<String> {
            None
        }
        async fn list_all_items(&self, _: &str, _: &ScopeConfig) -> Result<Vec<FileDescriptor>> {
            Ok(Vec::new())
        }
        async fn download(&self, _: &str, _: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn build_authorize_url(&self, state: &str) -> Result<String> {
            Ok(format!("https://auth.test/?state={}", state))
        }
        async fn exchange_code_for_tokens(&self, _: &str) -> Result<TokenGrant> {
            Err(SyncError::auth("not supported"))
        }
        async fn refresh_tokens(&self, _: &Credential) -> Result<TokenGrant> {
            Err(SyncError::auth("not supported"))
        }
        fn client_credentials(&self) -> (String, String) {
            (String::new(), String::new())
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ConnectorRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(NamedConnector("alpha")));
        registry.register(Arc::new(NamedConnector("beta")));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("alpha").unwrap().name(), "alpha");
        assert_eq!(registry.get("beta").unwrap().document_id("9"), "beta:9");
        assert_eq!(registry.names(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_unknown_connector_is_remote_error() {
        let registry = ConnectorRegistry::new();
        let err = registry.get("gdrive").err().unwrap();
        assert!(matches!(err, SyncError::Remote(_)));
    }
}
