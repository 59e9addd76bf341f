//! # Provisioning Client Trait
//!
//! Abstract interface to the provider's database account API.
//!
//! The reconciler only talks to this trait; the concrete ARM implementation
//! lives in [`crate::arm`] and tests substitute recording fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Error surface of the provisioning client.
///
/// `Api` carries the provider's error code verbatim; classification into
/// actionable categories happens in [`crate::errors`], nowhere else.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The provider accepted the request but the long-running operation has
    /// not completed yet.
    #[error("operation accepted by provider, provisioning incomplete")]
    OperationInProgress,
    /// Structured provider error, e.g. `ResourceGroupNotFound`.
    #[error("{code}: {message}")]
    Api { code: String, message: String },
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected provider response: {0}")]
    UnexpectedResponse(String),
}

/// Provider-side mirror of a database account. Read-only from the
/// reconciler's perspective.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseAccount {
    /// Fully-qualified resource id
    pub id: String,
    pub provisioning_state: String,
    pub document_endpoint: Option<String>,
}

/// Arguments for a create-or-update call, derived from the desired spec.
#[derive(Debug, Clone, Serialize)]
pub struct CreateAccountRequest {
    pub location: String,
    pub kind: crate::AccountKind,
    pub offer_type: crate::OfferType,
    pub tags: BTreeMap<String, String>,
}

/// Access keys for a database account.
///
/// Wiped from memory on drop; only ever persisted through the secret store.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct AccountKeyBundle {
    pub primary_master_key: String,
    pub secondary_master_key: String,
    pub primary_readonly_master_key: String,
    pub secondary_readonly_master_key: String,
}

impl std::fmt::Debug for AccountKeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKeyBundle")
            .field("primary_master_key", &"<redacted>")
            .field("secondary_master_key", &"<redacted>")
            .field("primary_readonly_master_key", &"<redacted>")
            .field("secondary_readonly_master_key", &"<redacted>")
            .finish()
    }
}

/// Client trait for the provider's database account operations
#[async_trait]
pub trait DocumentDbClient: Send + Sync {
    /// Fetch the account by identity.
    async fn get(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<DatabaseAccount, ClientError>;

    /// Submit the desired configuration. Returns the account as reported by
    /// the provider, or `OperationInProgress` when the request was accepted
    /// but is still settling server-side.
    async fn create_or_update(
        &self,
        resource_group: &str,
        name: &str,
        request: &CreateAccountRequest,
    ) -> Result<DatabaseAccount, ClientError>;

    /// Delete the account by identity.
    async fn delete(&self, resource_group: &str, name: &str) -> Result<(), ClientError>;

    /// List the account's access keys.
    async fn list_keys(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<AccountKeyBundle, ClientError>;

    /// Check whether the account name is taken anywhere in the provider's
    /// global namespace.
    async fn name_exists(&self, name: &str) -> Result<bool, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bundle_debug_is_redacted() {
        let bundle = AccountKeyBundle {
            primary_master_key: "pk".to_string(),
            secondary_master_key: "sk".to_string(),
            primary_readonly_master_key: "prk".to_string(),
            secondary_readonly_master_key: "srk".to_string(),
        };
        let rendered = format!("{bundle:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("pk"));
    }

    #[test]
    fn key_bundle_deserializes_provider_payload() {
        let json = serde_json::json!({
            "primaryMasterKey": "a",
            "secondaryMasterKey": "b",
            "primaryReadonlyMasterKey": "c",
            "secondaryReadonlyMasterKey": "d"
        });
        let bundle: AccountKeyBundle = serde_json::from_value(json).unwrap();
        assert_eq!(bundle.primary_master_key, "a");
        assert_eq!(bundle.secondary_readonly_master_key, "d");
    }
}
