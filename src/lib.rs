//! Cosmos DB Account Controller Library
//!
//! This library drives Azure Cosmos DB database accounts toward the desired
//! configuration declared in a `CosmosDb` custom resource, and materializes
//! the account access keys as a Kubernetes secret once provisioning succeeds.
//!
//! The provider performs account provisioning asynchronously, so the
//! reconciler never waits on it: every invocation is a short, idempotent
//! unit of work that reports whether convergence is complete, still in
//! progress, or failed, and leaves the re-invocation schedule to the
//! controller runtime.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod arm;
pub mod client;
pub mod errors;
pub mod hash;
pub mod reconciler;
pub mod runtime;
pub mod secrets;

/// Status message recorded once the provider accepts the desired state.
pub const SUCCESS_MSG: &str = "successfully provisioned";

/// CosmosDb Custom Resource Definition
///
/// Declares a single Cosmos DB database account inside an existing Azure
/// resource group. The account keys are written to a Kubernetes secret with
/// the same name and namespace as the resource.
///
/// # Example
///
/// ```yaml
/// apiVersion: database.microscaler.io/v1alpha1
/// kind: CosmosDb
/// metadata:
///   name: orders-db
///   namespace: default
/// spec:
///   resourceGroup: rg-orders
///   location: eastus
///   kind: GlobalDocumentDB
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "CosmosDb",
    group = "database.microscaler.io",
    version = "v1alpha1",
    namespaced,
    status = "CosmosDbStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Provisioned", "type":"boolean", "jsonPath":".status.provisioned"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CosmosDbSpec {
    /// Azure resource group the account is provisioned into.
    /// The resource group must exist before the account can be created;
    /// until it does the account reports a `Waiting` state.
    pub resource_group: String,
    /// Azure region for the account, e.g. "eastus"
    pub location: String,
    /// Database account kind
    #[serde(default)]
    pub kind: AccountKind,
    #[serde(default)]
    pub properties: CosmosDbProperties,
}

/// Database account kind, mirroring the provider's closed set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
pub enum AccountKind {
    #[default]
    GlobalDocumentDB,
    MongoDB,
    Parse,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CosmosDbProperties {
    /// Offer type for the database account. The provider currently accepts
    /// only `Standard`.
    #[serde(default)]
    pub database_account_offer_type: OfferType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
pub enum OfferType {
    #[default]
    Standard,
}

/// Observed status of a `CosmosDb` resource
///
/// Owned exclusively by the reconciler and persisted through the status
/// subresource between invocations.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CosmosDbStatus {
    /// Fingerprint of the last desired configuration that was applied or
    /// attempted
    #[serde(default)]
    pub spec_hash: Option<String>,
    /// Last observed provisioning state of the remote account
    #[serde(default)]
    pub state: AccountState,
    /// True while a remote operation is believed in flight
    #[serde(default)]
    pub provisioning: bool,
    /// True only once the remote account reached `Succeeded` for the current
    /// spec fingerprint
    #[serde(default)]
    pub provisioned: bool,
    /// Sticky flag: once provisioning fails terminally, deletion skips the
    /// remote delete call
    #[serde(default)]
    pub failed_provisioning: bool,
    /// Fully-qualified provider resource id
    #[serde(default)]
    pub resource_id: Option<String>,
    /// Human-readable description of the last reconciliation step
    #[serde(default)]
    pub message: Option<String>,
    /// When convergence was first requested (RFC3339); cleared once the
    /// account converges
    #[serde(default)]
    pub requested_at: Option<String>,
}

/// Provisioning lifecycle of a database account
///
/// Provider states outside this closed set collapse to `Unknown`, which
/// sends the reconciler back through the create-or-update path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
pub enum AccountState {
    #[default]
    Unknown,
    Waiting,
    Creating,
    Succeeded,
    Failed,
}

impl AccountState {
    /// Map a provider-reported provisioning state onto the closed set.
    ///
    /// `Initializing` and `Updating` count as `Creating` so that an account
    /// mid-flight never receives a second create-or-update request.
    pub fn from_provider(state: &str) -> Self {
        match state {
            "Creating" | "Initializing" | "Updating" => Self::Creating,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::Waiting => "Waiting",
            Self::Creating => "Creating",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}
