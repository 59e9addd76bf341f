//! # Reconciler
//!
//! Core convergence logic for `CosmosDb` resources.
//!
//! Each invocation of [`Reconciler::ensure`] or [`Reconciler::delete`] is a
//! single synchronous unit of work: it computes the spec fingerprint, reads
//! the remote account, classifies any provider error, decides the next
//! action, mutates the observed status, and returns. It never waits for the
//! provider's long-running operations; "still working" is reported as
//! [`Outcome::InProgress`] and the runtime schedules the next call.
//!
//! ## Ensure flow
//!
//! 1. Fast exit when the account is provisioned for the current fingerprint
//! 2. Read the remote account and fold its state into status
//! 3. Suppress duplicate requests while a create is outstanding
//! 4. On `Succeeded` for the current fingerprint, materialize the key secret
//! 5. Otherwise submit create-or-update and classify the result

use crate::client::{ClientError, CreateAccountRequest, DocumentDbClient};
use crate::errors::{classify, CloudErrorKind};
use crate::secrets::{self, SecretStore};
use crate::{hash, AccountState, CosmosDb, CosmosDbStatus, SUCCESS_MSG};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a single reconciliation step.
///
/// Replaces the classic `(bool, error)` pair so call sites distinguish
/// "done", "call me again", and "give up" exhaustively.
#[derive(Debug)]
pub enum Outcome {
    /// Convergence confirmed; nothing left to do.
    Ready,
    /// Work submitted or pending; invoke again later.
    InProgress,
    /// Unrecoverable misconfiguration; reported via status, never requeued
    /// automatically.
    Terminal(String),
    /// Unexpected collaborator failure; the caller applies its own backoff.
    Transient(anyhow::Error),
}

/// Reference to a parent resource the account depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub namespace: String,
    pub name: String,
    pub kind: &'static str,
}

pub const RESOURCE_GROUP_KIND: &str = "ResourceGroup";

/// Drives a `CosmosDb` resource toward its desired configuration.
///
/// Collaborators are injected at construction and never swapped afterwards;
/// the reconciler holds no other state, so one instance serves any number of
/// resources as long as the caller serializes invocations per identity.
#[derive(Clone)]
pub struct Reconciler {
    accounts: Arc<dyn DocumentDbClient>,
    secrets: Arc<dyn SecretStore>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish()
    }
}

impl Reconciler {
    pub fn new(accounts: Arc<dyn DocumentDbClient>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { accounts, secrets }
    }

    /// Ensure the remote account matches the desired spec, folding progress
    /// into `status`. Field updates happen only after a remote call returns,
    /// so a cancelled invocation never leaves status half-mutated.
    pub async fn ensure(&self, account: &CosmosDb, status: &mut CosmosDbStatus) -> Outcome {
        let name = account.name_any();
        let group = account.spec.resource_group.clone();

        let hash = match hash::fingerprint(account) {
            Ok(hash) => hash,
            Err(e) => return Outcome::Transient(e.into()),
        };

        if status.provisioned && status.spec_hash.as_deref() == Some(hash.as_str()) {
            debug!("Account {} already provisioned for current spec", name);
            status.requested_at = None;
            return Outcome::Ready;
        }
        status.provisioned = false;
        if status.requested_at.is_none() {
            status.requested_at = Some(chrono::Utc::now().to_rfc3339());
        }

        match self.accounts.get(&group, &name).await {
            Ok(remote) => {
                status.resource_id = Some(remote.id);
                status.state = AccountState::from_provider(&remote.provisioning_state);
            }
            Err(err) => match classify(&err) {
                CloudErrorKind::ResourceGroupNotFound | CloudErrorKind::ParentNotFound => {
                    info!("Account {} waiting for resource group {}", name, group);
                    status.provisioning = false;
                    status.message = Some(err.to_string());
                    status.state = AccountState::Waiting;
                    return Outcome::InProgress;
                }
                CloudErrorKind::ResourceNotFound => {
                    // account does not exist yet, fall through to create
                }
                _ => {
                    status.message = Some(format!("Unhandled error after get: {err}"));
                }
            },
        }

        if status.state == AccountState::Creating {
            // avoid a second create-or-update while one is outstanding
            return Outcome::InProgress;
        }

        if status.state == AccountState::Succeeded
            && status.spec_hash.as_deref() == Some(hash.as_str())
        {
            // provisioning complete, publish the account keys
            if let Err(err) =
                secrets::materialize_account_keys(&*self.accounts, &*self.secrets, account).await
            {
                status.message = Some(err.to_string());
                return Outcome::Transient(err);
            }
            status.message = Some(SUCCESS_MSG.to_string());
            status.provisioning = false;
            status.provisioned = true;
            return Outcome::Ready;
        }

        if status.state == AccountState::Failed {
            return fail_terminal(status, format!("Failed to provision account {name}"));
        }

        let request = CreateAccountRequest {
            location: account.spec.location.clone(),
            kind: account.spec.kind,
            offer_type: account.spec.properties.database_account_offer_type,
            tags: account.labels().clone(),
        };

        status.provisioning = true;
        match self.accounts.create_or_update(&group, &name, &request).await {
            Ok(remote) => {
                status.spec_hash = Some(hash);
                status.resource_id = Some(remote.id);
                status.state = AccountState::from_provider(&remote.provisioning_state);
                status.provisioned = true;
                status.provisioning = false;
                status.message = Some(SUCCESS_MSG.to_string());
                // even a success response may still be settling server-side;
                // the next invocation re-derives truth from a fresh get
                Outcome::InProgress
            }
            Err(err) => match classify(&err) {
                CloudErrorKind::AsyncOperationIncomplete => {
                    status.state = AccountState::Creating;
                    status.message =
                        Some("Resource request successfully submitted to provider".to_string());
                    Outcome::InProgress
                }
                CloudErrorKind::InvalidResourceLocation | CloudErrorKind::LocationNotAvailable => {
                    fail_terminal(status, err.to_string())
                }
                CloudErrorKind::ResourceGroupNotFound | CloudErrorKind::ParentNotFound => {
                    status.provisioning = false;
                    status.message = Some(err.to_string());
                    Outcome::InProgress
                }
                CloudErrorKind::NotFound => self.disambiguate_not_found(status, &name, err).await,
                _ => {
                    status.message = Some(err.to_string());
                    Outcome::InProgress
                }
            },
        }
    }

    /// A `NotFound` on create-or-update either means the request raced the
    /// resource group or the account name is taken globally; only a
    /// name-existence check can tell the two apart.
    async fn disambiguate_not_found(
        &self,
        status: &mut CosmosDbStatus,
        name: &str,
        err: ClientError,
    ) -> Outcome {
        match self.accounts.name_exists(name).await {
            Err(check_err) => {
                status.message = Some(check_err.to_string());
                Outcome::Transient(check_err.into())
            }
            Ok(true) => fail_terminal(
                status,
                format!("Account name {name} already exists globally"),
            ),
            Ok(false) => {
                status.message = Some(err.to_string());
                Outcome::InProgress
            }
        }
    }

    /// Drop the remote account and its key secret.
    pub async fn delete(&self, account: &CosmosDb, status: &mut CosmosDbStatus) -> Outcome {
        // a terminally failed account was never durably created, so there is
        // nothing to delete remotely
        if status.failed_provisioning {
            return Outcome::Ready;
        }

        let name = account.name_any();
        let group = &account.spec.resource_group;

        match self.accounts.delete(group, &name).await {
            Ok(()) => self.remove_keys(account).await,
            Err(err) => {
                let kind = classify(&err);
                if kind == CloudErrorKind::AsyncOperationIncomplete {
                    // expected on the first try: deletion runs out of band
                    status.message =
                        Some("Deletion request successfully submitted to provider".to_string());
                    return Outcome::InProgress;
                }
                if kind.is_not_found_family() {
                    debug!("Account {} already absent on delete", name);
                    return self.remove_keys(account).await;
                }
                status.message = Some(err.to_string());
                Outcome::Transient(err.into())
            }
        }
    }

    async fn remove_keys(&self, account: &CosmosDb) -> Outcome {
        match secrets::remove_account_keys(&*self.secrets, account).await {
            Ok(()) => Outcome::Ready,
            Err(err) => {
                warn!("Failed to remove key secret for {}: {err}", account.name_any());
                Outcome::Transient(err)
            }
        }
    }

    /// Parents the account depends on, used by the runtime for dependency
    /// ordering. Pure: no I/O beyond reading the desired object.
    pub fn parents(account: &CosmosDb) -> Vec<ParentRef> {
        vec![ParentRef {
            namespace: account.namespace().unwrap_or_default(),
            name: account.spec.resource_group.clone(),
            kind: RESOURCE_GROUP_KIND,
        }]
    }
}

fn fail_terminal(status: &mut CosmosDbStatus, message: String) -> Outcome {
    status.state = AccountState::Failed;
    status.provisioning = false;
    status.provisioned = false;
    status.failed_provisioning = true;
    status.message = Some(message.clone());
    Outcome::Terminal(message)
}
