//! # Controller Runtime
//!
//! Watch loop and glue between the Kubernetes API and the reconciler core.
//!
//! The watch runs over `DynamicObject` so the boundary into the typed core
//! is explicit: every object is converted through [`as_cosmos_db`] before
//! the reconciler sees it, and an unexpected kind is rejected with a
//! `TypeMismatch` error instead of being silently dropped.

use crate::reconciler::{Outcome, Reconciler};
use crate::{CosmosDb, CosmosDbStatus};
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::finalizer::{finalizer, Event};
use kube_runtime::{watcher, Controller};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const FINALIZER: &str = "cosmosdb.database.microscaler.io/finalizer";
const FIELD_MANAGER: &str = "cosmosdb-account-controller";

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("unexpected kind {found:?}, expected CosmosDb")]
    TypeMismatch { found: String },
    #[error("object is not a valid CosmosDb: {0}")]
    Conversion(#[source] serde_json::Error),
    #[error("failed to patch status: {0}")]
    StatusUpdate(#[source] kube::Error),
    #[error("ensure failed: {0}")]
    Ensure(anyhow::Error),
    #[error("delete failed: {0}")]
    Delete(anyhow::Error),
    #[error("remote deletion still in progress")]
    DeletionPending,
    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube_runtime::finalizer::Error<ReconcilerError>>),
}

/// Shared state handed to every reconciliation.
pub struct Context {
    pub client: kube::Client,
    pub resource: ApiResource,
    pub reconciler: Reconciler,
    /// Requeue interval while remote work is in flight
    pub requeue: Duration,
    /// Requeue interval after an unexpected failure
    pub error_requeue: Duration,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("requeue", &self.requeue)
            .field("error_requeue", &self.error_requeue)
            .finish()
    }
}

/// Typed boundary: convert a watched object into the core's resource type.
pub fn as_cosmos_db(obj: &DynamicObject) -> Result<CosmosDb, ReconcilerError> {
    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_default();
    if kind != CosmosDb::kind(&()) {
        return Err(ReconcilerError::TypeMismatch { found: kind });
    }
    let value = serde_json::to_value(obj).map_err(ReconcilerError::Conversion)?;
    serde_json::from_value(value).map_err(ReconcilerError::Conversion)
}

/// Reconcile entry point invoked by the controller for every watched change.
pub async fn reconcile(
    obj: Arc<DynamicObject>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    let namespace = obj.namespace().unwrap_or_default();
    let api: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), &namespace, &ctx.resource);

    finalizer(&api, FINALIZER, obj, |event| {
        let ctx = ctx.clone();
        async move {
            match event {
                Event::Apply(obj) => apply(&obj, &ctx).await,
                Event::Cleanup(obj) => cleanup(&obj, &ctx).await,
            }
        }
    })
    .await
    .map_err(|e| ReconcilerError::Finalizer(Box::new(e)))
}

async fn apply(obj: &DynamicObject, ctx: &Context) -> Result<Action, ReconcilerError> {
    let account = as_cosmos_db(obj)?;
    let name = account.name_any();
    info!("Reconciling CosmosDb {name}");

    let mut status = account.status.clone().unwrap_or_default();
    let outcome = ctx.reconciler.ensure(&account, &mut status).await;
    patch_status(ctx, &account, &status).await?;

    match outcome {
        Outcome::Ready => {
            info!("CosmosDb {name} converged");
            Ok(Action::await_change())
        }
        Outcome::InProgress => Ok(Action::requeue(ctx.requeue)),
        Outcome::Terminal(message) => {
            warn!("Giving up on CosmosDb {name}: {message}");
            Ok(Action::await_change())
        }
        Outcome::Transient(err) => Err(ReconcilerError::Ensure(err)),
    }
}

async fn cleanup(obj: &DynamicObject, ctx: &Context) -> Result<Action, ReconcilerError> {
    let account = as_cosmos_db(obj)?;
    let name = account.name_any();
    info!("Deleting CosmosDb {name}");

    let mut status = account.status.clone().unwrap_or_default();
    let outcome = ctx.reconciler.delete(&account, &mut status).await;
    patch_status(ctx, &account, &status).await?;

    match outcome {
        Outcome::Ready | Outcome::Terminal(_) => {
            info!("CosmosDb {name} deleted");
            Ok(Action::await_change())
        }
        // returning an error keeps the finalizer in place until the remote
        // deletion settles
        Outcome::InProgress => Err(ReconcilerError::DeletionPending),
        Outcome::Transient(err) => Err(ReconcilerError::Delete(err)),
    }
}

async fn patch_status(
    ctx: &Context,
    account: &CosmosDb,
    status: &CosmosDbStatus,
) -> Result<(), ReconcilerError> {
    let namespace = account.namespace().unwrap_or_default();
    let api: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), &namespace, &ctx.resource);

    let patch = serde_json::json!({ "status": status });
    match api
        .patch_status(
            &account.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(_) => Ok(()),
        // the object may disappear mid-deletion; nothing left to record
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            debug!("CosmosDb {} vanished before status patch", account.name_any());
            Ok(())
        }
        Err(e) => Err(ReconcilerError::StatusUpdate(e)),
    }
}

/// Error policy for the controller: log and requeue with the configured
/// backoff interval.
pub fn error_policy(
    obj: Arc<DynamicObject>,
    error: &ReconcilerError,
    ctx: Arc<Context>,
) -> Action {
    // a pending remote deletion is expected on the first tries, keep it quiet
    if matches!(
        error,
        ReconcilerError::Finalizer(_) | ReconcilerError::DeletionPending
    ) {
        warn!("Reconciliation of {} incomplete: {error}", obj.name_any());
    } else {
        error!("Reconciliation of {} failed: {error}", obj.name_any());
    }
    Action::requeue(ctx.error_requeue)
}

/// Run the controller watch loop until shutdown.
pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    let api: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &ctx.resource);
    let resource = ctx.resource.clone();

    info!("Starting controller watch loop...");
    Controller::new_with(api, watcher::Config::default().any_semantic(), resource)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!("Reconciled {obj}"),
                Err(e) => warn!("Reconciliation error: {e}"),
            }
        })
        .await;
    info!("Controller watch loop terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic(kind: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "database.microscaler.io/v1alpha1",
            "kind": kind,
            "metadata": { "name": "db1", "namespace": "default" },
            "spec": { "resourceGroup": "rg1", "location": "eastus" }
        }))
        .unwrap()
    }

    #[test]
    fn conversion_accepts_cosmos_db_objects() {
        let account = as_cosmos_db(&dynamic("CosmosDb")).unwrap();
        assert_eq!(account.spec.resource_group, "rg1");
        assert_eq!(account.spec.location, "eastus");
        assert!(account.status.is_none());
    }

    #[test]
    fn conversion_rejects_unexpected_kinds() {
        let err = as_cosmos_db(&dynamic("SecretManagerConfig")).unwrap_err();
        match err {
            ReconcilerError::TypeMismatch { found } => {
                assert_eq!(found, "SecretManagerConfig");
            }
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn conversion_rejects_malformed_specs() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "database.microscaler.io/v1alpha1",
            "kind": "CosmosDb",
            "metadata": { "name": "db1" },
            "spec": { "location": "eastus" }
        }))
        .unwrap();
        assert!(matches!(
            as_cosmos_db(&obj),
            Err(ReconcilerError::Conversion(_))
        ));
    }

    #[test]
    fn conversion_preserves_existing_status() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "database.microscaler.io/v1alpha1",
            "kind": "CosmosDb",
            "metadata": { "name": "db1", "namespace": "default" },
            "spec": { "resourceGroup": "rg1", "location": "eastus" },
            "status": { "state": "Creating", "provisioning": true }
        }))
        .unwrap();
        let account = as_cosmos_db(&obj).unwrap();
        let status = account.status.unwrap();
        assert_eq!(status.state, crate::AccountState::Creating);
        assert!(status.provisioning);
    }
}
