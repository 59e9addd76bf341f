//! # CosmosDB Account Controller
//!
//! A Kubernetes controller that provisions Azure CosmosDB database accounts
//! from `CosmosDb` custom resources and materializes their access keys into
//! Kubernetes secrets.

use anyhow::{Context, Result};
use clap::Parser;
use cosmosdb_account_controller::arm::ArmDocumentDbClient;
use cosmosdb_account_controller::reconciler::Reconciler;
use cosmosdb_account_controller::runtime;
use cosmosdb_account_controller::secrets::KubeSecretStore;
use cosmosdb_account_controller::CosmosDb;
use kube::core::ApiResource;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Seconds between polls while remote provisioning is in flight
    #[arg(long, default_value_t = 30)]
    requeue_secs: u64,

    /// Seconds to wait before retrying after an unexpected failure
    #[arg(long, default_value_t = 60)]
    error_requeue_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cosmosdb_account_controller=info".into()),
        )
        .init();

    let args = Args::parse();
    info!("Starting CosmosDB Account Controller");

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("Failed to install rustls crypto provider: {e:?}"))?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let accounts =
        ArmDocumentDbClient::from_env().context("Failed to configure the ARM client")?;
    let secrets = KubeSecretStore::new(client.clone());
    let reconciler = Reconciler::new(Arc::new(accounts), Arc::new(secrets));

    let ctx = Arc::new(runtime::Context {
        client,
        resource: ApiResource::erase::<CosmosDb>(&()),
        reconciler,
        requeue: Duration::from_secs(args.requeue_secs),
        error_requeue: Duration::from_secs(args.error_requeue_secs),
    });

    runtime::run(ctx).await
}
