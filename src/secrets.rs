//! # Account Key Secrets
//!
//! Materializes a provisioned account's access keys into a Kubernetes secret
//! and removes that secret when the account is deleted.
//!
//! The secret is keyed by the `CosmosDb` resource's own namespace and name,
//! so consumers mount it without knowing anything about the provider.

use crate::client::DocumentDbClient;
use crate::CosmosDb;
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Identity of a secret record: namespace and name of the owning resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

/// Abstract secret store the reconciler writes credential bundles into.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Create or replace the secret record. Idempotent.
    async fn upsert(&self, key: &SecretRef, data: BTreeMap<String, Vec<u8>>) -> Result<()>;

    /// Delete the secret record. Deleting a missing record is not an error.
    async fn delete(&self, key: &SecretRef) -> Result<()>;
}

/// Secret store backed by Kubernetes `Secret` objects.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: kube::Client,
}

impl KubeSecretStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl std::fmt::Debug for KubeSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSecretStore").finish()
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn upsert(&self, key: &SecretRef, data: BTreeMap<String, Vec<u8>>) -> Result<()> {
        let api = self.api(&key.namespace);

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(field, bytes)| (field, ByteString(bytes)))
                    .collect(),
            ),
            ..Default::default()
        };

        match api.get(&key.name).await {
            Ok(_) => {
                debug!("Replacing existing secret {}/{}", key.namespace, key.name);
                api.replace(&key.name, &PostParams::default(), &secret)
                    .await
                    .context(format!(
                        "Failed to replace secret {}/{}",
                        key.namespace, key.name
                    ))?;
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                info!("Creating secret {}/{}", key.namespace, key.name);
                api.create(&PostParams::default(), &secret)
                    .await
                    .context(format!(
                        "Failed to create secret {}/{}",
                        key.namespace, key.name
                    ))?;
            }
            Err(e) => {
                return Err(e).context(format!(
                    "Failed to look up secret {}/{}",
                    key.namespace, key.name
                ));
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &SecretRef) -> Result<()> {
        let api = self.api(&key.namespace);
        match api.delete(&key.name, &Default::default()).await {
            Ok(_) => {
                info!("Deleted secret {}/{}", key.namespace, key.name);
                Ok(())
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                debug!("Secret {}/{} already gone", key.namespace, key.name);
                Ok(())
            }
            Err(e) => Err(e).context(format!(
                "Failed to delete secret {}/{}",
                key.namespace, key.name
            )),
        }
    }
}

/// Secret key for an account's credential bundle.
pub fn account_secret_ref(account: &CosmosDb) -> SecretRef {
    SecretRef {
        namespace: account.namespace().unwrap_or_default(),
        name: account.name_any(),
    }
}

/// Fetch the account's keys from the provider and write them into the secret
/// store. Idempotent: an unchanged bundle just overwrites itself.
pub async fn materialize_account_keys(
    client: &dyn DocumentDbClient,
    store: &dyn SecretStore,
    account: &CosmosDb,
) -> Result<()> {
    let name = account.name_any();
    let keys = client
        .list_keys(&account.spec.resource_group, &name)
        .await
        .context(format!("Failed to list keys for account {name}"))?;

    let data: BTreeMap<String, Vec<u8>> = [
        ("primaryMasterKey", keys.primary_master_key.as_bytes()),
        ("secondaryMasterKey", keys.secondary_master_key.as_bytes()),
        (
            "primaryReadonlyMasterKey",
            keys.primary_readonly_master_key.as_bytes(),
        ),
        (
            "secondaryReadonlyMasterKey",
            keys.secondary_readonly_master_key.as_bytes(),
        ),
    ]
    .into_iter()
    .map(|(field, bytes)| (field.to_string(), bytes.to_vec()))
    .collect();

    store.upsert(&account_secret_ref(account), data).await
}

/// Remove the account's key secret. Safe to call when the secret was never
/// written.
pub async fn remove_account_keys(store: &dyn SecretStore, account: &CosmosDb) -> Result<()> {
    store.delete(&account_secret_ref(account)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AccountKeyBundle, ClientError, CreateAccountRequest, DatabaseAccount};
    use crate::{CosmosDbProperties, CosmosDbSpec};
    use std::sync::Mutex;

    struct StaticKeys;

    #[async_trait]
    impl DocumentDbClient for StaticKeys {
        async fn get(&self, _: &str, _: &str) -> Result<DatabaseAccount, ClientError> {
            unimplemented!("not exercised")
        }
        async fn create_or_update(
            &self,
            _: &str,
            _: &str,
            _: &CreateAccountRequest,
        ) -> Result<DatabaseAccount, ClientError> {
            unimplemented!("not exercised")
        }
        async fn delete(&self, _: &str, _: &str) -> Result<(), ClientError> {
            unimplemented!("not exercised")
        }
        async fn list_keys(&self, _: &str, _: &str) -> Result<AccountKeyBundle, ClientError> {
            Ok(AccountKeyBundle {
                primary_master_key: "pm".to_string(),
                secondary_master_key: "sm".to_string(),
                primary_readonly_master_key: "prm".to_string(),
                secondary_readonly_master_key: "srm".to_string(),
            })
        }
        async fn name_exists(&self, _: &str) -> Result<bool, ClientError> {
            unimplemented!("not exercised")
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        upserts: Mutex<Vec<(SecretRef, BTreeMap<String, Vec<u8>>)>>,
        deletes: Mutex<Vec<SecretRef>>,
    }

    #[async_trait]
    impl SecretStore for RecordingStore {
        async fn upsert(&self, key: &SecretRef, data: BTreeMap<String, Vec<u8>>) -> Result<()> {
            self.upserts.lock().unwrap().push((key.clone(), data));
            Ok(())
        }
        async fn delete(&self, key: &SecretRef) -> Result<()> {
            self.deletes.lock().unwrap().push(key.clone());
            Ok(())
        }
    }

    fn account() -> CosmosDb {
        let mut account = CosmosDb::new(
            "db1",
            CosmosDbSpec {
                resource_group: "rg1".to_string(),
                location: "eastus".to_string(),
                kind: Default::default(),
                properties: CosmosDbProperties::default(),
            },
        );
        account.metadata.namespace = Some("team-a".to_string());
        account
    }

    #[tokio::test]
    async fn materialize_writes_all_four_fields() {
        let store = RecordingStore::default();
        materialize_account_keys(&StaticKeys, &store, &account())
            .await
            .unwrap();

        let upserts = store.upserts.lock().unwrap();
        assert_eq!(upserts.len(), 1);
        let (key, data) = &upserts[0];
        assert_eq!(key.namespace, "team-a");
        assert_eq!(key.name, "db1");
        assert_eq!(data.get("primaryMasterKey").unwrap().as_slice(), &b"pm"[..]);
        assert_eq!(data.get("secondaryMasterKey").unwrap().as_slice(), &b"sm"[..]);
        assert_eq!(
            data.get("primaryReadonlyMasterKey").unwrap().as_slice(),
            &b"prm"[..]
        );
        assert_eq!(
            data.get("secondaryReadonlyMasterKey").unwrap().as_slice(),
            &b"srm"[..]
        );
    }

    #[tokio::test]
    async fn remove_targets_the_account_secret() {
        let store = RecordingStore::default();
        remove_account_keys(&store, &account()).await.unwrap();

        let deletes = store.deletes.lock().unwrap();
        assert_eq!(
            *deletes,
            vec![SecretRef {
                namespace: "team-a".to_string(),
                name: "db1".to_string(),
            }]
        );
    }
}
