//! # Spec Fingerprinting
//!
//! Deterministic fingerprint of the desired account configuration, used to
//! decide whether a reconciliation needs to touch the provider at all.

use crate::CosmosDb;
use kube::ResourceExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Everything that participates in the fingerprint. Field order is fixed and
/// labels are a `BTreeMap`, so the JSON rendering is canonical.
#[derive(Serialize)]
struct FingerprintInput<'a> {
    name: String,
    resource_group: &'a str,
    location: &'a str,
    kind: crate::AccountKind,
    offer_type: crate::OfferType,
    labels: &'a BTreeMap<String, String>,
}

/// Compute the fingerprint of the desired configuration.
///
/// Any change to the resource group, name, location, kind, offer type, or
/// label set produces a different fingerprint.
pub fn fingerprint(account: &CosmosDb) -> Result<String, serde_json::Error> {
    static NO_LABELS: BTreeMap<String, String> = BTreeMap::new();

    let input = FingerprintInput {
        name: account.name_any(),
        resource_group: &account.spec.resource_group,
        location: &account.spec.location,
        kind: account.spec.kind,
        offer_type: account.spec.properties.database_account_offer_type,
        labels: account.metadata.labels.as_ref().unwrap_or(&NO_LABELS),
    };

    let bytes = serde_json::to_vec(&input)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccountKind, CosmosDbProperties, CosmosDbSpec};

    fn account(name: &str, group: &str, location: &str) -> CosmosDb {
        CosmosDb::new(
            name,
            CosmosDbSpec {
                resource_group: group.to_string(),
                location: location.to_string(),
                kind: AccountKind::default(),
                properties: CosmosDbProperties::default(),
            },
        )
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = account("db1", "rg1", "eastus");
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&a).unwrap());
    }

    #[test]
    fn fingerprint_changes_with_every_field() {
        let base = fingerprint(&account("db1", "rg1", "eastus")).unwrap();

        assert_ne!(base, fingerprint(&account("db2", "rg1", "eastus")).unwrap());
        assert_ne!(base, fingerprint(&account("db1", "rg2", "eastus")).unwrap());
        assert_ne!(base, fingerprint(&account("db1", "rg1", "westus")).unwrap());

        let mut kinded = account("db1", "rg1", "eastus");
        kinded.spec.kind = AccountKind::MongoDB;
        assert_ne!(base, fingerprint(&kinded).unwrap());
    }

    #[test]
    fn fingerprint_covers_labels() {
        let plain = account("db1", "rg1", "eastus");
        let mut labeled = account("db1", "rg1", "eastus");
        labeled.metadata.labels = Some(
            [("team".to_string(), "data".to_string())]
                .into_iter()
                .collect(),
        );
        assert_ne!(fingerprint(&plain).unwrap(), fingerprint(&labeled).unwrap());
    }

    #[test]
    fn fingerprint_ignores_label_insertion_order() {
        let mut a = account("db1", "rg1", "eastus");
        a.metadata.labels = Some(
            [("a", "1"), ("b", "2")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let mut b = account("db1", "rg1", "eastus");
        b.metadata.labels = Some(
            [("b", "2"), ("a", "1")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }
}
