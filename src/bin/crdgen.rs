//! Prints the `CosmosDb` CustomResourceDefinition as YAML, for applying to a
//! cluster or committing to a deployment repo.

use cosmosdb_account_controller::CosmosDb;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&CosmosDb::crd())?);
    Ok(())
}
