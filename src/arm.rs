//! # ARM Document DB Client
//!
//! Native REST implementation of [`DocumentDbClient`] against the Azure
//! Resource Manager API. Uses reqwest for HTTP and the OAuth2 client
//! credentials flow for authentication.
//!
//! References:
//! - [Cosmos DB database accounts REST API](https://learn.microsoft.com/rest/api/cosmos-db-resource-provider/database-accounts)

use crate::client::{
    AccountKeyBundle, ClientError, CreateAccountRequest, DatabaseAccount, DocumentDbClient,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

const API_VERSION: &str = "2021-10-15";
const MANAGEMENT_BASE_URL: &str = "https://management.azure.com";
const LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Service principal credentials for the client credentials flow.
///
/// Read from the `AZURE_TENANT_ID` / `AZURE_CLIENT_ID` / `AZURE_CLIENT_SECRET`
/// environment, the same variables the Azure SDKs consume.
#[derive(Clone)]
pub struct AadCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for AadCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AadCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// ARM-backed database account client
pub struct ArmDocumentDbClient {
    http: reqwest::Client,
    base_url: String,
    login_url: String,
    subscription_id: String,
    credentials: AadCredentials,
    token: RwLock<Option<CachedToken>>,
}

impl std::fmt::Debug for ArmDocumentDbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmDocumentDbClient")
            .field("base_url", &self.base_url)
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ArmAccountProperties {
    #[serde(default)]
    provisioning_state: Option<String>,
    #[serde(default)]
    document_endpoint: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmDatabaseAccount {
    id: String,
    #[serde(default)]
    properties: ArmAccountProperties,
}

impl From<ArmDatabaseAccount> for DatabaseAccount {
    fn from(arm: ArmDatabaseAccount) -> Self {
        Self {
            id: arm.id,
            provisioning_state: arm.properties.provisioning_state.unwrap_or_default(),
            document_endpoint: arm.properties.document_endpoint,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateAccountBody<'a> {
    location: &'a str,
    kind: crate::AccountKind,
    tags: &'a BTreeMap<String, String>,
    properties: CreateAccountProperties<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateAccountProperties<'a> {
    database_account_offer_type: crate::OfferType,
    locations: Vec<AccountLocation<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountLocation<'a> {
    location_name: &'a str,
    failover_priority: u32,
}

/// ARM error envelope, either nested under `error` or flattened at the top
/// level depending on the endpoint.
#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

fn error_from_response(status: StatusCode, body: &str) -> ClientError {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        if let Some(inner) = envelope.error {
            return ClientError::Api {
                code: inner.code,
                message: inner.message,
            };
        }
        if let (Some(code), Some(message)) = (envelope.code, envelope.message) {
            return ClientError::Api { code, message };
        }
    }
    // body was not a recognizable envelope, synthesize a code from the status
    let code = match status {
        StatusCode::NOT_FOUND => "NotFound".to_string(),
        other => other
            .canonical_reason()
            .unwrap_or("UnknownStatus")
            .replace(' ', ""),
    };
    ClientError::Api {
        code,
        message: format!("provider returned HTTP {status}: {body}"),
    }
}

impl ArmDocumentDbClient {
    pub fn new(subscription_id: String, credentials: AadCredentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: MANAGEMENT_BASE_URL.to_string(),
            login_url: LOGIN_BASE_URL.to_string(),
            subscription_id,
            credentials,
            token: RwLock::new(None),
        }
    }

    /// Build a client from the standard Azure environment variables.
    pub fn from_env() -> Result<Self> {
        let subscription_id = std::env::var("AZURE_SUBSCRIPTION_ID")
            .context("AZURE_SUBSCRIPTION_ID is not set")?;
        let credentials = AadCredentials {
            tenant_id: std::env::var("AZURE_TENANT_ID").context("AZURE_TENANT_ID is not set")?,
            client_id: std::env::var("AZURE_CLIENT_ID").context("AZURE_CLIENT_ID is not set")?,
            client_secret: std::env::var("AZURE_CLIENT_SECRET")
                .context("AZURE_CLIENT_SECRET is not set")?,
        };
        info!(
            "Using service principal {} against subscription {}",
            credentials.client_id, subscription_id
        );
        Ok(Self::new(subscription_id, credentials))
    }

    fn account_url(&self, resource_group: &str, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.DocumentDB/databaseAccounts/{}?api-version={}",
            self.base_url, self.subscription_id, resource_group, name, API_VERSION
        )
    }

    fn list_keys_url(&self, resource_group: &str, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.DocumentDB/databaseAccounts/{}/listKeys?api-version={}",
            self.base_url, self.subscription_id, resource_group, name, API_VERSION
        )
    }

    fn name_check_url(&self, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.DocumentDB/databaseAccountNames/{}?api-version={}",
            self.base_url, name, API_VERSION
        )
    }

    /// Return a valid bearer token, refreshing through the client
    /// credentials flow when the cached one is about to expire.
    async fn bearer_token(&self) -> Result<String, ClientError> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() {
                    return Ok(token.value.clone());
                }
            }
        }

        let mut cached = self.token.write().await;
        // another task may have refreshed while we waited for the lock
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        debug!("Refreshing ARM access token");
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.login_url, self.credentials.tenant_id
        );
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", MANAGEMENT_SCOPE),
        ];
        let response = self.http.post(&url).form(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::UnexpectedResponse(format!(
                "token request failed with HTTP {status}: {body}"
            )));
        }
        let token: TokenResponse = response.json().await?;
        // refresh a minute early so in-flight requests never carry a token
        // that expires mid-call
        let expires_at =
            Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(60));
        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at,
        });
        Ok(value)
    }

    async fn parse_account(
        &self,
        response: reqwest::Response,
    ) -> Result<DatabaseAccount, ClientError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_from_response(status, &body));
        }
        let account: ArmDatabaseAccount = serde_json::from_str(&body).map_err(|e| {
            ClientError::UnexpectedResponse(format!("account payload did not parse: {e}"))
        })?;
        Ok(account.into())
    }
}

#[async_trait]
impl DocumentDbClient for ArmDocumentDbClient {
    async fn get(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<DatabaseAccount, ClientError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(self.account_url(resource_group, name))
            .bearer_auth(token)
            .send()
            .await?;
        self.parse_account(response).await
    }

    async fn create_or_update(
        &self,
        resource_group: &str,
        name: &str,
        request: &CreateAccountRequest,
    ) -> Result<DatabaseAccount, ClientError> {
        let token = self.bearer_token().await?;
        let body = CreateAccountBody {
            location: &request.location,
            kind: request.kind,
            tags: &request.tags,
            properties: CreateAccountProperties {
                database_account_offer_type: request.offer_type,
                locations: vec![AccountLocation {
                    location_name: &request.location,
                    failover_priority: 0,
                }],
            },
        };
        info!("Submitting create-or-update for account {name}");
        let response = self
            .http
            .put(self.account_url(resource_group, name))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::ACCEPTED {
            return Err(ClientError::OperationInProgress);
        }
        self.parse_account(response).await
    }

    async fn delete(&self, resource_group: &str, name: &str) -> Result<(), ClientError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .delete(self.account_url(resource_group, name))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return Err(ClientError::OperationInProgress);
        }
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await?;
        Err(error_from_response(status, &body))
    }

    async fn list_keys(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<AccountKeyBundle, ClientError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .post(self.list_keys_url(resource_group, name))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_from_response(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| {
            ClientError::UnexpectedResponse(format!("key payload did not parse: {e}"))
        })
    }

    async fn name_exists(&self, name: &str) -> Result<bool, ClientError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .head(self.name_check_url(name))
            .bearer_auth(token)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(ClientError::UnexpectedResponse(format!(
                "name check returned HTTP {status}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccountKind, OfferType};

    #[test]
    fn nested_error_envelope_parses() {
        let body = r#"{"error":{"code":"ResourceGroupNotFound","message":"Resource group 'rg1' could not be found."}}"#;
        let err = error_from_response(StatusCode::NOT_FOUND, body);
        match err {
            ClientError::Api { code, message } => {
                assert_eq!(code, "ResourceGroupNotFound");
                assert!(message.contains("rg1"));
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn flat_error_envelope_parses() {
        let body = r#"{"code":"NotFound","message":"Entity with the specified id does not exist."}"#;
        let err = error_from_response(StatusCode::NOT_FOUND, body);
        match err {
            ClientError::Api { code, .. } => assert_eq!(code, "NotFound"),
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_404_falls_back_to_not_found_code() {
        let err = error_from_response(StatusCode::NOT_FOUND, "404 page not found");
        match err {
            ClientError::Api { code, .. } => assert_eq!(code, "NotFound"),
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_500_synthesizes_status_code() {
        let err = error_from_response(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        match err {
            ClientError::Api { code, message } => {
                assert_eq!(code, "InternalServerError");
                assert!(message.contains("boom"));
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn create_body_matches_provider_schema() {
        let tags: BTreeMap<String, String> =
            [("team".to_string(), "data".to_string())].into_iter().collect();
        let body = CreateAccountBody {
            location: "eastus",
            kind: AccountKind::GlobalDocumentDB,
            tags: &tags,
            properties: CreateAccountProperties {
                database_account_offer_type: OfferType::Standard,
                locations: vec![AccountLocation {
                    location_name: "eastus",
                    failover_priority: 0,
                }],
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["location"], "eastus");
        assert_eq!(json["kind"], "GlobalDocumentDB");
        assert_eq!(json["tags"]["team"], "data");
        assert_eq!(json["properties"]["databaseAccountOfferType"], "Standard");
        assert_eq!(json["properties"]["locations"][0]["locationName"], "eastus");
        assert_eq!(json["properties"]["locations"][0]["failoverPriority"], 0);
    }

    #[test]
    fn account_urls_are_scoped_to_the_subscription() {
        let client = ArmDocumentDbClient::new(
            "sub-1".to_string(),
            AadCredentials {
                tenant_id: "t".to_string(),
                client_id: "c".to_string(),
                client_secret: "s".to_string(),
            },
        );
        assert_eq!(
            client.account_url("rg1", "db1"),
            format!(
                "https://management.azure.com/subscriptions/sub-1/resourceGroups/rg1/providers/Microsoft.DocumentDB/databaseAccounts/db1?api-version={API_VERSION}"
            )
        );
        assert!(client.list_keys_url("rg1", "db1").contains("/listKeys?"));
        assert!(client
            .name_check_url("db1")
            .starts_with("https://management.azure.com/providers/Microsoft.DocumentDB/databaseAccountNames/db1"));
    }

    #[test]
    fn arm_account_payload_maps_into_database_account() {
        let body = r#"{
            "id": "/subscriptions/s/resourceGroups/rg1/providers/Microsoft.DocumentDB/databaseAccounts/db1",
            "name": "db1",
            "properties": {
                "provisioningState": "Succeeded",
                "documentEndpoint": "https://db1.documents.azure.com:443/"
            }
        }"#;
        let arm: ArmDatabaseAccount = serde_json::from_str(body).unwrap();
        let account: DatabaseAccount = arm.into();
        assert_eq!(account.provisioning_state, "Succeeded");
        assert!(account.id.ends_with("/db1"));
        assert!(account.document_endpoint.is_some());
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = AadCredentials {
            tenant_id: "t".to_string(),
            client_id: "c".to_string(),
            client_secret: "hunter2".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("hunter2"));
    }
}
