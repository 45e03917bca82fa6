// HTTP provisioner client
// Decision: One JSON-over-HTTP provisioning service implements all four operations
// Decision: Transport errors, 429 and 5xx are retryable; other 4xx and bad bodies are not

use anyhow::{Context, Result};
use async_trait::async_trait;
use graduation_core::{
    LedgerReceipt, LedgerRegistrar, LedgerRegistration, MetadataStore, ProvisionError,
    TokenDeployer, TokenDeployment, TokenSpec, WalletDeployer, WalletDeployment,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProvisionerConfig;

#[derive(Deserialize)]
struct MetadataUpload {
    content_ref: String,
}

/// Client for the external provisioning service
pub struct HttpProvisioner {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpProvisioner {
    pub fn new(config: &ProvisionerConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .context("PROVISIONER_BASE_URL is required for HTTP provisioners")?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http,
        })
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProvisionError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.post(&url).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            warn!(%url, error = %e, "provisioner request failed");
            ProvisionError::retryable(format!("request to {path} failed: {e}"))
                .with_type("transport")
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(status_error(status, path, &message));
        }

        debug!(%url, status = status.as_u16(), "provisioner call succeeded");
        response.json::<T>().await.map_err(|e| {
            ProvisionError::non_retryable(format!("invalid response from {path}: {e}"))
                .with_type("decode")
        })
    }
}

/// Map a non-success status to a provisioning failure
fn status_error(status: StatusCode, path: &str, body: &str) -> ProvisionError {
    let message = if body.is_empty() {
        format!("{path} returned {status}")
    } else {
        format!("{path} returned {status}: {body}")
    };

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProvisionError::retryable(message).with_type("upstream")
    } else {
        ProvisionError::non_retryable(message).with_type("rejected")
    }
}

#[async_trait]
impl WalletDeployer for HttpProvisioner {
    async fn deploy_wallet(&self, owner_id: Uuid) -> Result<WalletDeployment, ProvisionError> {
        self.post("/v1/wallets", &json!({ "owner_id": owner_id })).await
    }
}

#[async_trait]
impl TokenDeployer for HttpProvisioner {
    async fn deploy_token(
        &self,
        spec: &TokenSpec,
        owner_address: &str,
    ) -> Result<TokenDeployment, ProvisionError> {
        let body = json!({
            "name": spec.name,
            "symbol": spec.symbol,
            "total_supply": spec.total_supply,
            "owner_address": owner_address,
        });
        self.post("/v1/tokens", &body).await
    }
}

#[async_trait]
impl LedgerRegistrar for HttpProvisioner {
    async fn register_on_ledger(
        &self,
        registration: &LedgerRegistration,
    ) -> Result<LedgerReceipt, ProvisionError> {
        self.post("/v1/ledger/registrations", registration).await
    }
}

#[async_trait]
impl MetadataStore for HttpProvisioner {
    async fn upload_metadata(&self, document: &serde_json::Value) -> Result<String, ProvisionError> {
        let upload: MetadataUpload = self.post("/v1/metadata", document).await?;
        Ok(upload.content_ref)
    }
}
