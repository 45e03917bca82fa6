// Resource provisioner contracts
//
// Provisioners are the external services each step calls: wallet deployment, token
// deployment, ledger registration and metadata storage. Every call is an irreversible
// side effect that may take wall-clock time (transaction confirmation). The engine only
// sees these traits; the server binds HTTP clients or simulated implementations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subject::TokenSpec;

/// Error returned by a provisioner call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionError {
    /// Error message, recorded on the failed step
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether retrying the workflow may succeed
    ///
    /// Non-retryable failures are not picked up again by the retry scanner.
    pub retryable: bool,
}

impl ProvisionError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

impl std::fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProvisionError {}

/// Result of a wallet deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletDeployment {
    pub address: String,
    pub operation_ref: String,
    pub unit_cost: u64,
}

/// Result of a token deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDeployment {
    pub address: String,
    pub operation_ref: String,
    pub unit_cost: u64,
}

/// Input of a ledger registration, assembled from the subject and earlier step outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRegistration {
    pub subject_id: Uuid,
    pub name: String,
    pub description: String,
    pub image_url: Option<String>,
    pub wallet_address: String,
    pub token_address: Option<String>,
    pub metadata_ref: String,
}

/// Result of a ledger registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub registration_id: String,
    pub operation_ref: String,
    pub unit_cost: u64,
    pub block_ref: Option<String>,
}

/// Deploys the custodial wallet owned by a subject owner.
#[async_trait]
pub trait WalletDeployer: Send + Sync {
    async fn deploy_wallet(&self, owner_id: Uuid) -> Result<WalletDeployment, ProvisionError>;
}

/// Deploys a fungible token owned by a wallet.
#[async_trait]
pub trait TokenDeployer: Send + Sync {
    async fn deploy_token(
        &self,
        spec: &TokenSpec,
        owner_address: &str,
    ) -> Result<TokenDeployment, ProvisionError>;
}

/// Registers a subject (and its resources) in the external ledger.
#[async_trait]
pub trait LedgerRegistrar: Send + Sync {
    async fn register_on_ledger(
        &self,
        registration: &LedgerRegistration,
    ) -> Result<LedgerReceipt, ProvisionError>;
}

/// Stores a metadata document and returns its content reference.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn upload_metadata(&self, document: &serde_json::Value)
        -> Result<String, ProvisionError>;
}

/// The set of provisioners a step executor calls.
#[derive(Clone)]
pub struct Provisioners {
    pub wallets: Arc<dyn WalletDeployer>,
    pub tokens: Arc<dyn TokenDeployer>,
    pub ledger: Arc<dyn LedgerRegistrar>,
    pub metadata: Arc<dyn MetadataStore>,
}

impl Provisioners {
    pub fn new(
        wallets: Arc<dyn WalletDeployer>,
        tokens: Arc<dyn TokenDeployer>,
        ledger: Arc<dyn LedgerRegistrar>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            wallets,
            tokens,
            ledger,
            metadata,
        }
    }

    /// Bundle a single value implementing every provisioner trait.
    pub fn from_single<P>(provisioner: Arc<P>) -> Self
    where
        P: WalletDeployer + TokenDeployer + LedgerRegistrar + MetadataStore + 'static,
    {
        Self {
            wallets: provisioner.clone(),
            tokens: provisioner.clone(),
            ledger: provisioner.clone(),
            metadata: provisioner,
        }
    }
}

impl std::fmt::Debug for Provisioners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioners").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_error_retryable() {
        let error = ProvisionError::retryable("rpc timeout");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "rpc timeout");
    }

    #[test]
    fn test_provision_error_with_type() {
        let error = ProvisionError::non_retryable("insufficient funds").with_type("FUNDS");

        assert!(!error.retryable);
        assert_eq!(error.error_type, Some("FUNDS".to_string()));
    }

    struct Fixed;

    #[async_trait]
    impl WalletDeployer for Fixed {
        async fn deploy_wallet(&self, _owner_id: Uuid) -> Result<WalletDeployment, ProvisionError> {
            Ok(WalletDeployment {
                address: "0xAA".to_string(),
                operation_ref: "0x01".to_string(),
                unit_cost: 150_000,
            })
        }
    }

    #[async_trait]
    impl TokenDeployer for Fixed {
        async fn deploy_token(
            &self,
            _spec: &TokenSpec,
            _owner_address: &str,
        ) -> Result<TokenDeployment, ProvisionError> {
            Err(ProvisionError::non_retryable("tokens disabled"))
        }
    }

    #[async_trait]
    impl LedgerRegistrar for Fixed {
        async fn register_on_ledger(
            &self,
            _registration: &LedgerRegistration,
        ) -> Result<LedgerReceipt, ProvisionError> {
            Err(ProvisionError::retryable("rpc timeout"))
        }
    }

    #[async_trait]
    impl MetadataStore for Fixed {
        async fn upload_metadata(
            &self,
            _document: &serde_json::Value,
        ) -> Result<String, ProvisionError> {
            Ok("ipfs://meta".to_string())
        }
    }

    #[tokio::test]
    async fn test_from_single_binds_every_role() {
        let provisioners = Provisioners::from_single(Arc::new(Fixed));

        let wallet = provisioners.wallets.deploy_wallet(Uuid::now_v7()).await.unwrap();
        assert_eq!(wallet.address, "0xAA");
        let content_ref = provisioners
            .metadata
            .upload_metadata(&serde_json::json!({"name": "Atlas"}))
            .await
            .unwrap();
        assert_eq!(content_ref, "ipfs://meta");
        assert!(provisioners
            .tokens
            .deploy_token(
                &TokenSpec {
                    name: "Atlas".to_string(),
                    symbol: "ATL".to_string(),
                    total_supply: 1,
                },
                "0xAA",
            )
            .await
            .is_err());
    }
}
