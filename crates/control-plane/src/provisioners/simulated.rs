// Simulated provisioners
// Decision: Addresses and references are derived from inputs with SHA-256, so the same
// subject always provisions to the same addresses across restarts

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use graduation_core::{
    LedgerReceipt, LedgerRegistrar, LedgerRegistration, MetadataStore, ProvisionError,
    TokenDeployer, TokenDeployment, TokenSpec, WalletDeployer, WalletDeployment,
};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

/// In-process stand-in for the wallet, token, ledger and metadata services
pub struct SimulatedProvisioner {
    wallet_cost: u64,
    token_cost: u64,
    ledger_cost: u64,
    latency: Duration,
    block_height: AtomicU64,
}

impl Default for SimulatedProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvisioner {
    pub fn new() -> Self {
        Self {
            wallet_cost: 150_000,
            token_cost: 250_000,
            ledger_cost: 300_000,
            latency: Duration::ZERO,
            block_height: AtomicU64::new(1),
        }
    }

    /// Sleep this long in every call, to mimic network round trips
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn next_block(&self) -> u64 {
        self.block_height.fetch_add(1, Ordering::Relaxed)
    }
}

fn digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// 20-byte address derived from the inputs
fn address(parts: &[&[u8]]) -> String {
    format!("0x{}", &digest(parts)[..40])
}

/// 32-byte operation hash derived from the inputs
fn operation_ref(parts: &[&[u8]]) -> String {
    format!("0x{}", digest(parts))
}

#[async_trait]
impl WalletDeployer for SimulatedProvisioner {
    async fn deploy_wallet(&self, owner_id: Uuid) -> Result<WalletDeployment, ProvisionError> {
        self.simulate_latency().await;
        let deployment = WalletDeployment {
            address: address(&[b"wallet", owner_id.as_bytes()]),
            operation_ref: operation_ref(&[b"wallet-op", owner_id.as_bytes()]),
            unit_cost: self.wallet_cost,
        };
        debug!(%owner_id, address = %deployment.address, "simulated wallet deployment");
        Ok(deployment)
    }
}

#[async_trait]
impl TokenDeployer for SimulatedProvisioner {
    async fn deploy_token(
        &self,
        spec: &TokenSpec,
        owner_address: &str,
    ) -> Result<TokenDeployment, ProvisionError> {
        self.simulate_latency().await;
        if spec.symbol.trim().is_empty() {
            return Err(ProvisionError::non_retryable("token symbol is empty")
                .with_type("invalid_token"));
        }
        let supply = spec.total_supply.to_be_bytes();
        let deployment = TokenDeployment {
            address: address(&[b"token", spec.symbol.as_bytes(), owner_address.as_bytes()]),
            operation_ref: operation_ref(&[
                b"token-op",
                spec.symbol.as_bytes(),
                owner_address.as_bytes(),
                &supply,
            ]),
            unit_cost: self.token_cost,
        };
        debug!(symbol = %spec.symbol, address = %deployment.address, "simulated token deployment");
        Ok(deployment)
    }
}

#[async_trait]
impl LedgerRegistrar for SimulatedProvisioner {
    async fn register_on_ledger(
        &self,
        registration: &LedgerRegistration,
    ) -> Result<LedgerReceipt, ProvisionError> {
        self.simulate_latency().await;
        let subject = registration.subject_id.as_bytes();
        let receipt = LedgerReceipt {
            registration_id: format!("reg-{}", &digest(&[b"ledger", subject])[..16]),
            operation_ref: operation_ref(&[
                b"ledger-op",
                subject,
                registration.wallet_address.as_bytes(),
            ]),
            unit_cost: self.ledger_cost,
            block_ref: Some(self.next_block().to_string()),
        };
        debug!(
            subject_id = %registration.subject_id,
            registration_id = %receipt.registration_id,
            "simulated ledger registration"
        );
        Ok(receipt)
    }
}

#[async_trait]
impl MetadataStore for SimulatedProvisioner {
    async fn upload_metadata(&self, document: &serde_json::Value) -> Result<String, ProvisionError> {
        self.simulate_latency().await;
        let bytes = serde_json::to_vec(document).map_err(|e| {
            ProvisionError::non_retryable(format!("metadata is not serializable: {e}"))
        })?;
        Ok(format!("sim://metadata/{}", digest(&[&bytes])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wallet_address_is_deterministic() {
        let provisioner = SimulatedProvisioner::new();
        let owner = Uuid::now_v7();

        let first = provisioner.deploy_wallet(owner).await.unwrap();
        let second = provisioner.deploy_wallet(owner).await.unwrap();
        let other = provisioner.deploy_wallet(Uuid::now_v7()).await.unwrap();

        assert_eq!(first.address, second.address);
        assert_ne!(first.address, other.address);
        assert_eq!(first.address.len(), 42);
        assert!(first.address.starts_with("0x"));
        assert_eq!(first.operation_ref.len(), 66);
        assert_eq!(first.unit_cost, 150_000);
    }

    #[tokio::test]
    async fn test_empty_symbol_is_rejected() {
        let provisioner = SimulatedProvisioner::new();
        let spec = TokenSpec {
            name: "Atlas".to_string(),
            symbol: " ".to_string(),
            total_supply: 1,
        };

        let err = provisioner.deploy_token(&spec, "0xAA").await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("invalid_token"));
    }

    #[tokio::test]
    async fn test_ledger_blocks_increase() {
        let provisioner = SimulatedProvisioner::new();
        let registration = LedgerRegistration {
            subject_id: Uuid::now_v7(),
            name: "Atlas".to_string(),
            description: String::new(),
            image_url: None,
            wallet_address: "0xAA".to_string(),
            token_address: None,
            metadata_ref: "sim://metadata/x".to_string(),
        };

        let first = provisioner.register_on_ledger(&registration).await.unwrap();
        let second = provisioner.register_on_ledger(&registration).await.unwrap();
        assert_eq!(first.registration_id, second.registration_id);
        assert_eq!(first.block_ref.as_deref(), Some("1"));
        assert_eq!(second.block_ref.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_metadata_ref_depends_on_content() {
        let provisioner = SimulatedProvisioner::new();
        let a = provisioner
            .upload_metadata(&serde_json::json!({"name": "Atlas"}))
            .await
            .unwrap();
        let b = provisioner
            .upload_metadata(&serde_json::json!({"name": "Borealis"}))
            .await
            .unwrap();

        assert!(a.starts_with("sim://metadata/"));
        assert_ne!(a, b);
    }
}
