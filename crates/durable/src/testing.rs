//! Test doubles for exercising the engine without external services
//!
//! - [`ScriptedProvisioners`]: one object bound to every provisioner role; records
//!   each call and returns queued failures or fixed results
//! - [`RecordingRunner`]: a runner that only records submissions
//! - [`wait_for_terminal`]: poll a store until a workflow is SUCCESS or FAILED

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use graduation_core::{
    LaunchMode, LedgerReceipt, LedgerRegistrar, LedgerRegistration, MetadataStore,
    ProvisionError, Provisioners, StepKind, Subject, TokenDeployer, TokenDeployment, TokenSpec,
    WalletDeployer, WalletDeployment, Workflow,
};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::persistence::WorkflowStore;
use crate::worker::{RunnerError, WorkflowRunner};

pub const WALLET_ADDRESS: &str = "0xAA00000000000000000000000000000000000001";
pub const TOKEN_ADDRESS: &str = "0xBB00000000000000000000000000000000000002";
pub const METADATA_REF: &str = "ipfs://graduation-metadata";

/// Provisioners with scripted results
///
/// Default unit costs: wallet 150000, token 250000, ledger 300000.
pub struct ScriptedProvisioners {
    wallet_cost: u64,
    token_cost: u64,
    ledger_cost: u64,
    delay: Duration,
    failures: Mutex<HashMap<StepKind, VecDeque<ProvisionError>>>,
    panics: Mutex<HashSet<StepKind>>,
    calls: Mutex<Vec<StepKind>>,
    registrations: Mutex<Vec<LedgerRegistration>>,
}

impl Default for ScriptedProvisioners {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvisioners {
    pub fn new() -> Self {
        Self {
            wallet_cost: 150_000,
            token_cost: 250_000,
            ledger_cost: 300_000,
            delay: Duration::ZERO,
            failures: Mutex::new(HashMap::new()),
            panics: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_costs(mut self, wallet: u64, token: u64, ledger: u64) -> Self {
        self.wallet_cost = wallet;
        self.token_cost = token;
        self.ledger_cost = ledger;
        self
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make the next call for `kind` fail with `error`
    pub fn fail_next(&self, kind: StepKind, error: ProvisionError) {
        self.failures.lock().entry(kind).or_default().push_back(error);
    }

    /// Make the next call for `kind` panic
    pub fn panic_next(&self, kind: StepKind) {
        self.panics.lock().insert(kind);
    }

    /// Every provisioner call so far, in order
    pub fn calls(&self) -> Vec<StepKind> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, kind: StepKind) -> usize {
        self.calls.lock().iter().filter(|k| **k == kind).count()
    }

    /// Registrations received by the ledger
    pub fn registrations(&self) -> Vec<LedgerRegistration> {
        self.registrations.lock().clone()
    }

    /// Bind this object to every provisioner role
    pub fn bind(self: &Arc<Self>) -> Provisioners {
        Provisioners::from_single(Arc::clone(self))
    }

    async fn invoke(&self, kind: StepKind) -> Result<(), ProvisionError> {
        self.calls.lock().push(kind);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics.lock().remove(&kind) {
            panic!("scripted panic in {kind}");
        }
        match self.failures.lock().get_mut(&kind).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WalletDeployer for ScriptedProvisioners {
    async fn deploy_wallet(&self, _owner_id: Uuid) -> Result<WalletDeployment, ProvisionError> {
        self.invoke(StepKind::DeployWallet).await?;
        Ok(WalletDeployment {
            address: WALLET_ADDRESS.to_string(),
            operation_ref: "op-wallet".to_string(),
            unit_cost: self.wallet_cost,
        })
    }
}

#[async_trait]
impl TokenDeployer for ScriptedProvisioners {
    async fn deploy_token(
        &self,
        _spec: &TokenSpec,
        _owner_address: &str,
    ) -> Result<TokenDeployment, ProvisionError> {
        self.invoke(StepKind::DeployToken).await?;
        Ok(TokenDeployment {
            address: TOKEN_ADDRESS.to_string(),
            operation_ref: "op-token".to_string(),
            unit_cost: self.token_cost,
        })
    }
}

#[async_trait]
impl LedgerRegistrar for ScriptedProvisioners {
    async fn register_on_ledger(
        &self,
        registration: &LedgerRegistration,
    ) -> Result<LedgerReceipt, ProvisionError> {
        self.invoke(StepKind::RegisterOnLedger).await?;
        self.registrations.lock().push(registration.clone());
        Ok(LedgerReceipt {
            registration_id: format!("reg-{}", registration.subject_id),
            operation_ref: "op-ledger".to_string(),
            unit_cost: self.ledger_cost,
            block_ref: Some("block-42".to_string()),
        })
    }
}

#[async_trait]
impl MetadataStore for ScriptedProvisioners {
    async fn upload_metadata(&self, _document: &serde_json::Value) -> Result<String, ProvisionError> {
        self.invoke(StepKind::CreateMetadata).await?;
        Ok(METADATA_REF.to_string())
    }
}

/// Runner that records submissions without executing anything
#[derive(Default)]
pub struct RecordingRunner {
    submitted: Mutex<Vec<Uuid>>,
    running: Mutex<HashSet<Uuid>>,
    refuse: Mutex<bool>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every submission with `QueueFull`
    pub fn refuse_submissions(&self, refuse: bool) {
        *self.refuse.lock() = refuse;
    }

    /// Report `workflow_id` as owned by this runner
    pub fn mark_running(&self, workflow_id: Uuid) {
        self.running.lock().insert(workflow_id);
    }

    pub fn submitted(&self) -> Vec<Uuid> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl WorkflowRunner for RecordingRunner {
    async fn submit(&self, workflow_id: Uuid) -> Result<(), RunnerError> {
        if *self.refuse.lock() {
            return Err(RunnerError::QueueFull);
        }
        self.submitted.lock().push(workflow_id);
        Ok(())
    }

    async fn is_running(&self, workflow_id: Uuid) -> bool {
        self.running.lock().contains(&workflow_id)
    }

    async fn active_count(&self) -> usize {
        self.running.lock().len()
    }

    async fn shutdown(&self) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// A draft subject for `mode`; tokenized subjects get a token spec
pub fn draft_subject(mode: LaunchMode) -> Subject {
    let subject = Subject::draft(Uuid::now_v7(), "Atlas").with_description("Atlas project");
    match mode {
        LaunchMode::Standard => subject,
        LaunchMode::Tokenized => subject.tokenized(TokenSpec {
            name: "Atlas".to_string(),
            symbol: "ATL".to_string(),
            total_supply: 1_000_000,
        }),
    }
}

/// Poll until the workflow is terminal; `None` on timeout or if it disappears
pub async fn wait_for_terminal(
    store: &dyn WorkflowStore,
    workflow_id: Uuid,
    timeout: Duration,
) -> Option<Workflow> {
    tokio::time::timeout(timeout, async {
        loop {
            match store.get_workflow(workflow_id).await {
                Ok(Some(workflow)) if workflow.status.is_terminal() => return Some(workflow),
                Ok(Some(_)) => {}
                _ => return None,
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .ok()
    .flatten()
}
