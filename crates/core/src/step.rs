// Step domain types
//
// A step is one ordered, named operation inside a graduation workflow.
// Each kind calls exactly one provisioner or performs one subject mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::error::TransitionError;

/// The operations a graduation workflow can contain.
///
/// Serialized as the kebab-case step name (`deploy-wallet`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// Upload the subject's metadata document and obtain a content reference.
    CreateMetadata,
    /// Deploy the custodial wallet owned by the subject's owner.
    DeployWallet,
    /// Deploy the subject's fungible token (tokenized subjects only).
    DeployToken,
    /// Register the subject in the external ledger.
    RegisterOnLedger,
    /// Write the produced resource references onto the subject.
    ConfigureSubject,
    /// Mark the subject active.
    ActivateSubject,
}

impl StepKind {
    /// Stable step name used in the API and in persisted rows.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::CreateMetadata => "create-metadata",
            StepKind::DeployWallet => "deploy-wallet",
            StepKind::DeployToken => "deploy-token",
            StepKind::RegisterOnLedger => "register-on-ledger",
            StepKind::ConfigureSubject => "configure-subject",
            StepKind::ActivateSubject => "activate-subject",
        }
    }

    /// Human readable description shown to polling clients.
    pub fn description(&self) -> &'static str {
        match self {
            StepKind::CreateMetadata => "Upload subject metadata",
            StepKind::DeployWallet => "Deploy custodial wallet",
            StepKind::DeployToken => "Deploy fungible token",
            StepKind::RegisterOnLedger => "Register subject on ledger",
            StepKind::ConfigureSubject => "Attach provisioned resources to subject",
            StepKind::ActivateSubject => "Activate subject",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create-metadata" => Ok(StepKind::CreateMetadata),
            "deploy-wallet" => Ok(StepKind::DeployWallet),
            "deploy-token" => Ok(StepKind::DeployToken),
            "register-on-ledger" => Ok(StepKind::RegisterOnLedger),
            "configure-subject" => Ok(StepKind::ConfigureSubject),
            "activate-subject" => Ok(StepKind::ActivateSubject),
            other => Err(format!("unknown step kind: {other}")),
        }
    }
}

/// Step execution status.
/// - `pending`: not started yet
/// - `processing`: provisioner call in flight
/// - `success`: provisioner call returned a result
/// - `failed`: provisioner call failed; the workflow halted here
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl StepStatus {
    /// Whether `self -> next` is a legal edge.
    ///
    /// `failed -> processing` is the retry edge; `success` never changes.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Processing)
                | (StepStatus::Processing, StepStatus::Success)
                | (StepStatus::Processing, StepStatus::Failed)
                | (StepStatus::Failed, StepStatus::Processing)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Processing => write!(f, "processing"),
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-kind result payload of a successful step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutput {
    Metadata {
        content_ref: String,
    },
    Wallet {
        address: String,
    },
    Token {
        address: String,
    },
    Ledger {
        registration_id: String,
        block_ref: Option<String>,
    },
    SubjectConfigured,
    SubjectActivated,
}

/// What a step produced, handed back by the executor on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCompletion {
    pub operation_ref: Option<String>,
    pub unit_cost: Option<u64>,
    pub output: StepOutput,
}

/// One ordered operation of a workflow, with its audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Step {
    /// Step name, e.g. `deploy-wallet`.
    #[serde(rename = "name")]
    pub kind: StepKind,
    /// Human readable description.
    pub description: String,
    /// Current status of the step.
    pub status: StepStatus,
    /// External operation (transaction) identifier returned by the provisioner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_ref: Option<String>,
    /// Unit cost reported by the provisioner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_cost: Option<u64>,
    /// Failure message when the step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Resource produced by the step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
    /// Number of times the step has been started.
    #[serde(default)]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            description: kind.description().to_string(),
            status: StepStatus::Pending,
            operation_ref: None,
            unit_cost: None,
            error: None,
            output: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `processing`. Clears the error left by a previous failed attempt.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(StepStatus::Processing)?;
        self.attempts += 1;
        self.error = None;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        Ok(())
    }

    /// Move to `success`, recording what the provisioner returned.
    pub fn succeed(&mut self, completion: StepCompletion) -> Result<(), TransitionError> {
        self.transition(StepStatus::Success)?;
        self.operation_ref = completion.operation_ref;
        self.unit_cost = completion.unit_cost;
        self.output = Some(completion.output);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Move to `failed` with the captured error message.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(StepStatus::Failed)?;
        self.error = Some(message.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, to: StepStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Step {
                step: self.kind,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet_completion() -> StepCompletion {
        StepCompletion {
            operation_ref: Some("0xtx".to_string()),
            unit_cost: Some(150_000),
            output: StepOutput::Wallet {
                address: "0xAA".to_string(),
            },
        }
    }

    #[test]
    fn test_step_kind_names_round_trip_through_from_str() {
        for kind in [
            StepKind::CreateMetadata,
            StepKind::DeployWallet,
            StepKind::DeployToken,
            StepKind::RegisterOnLedger,
            StepKind::ConfigureSubject,
            StepKind::ActivateSubject,
        ] {
            assert_eq!(kind.name().parse::<StepKind>().unwrap(), kind);
        }
        assert!("deploy-nft".parse::<StepKind>().is_err());
    }

    #[test]
    fn test_step_serializes_kind_as_name() {
        let step = Step::new(StepKind::RegisterOnLedger);
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["name"], "register-on-ledger");
        assert_eq!(json["status"], "pending");
        assert!(json.get("unit_cost").is_none());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut step = Step::new(StepKind::DeployWallet);
        step.start().unwrap();
        assert_eq!(step.status, StepStatus::Processing);
        assert_eq!(step.attempts, 1);

        step.succeed(wallet_completion()).unwrap();
        assert_eq!(step.status, StepStatus::Success);
        assert_eq!(step.unit_cost, Some(150_000));
        assert_eq!(step.operation_ref.as_deref(), Some("0xtx"));
    }

    #[test]
    fn test_success_is_final() {
        let mut step = Step::new(StepKind::DeployWallet);
        step.start().unwrap();
        step.succeed(wallet_completion()).unwrap();

        assert!(step.start().is_err());
        assert!(step.fail("late").is_err());
        assert_eq!(step.status, StepStatus::Success);
    }

    #[test]
    fn test_pending_cannot_skip_processing() {
        let mut step = Step::new(StepKind::CreateMetadata);
        let err = step.fail("boom").unwrap_err();
        assert_eq!(
            err,
            TransitionError::Step {
                step: StepKind::CreateMetadata,
                from: StepStatus::Pending,
                to: StepStatus::Failed,
            }
        );
    }

    #[test]
    fn test_failed_step_can_be_restarted() {
        let mut step = Step::new(StepKind::RegisterOnLedger);
        step.start().unwrap();
        step.fail("rpc timeout").unwrap();
        assert_eq!(step.error.as_deref(), Some("rpc timeout"));

        step.start().unwrap();
        assert_eq!(step.status, StepStatus::Processing);
        assert_eq!(step.attempts, 2);
        assert!(step.error.is_none());
    }
}
