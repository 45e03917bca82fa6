// Subject domain types
//
// The subject is the draft entity a workflow graduates. The orchestrator only reads its
// configuration and, at the end of a successful run, writes the produced resource
// references back and activates it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::workflow::ResourceRefs;

/// How a subject is launched.
/// - `standard`: wallet and ledger registration only
/// - `tokenized`: also deploys a fungible token owned by the wallet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    #[default]
    Standard,
    Tokenized,
}

impl LaunchMode {
    /// Whether graduation must deploy a fungible token.
    pub fn requires_token(&self) -> bool {
        matches!(self, LaunchMode::Tokenized)
    }
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchMode::Standard => write!(f, "standard"),
            LaunchMode::Tokenized => write!(f, "tokenized"),
        }
    }
}

impl From<&str> for LaunchMode {
    fn from(s: &str) -> Self {
        match s {
            "tokenized" => LaunchMode::Tokenized,
            _ => LaunchMode::Standard,
        }
    }
}

/// Parameters for the fungible token of a tokenized subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct TokenSpec {
    pub name: String,
    pub symbol: String,
    pub total_supply: u64,
}

/// Lifecycle of a subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum SubjectStatus {
    #[default]
    Draft,
    Active,
}

impl std::fmt::Display for SubjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectStatus::Draft => write!(f, "draft"),
            SubjectStatus::Active => write!(f, "active"),
        }
    }
}

impl From<&str> for SubjectStatus {
    fn from(s: &str) -> Self {
        match s {
            "active" => SubjectStatus::Active,
            _ => SubjectStatus::Draft,
        }
    }
}

/// The draft entity being graduated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Subject {
    pub id: Uuid,
    /// Owner of the subject; the custodial wallet is deployed for this id.
    pub owner_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub mode: LaunchMode,
    /// Required when `mode` is `tokenized`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenSpec>,
    #[serde(default)]
    pub status: SubjectStatus,
    /// References written by a successful graduation.
    #[serde(default, flatten)]
    pub resources: ResourceRefs,
    /// Completion marker of a successful graduation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graduated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subject {
    /// New draft subject in standard mode.
    pub fn draft(owner_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner_id,
            name: name.into(),
            description: String::new(),
            image_url: None,
            mode: LaunchMode::Standard,
            token: None,
            status: SubjectStatus::Draft,
            resources: ResourceRefs::default(),
            graduated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// Switch to tokenized mode with the given token parameters.
    pub fn tokenized(mut self, token: TokenSpec) -> Self {
        self.mode = LaunchMode::Tokenized;
        self.token = Some(token);
        self
    }

    /// Whether a previous graduation already completed for this subject.
    pub fn is_graduated(&self) -> bool {
        self.graduated_at.is_some()
    }
}
