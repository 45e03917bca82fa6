// Subject seeding
// Decision: Subjects are owned upstream; the server only loads drafts from a JSON file at startup
// Decision: Existing subjects are left untouched so a restart never reverts a graduation

use std::path::Path;

use anyhow::{Context, Result};
use graduation_core::{LaunchMode, Subject, TokenSpec};
use graduation_durable::WorkflowStore;
use serde::Deserialize;
use uuid::Uuid;

/// One subject entry in the seed file
#[derive(Debug, Clone, Deserialize)]
pub struct SubjectSeed {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub mode: LaunchMode,
    #[serde(default)]
    pub token: Option<TokenSpec>,
}

impl From<SubjectSeed> for Subject {
    fn from(seed: SubjectSeed) -> Self {
        let mut subject =
            Subject::draft(seed.owner_id, seed.name).with_description(seed.description);
        subject.id = seed.id;
        subject.image_url = seed.image_url;
        subject.mode = seed.mode;
        subject.token = seed.token;
        subject
    }
}

/// Parse a JSON array of subjects
pub fn parse_subjects(json: &str) -> Result<Vec<SubjectSeed>> {
    serde_json::from_str(json).context("Invalid subjects file")
}

/// Load draft subjects from a file; returns how many were added
pub async fn load_subjects(store: &dyn WorkflowStore, path: &Path) -> Result<usize> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read subjects file {}", path.display()))?;

    let mut added = 0;
    for seed in parse_subjects(&json)? {
        if store.get_subject(seed.id).await?.is_some() {
            tracing::debug!(subject_id = %seed.id, "subject exists, skipping");
            continue;
        }
        store.save_subject(&Subject::from(seed)).await?;
        added += 1;
    }

    tracing::info!(added, path = %path.display(), "subjects loaded");
    Ok(added)
}
