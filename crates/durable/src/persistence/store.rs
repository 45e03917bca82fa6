//! WorkflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graduation_core::{ResourceRefs, Subject, Workflow, WorkflowStatus};
use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Subject not found
    #[error("subject not found: {0}")]
    SubjectNotFound(Uuid),

    /// Optimistic concurrency check failed: the row changed since it was read
    #[error("version conflict on workflow {id}: expected version {expected}")]
    VersionConflict { id: Uuid, expected: i64 },

    /// A row with the same primary key already exists
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the error means another writer got there first.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result of inserting a workflow through the idempotency gate
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// This call created the row
    Inserted(Workflow),

    /// A row already existed for the idempotency key; it is returned unchanged
    Existing(Workflow),
}

impl InsertOutcome {
    pub fn created(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }

    pub fn into_workflow(self) -> Workflow {
        match self {
            InsertOutcome::Inserted(w) | InsertOutcome::Existing(w) => w,
        }
    }
}

/// Filter for scanning workflows in a given status
///
/// Results are ordered oldest first.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    /// Only rows created at or after this time
    pub created_after: Option<DateTime<Utc>>,

    /// Only rows created before this time
    pub created_before: Option<DateTime<Utc>>,

    /// Only rows last written before this time
    pub updated_before: Option<DateTime<Utc>>,

    /// Maximum number of rows returned
    pub limit: usize,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            created_after: None,
            created_before: None,
            updated_before: None,
            limit: 100,
        }
    }
}

impl ScanFilter {
    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Whether a workflow passes the time bounds (the limit is applied by the caller).
    pub fn matches(&self, workflow: &Workflow) -> bool {
        self.created_after.map_or(true, |at| workflow.created_at >= at)
            && self.created_before.map_or(true, |at| workflow.created_at < at)
            && self.updated_before.map_or(true, |at| workflow.updated_at < at)
    }
}

/// Durable store for graduation workflows and the subjects they finalize
///
/// Implementations must be thread-safe and support concurrent access. Every
/// workflow write is a compare-and-swap on `Workflow::version`.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Insert a new workflow unless one already exists for its idempotency key
    ///
    /// Exactly one of any number of concurrent callers with the same key gets
    /// `Inserted`; every other caller gets `Existing` with the winner's row.
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<InsertOutcome, StoreError>;

    /// Get a workflow by id
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError>;

    /// Get a workflow by idempotency key
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Workflow>, StoreError>;

    /// Write a workflow if its stored version still equals `workflow.version`
    ///
    /// Returns the stored copy with the version incremented and `updated_at` set.
    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError>;

    /// All workflows for a subject, newest first
    async fn list_for_subject(&self, subject_id: Uuid) -> Result<Vec<Workflow>, StoreError>;

    /// Workflows in `status` matching the filter, oldest first
    async fn list_by_status(
        &self,
        status: WorkflowStatus,
        filter: ScanFilter,
    ) -> Result<Vec<Workflow>, StoreError>;

    /// Delete every workflow created before `cutoff`, regardless of status
    ///
    /// Returns the number of deleted rows.
    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Subject Operations
    // =========================================================================

    /// Get a subject by id
    async fn get_subject(&self, id: Uuid) -> Result<Option<Subject>, StoreError>;

    /// Insert or replace a subject
    async fn save_subject(&self, subject: &Subject) -> Result<(), StoreError>;

    /// Copy produced resource references onto a subject
    ///
    /// Only fields set in `refs` are written; existing references are never cleared.
    async fn configure_subject(&self, id: Uuid, refs: &ResourceRefs)
        -> Result<Subject, StoreError>;

    /// Mark a subject active and stamp its completion marker
    ///
    /// Activating an already active subject keeps the original marker.
    async fn activate_subject(
        &self,
        id: Uuid,
        graduated_at: DateTime<Utc>,
    ) -> Result<Subject, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use graduation_core::{Step, StepKind};

    #[test]
    fn test_scan_filter_bounds() {
        let wf = Workflow::new(
            "k",
            Uuid::now_v7(),
            Uuid::now_v7(),
            vec![Step::new(StepKind::DeployWallet)],
        );
        let now = wf.created_at;

        assert!(ScanFilter::default().matches(&wf));
        assert!(ScanFilter::default()
            .created_after(now - Duration::hours(1))
            .matches(&wf));
        assert!(!ScanFilter::default()
            .created_before(now - Duration::hours(1))
            .matches(&wf));
        assert!(ScanFilter::default()
            .updated_before(now + Duration::seconds(1))
            .matches(&wf));
    }
}
