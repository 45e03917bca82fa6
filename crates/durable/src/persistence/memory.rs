//! In-memory implementation of WorkflowStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graduation_core::{ResourceRefs, Subject, SubjectStatus, Workflow, WorkflowStatus};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// Workflow rows plus the idempotency-key index, guarded by one lock so that
/// the key check and the insert are atomic.
#[derive(Default)]
struct WorkflowTable {
    rows: HashMap<Uuid, Workflow>,
    by_key: HashMap<String, Uuid>,
}

/// In-memory implementation of WorkflowStore
///
/// This is primarily for testing and single-process deployments. It stores all
/// data in memory and provides the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use graduation_durable::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryWorkflowStore {
    workflows: RwLock<WorkflowTable>,
    subjects: RwLock<HashMap<Uuid, Subject>>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(WorkflowTable::default()),
            subjects: RwLock::new(HashMap::new()),
        }
    }

    /// Create a store pre-populated with subjects
    pub fn with_subjects(subjects: impl IntoIterator<Item = Subject>) -> Self {
        let store = Self::new();
        {
            let mut map = store.subjects.write();
            for subject in subjects {
                map.insert(subject.id, subject);
            }
        }
        store
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().rows.len()
    }

    /// Overwrite a stored workflow without the version check (for tests that
    /// need to fake timestamps or crashed executors)
    pub fn force_put(&self, workflow: Workflow) {
        let mut table = self.workflows.write();
        table
            .by_key
            .insert(workflow.idempotency_key.clone(), workflow.id);
        table.rows.insert(workflow.id, workflow);
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut table = self.workflows.write();
        table.rows.clear();
        table.by_key.clear();
        self.subjects.write().clear();
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<InsertOutcome, StoreError> {
        let mut table = self.workflows.write();

        if let Some(existing_id) = table.by_key.get(&workflow.idempotency_key) {
            let existing = table
                .rows
                .get(existing_id)
                .cloned()
                .ok_or(StoreError::WorkflowNotFound(*existing_id))?;
            return Ok(InsertOutcome::Existing(existing));
        }
        if table.rows.contains_key(&workflow.id) {
            return Err(StoreError::DuplicateKey(workflow.id.to_string()));
        }

        table
            .by_key
            .insert(workflow.idempotency_key.clone(), workflow.id);
        table.rows.insert(workflow.id, workflow.clone());
        Ok(InsertOutcome::Inserted(workflow.clone()))
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self.workflows.read().rows.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Workflow>, StoreError> {
        let table = self.workflows.read();
        Ok(table
            .by_key
            .get(key)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError> {
        let mut table = self.workflows.write();
        let stored = table
            .rows
            .get_mut(&workflow.id)
            .ok_or(StoreError::WorkflowNotFound(workflow.id))?;

        if stored.version != workflow.version {
            return Err(StoreError::VersionConflict {
                id: workflow.id,
                expected: workflow.version,
            });
        }

        let mut next = workflow.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    async fn list_for_subject(&self, subject_id: Uuid) -> Result<Vec<Workflow>, StoreError> {
        let table = self.workflows.read();
        let mut workflows: Vec<Workflow> = table
            .rows
            .values()
            .filter(|w| w.subject_id == subject_id)
            .cloned()
            .collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(workflows)
    }

    async fn list_by_status(
        &self,
        status: WorkflowStatus,
        filter: ScanFilter,
    ) -> Result<Vec<Workflow>, StoreError> {
        let table = self.workflows.read();
        let mut workflows: Vec<Workflow> = table
            .rows
            .values()
            .filter(|w| w.status == status && filter.matches(w))
            .cloned()
            .collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        workflows.truncate(filter.limit);
        Ok(workflows)
    }

    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut table = self.workflows.write();
        let expired: Vec<(Uuid, String)> = table
            .rows
            .values()
            .filter(|w| w.created_at < cutoff)
            .map(|w| (w.id, w.idempotency_key.clone()))
            .collect();

        for (id, key) in &expired {
            table.rows.remove(id);
            table.by_key.remove(key);
        }
        Ok(expired.len() as u64)
    }

    async fn get_subject(&self, id: Uuid) -> Result<Option<Subject>, StoreError> {
        Ok(self.subjects.read().get(&id).cloned())
    }

    async fn save_subject(&self, subject: &Subject) -> Result<(), StoreError> {
        self.subjects.write().insert(subject.id, subject.clone());
        Ok(())
    }

    async fn configure_subject(
        &self,
        id: Uuid,
        refs: &ResourceRefs,
    ) -> Result<Subject, StoreError> {
        let mut subjects = self.subjects.write();
        let subject = subjects
            .get_mut(&id)
            .ok_or(StoreError::SubjectNotFound(id))?;
        subject.resources.merge(refs);
        subject.updated_at = Utc::now();
        Ok(subject.clone())
    }

    async fn activate_subject(
        &self,
        id: Uuid,
        graduated_at: DateTime<Utc>,
    ) -> Result<Subject, StoreError> {
        let mut subjects = self.subjects.write();
        let subject = subjects
            .get_mut(&id)
            .ok_or(StoreError::SubjectNotFound(id))?;
        subject.status = SubjectStatus::Active;
        subject.graduated_at.get_or_insert(graduated_at);
        subject.updated_at = Utc::now();
        Ok(subject.clone())
    }
}
