//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - A unique index on `idempotency_key` as the initiation race arbiter
//! - Optimistic concurrency control via a `version` column
//! - Steps embedded as a JSONB array on the workflow row

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graduation_core::{
    LaunchMode, ResourceRefs, Step, Subject, SubjectStatus, TokenSpec, Workflow, WorkflowStatus,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;

const WORKFLOW_COLUMNS: &str = r#"
    id, idempotency_key, subject_id, requester_id, status, steps, current_step,
    aggregated_cost, wallet_address, token_address, registration_id, block_ref,
    error, attempts, next_retry_at, version, created_at, updated_at, started_at, completed_at
"#;

const SUBJECT_COLUMNS: &str = r#"
    id, owner_id, name, description, image_url, mode, token, status,
    wallet_address, token_address, registration_id, block_ref,
    graduated_at, created_at, updated_at
"#;

/// PostgreSQL implementation of WorkflowStore
///
/// # Example
///
/// ```ignore
/// use graduation_durable::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/graduation").await?;
/// let store = PostgresWorkflowStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id, key = %workflow.idempotency_key))]
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<InsertOutcome, StoreError> {
        let steps = serde_json::to_value(&workflow.steps)?;
        let aggregated_cost = cost_column(workflow)?;

        // The unique constraint on idempotency_key decides the race: the loser's
        // insert is a no-op and it reads the winner's row below.
        let inserted = sqlx::query(
            r#"
            INSERT INTO graduation_workflows (
                id, idempotency_key, subject_id, requester_id, status, steps, current_step,
                aggregated_cost, wallet_address, token_address, registration_id, block_ref,
                error, attempts, next_retry_at, version, created_at, updated_at,
                started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.idempotency_key)
        .bind(workflow.subject_id)
        .bind(workflow.requester_id)
        .bind(workflow.status.to_string())
        .bind(&steps)
        .bind(workflow.current_step as i32)
        .bind(aggregated_cost)
        .bind(&workflow.resources.wallet_address)
        .bind(&workflow.resources.token_address)
        .bind(&workflow.resources.registration_id)
        .bind(&workflow.resources.block_ref)
        .bind(&workflow.error)
        .bind(workflow.attempts as i32)
        .bind(workflow.next_retry_at)
        .bind(workflow.version)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .bind(workflow.started_at)
        .bind(workflow.completed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateKey(workflow.id.to_string())
            }
            _ => {
                error!("Failed to insert workflow: {}", e);
                StoreError::Database(e.to_string())
            }
        })?;

        if inserted.is_some() {
            debug!("inserted workflow");
            return Ok(InsertOutcome::Inserted(workflow.clone()));
        }

        let existing = self
            .find_by_idempotency_key(&workflow.idempotency_key)
            .await?
            .ok_or_else(|| {
                StoreError::Database(format!(
                    "idempotency key {} conflicted but no row was found",
                    workflow.idempotency_key
                ))
            })?;
        debug!(existing_id = %existing.id, "idempotency key already used");
        Ok(InsertOutcome::Existing(existing))
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM graduation_workflows WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get workflow: {}", e);
                StoreError::Database(e.to_string())
            })?;

        row.as_ref().map(workflow_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Workflow>, StoreError> {
        let sql = format!(
            "SELECT {WORKFLOW_COLUMNS} FROM graduation_workflows WHERE idempotency_key = $1"
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to find workflow by idempotency key: {}", e);
                StoreError::Database(e.to_string())
            })?;

        row.as_ref().map(workflow_from_row).transpose()
    }

    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id, version = workflow.version))]
    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError> {
        let steps = serde_json::to_value(&workflow.steps)?;
        let aggregated_cost = cost_column(workflow)?;

        let row = sqlx::query(
            r#"
            UPDATE graduation_workflows
            SET status = $3,
                steps = $4,
                current_step = $5,
                aggregated_cost = $6,
                wallet_address = $7,
                token_address = $8,
                registration_id = $9,
                block_ref = $10,
                error = $11,
                attempts = $12,
                next_retry_at = $13,
                started_at = $14,
                completed_at = $15,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING version, updated_at
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.version)
        .bind(workflow.status.to_string())
        .bind(&steps)
        .bind(workflow.current_step as i32)
        .bind(aggregated_cost)
        .bind(&workflow.resources.wallet_address)
        .bind(&workflow.resources.token_address)
        .bind(&workflow.resources.registration_id)
        .bind(&workflow.resources.block_ref)
        .bind(&workflow.error)
        .bind(workflow.attempts as i32)
        .bind(workflow.next_retry_at)
        .bind(workflow.started_at)
        .bind(workflow.completed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let Some(row) = row else {
            // Either the row is gone or another writer bumped the version.
            let exists = sqlx::query("SELECT 1 FROM graduation_workflows WHERE id = $1")
                .bind(workflow.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?
                .is_some();
            return Err(if exists {
                StoreError::VersionConflict {
                    id: workflow.id,
                    expected: workflow.version,
                }
            } else {
                StoreError::WorkflowNotFound(workflow.id)
            });
        };

        let mut stored = workflow.clone();
        stored.version = row.get("version");
        stored.updated_at = row.get("updated_at");
        debug!(new_version = stored.version, status = %stored.status, "updated workflow");
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn list_for_subject(&self, subject_id: Uuid) -> Result<Vec<Workflow>, StoreError> {
        let sql = format!(
            r#"
            SELECT {WORKFLOW_COLUMNS}
            FROM graduation_workflows
            WHERE subject_id = $1
            ORDER BY created_at DESC, id DESC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(subject_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list workflows for subject: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(workflow_from_row).collect()
    }

    #[instrument(skip(self, filter))]
    async fn list_by_status(
        &self,
        status: WorkflowStatus,
        filter: ScanFilter,
    ) -> Result<Vec<Workflow>, StoreError> {
        let sql = format!(
            r#"
            SELECT {WORKFLOW_COLUMNS}
            FROM graduation_workflows
            WHERE status = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND ($3::timestamptz IS NULL OR created_at < $3)
              AND ($4::timestamptz IS NULL OR updated_at < $4)
            ORDER BY created_at ASC, id ASC
            LIMIT $5
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(status.to_string())
            .bind(filter.created_after)
            .bind(filter.created_before)
            .bind(filter.updated_before)
            .bind(filter.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list workflows by status: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(workflow_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM graduation_workflows WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to purge workflows: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn get_subject(&self, id: Uuid) -> Result<Option<Subject>, StoreError> {
        let sql = format!("SELECT {SUBJECT_COLUMNS} FROM graduation_subjects WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get subject: {}", e);
                StoreError::Database(e.to_string())
            })?;

        row.as_ref().map(subject_from_row).transpose()
    }

    #[instrument(skip(self, subject), fields(subject_id = %subject.id))]
    async fn save_subject(&self, subject: &Subject) -> Result<(), StoreError> {
        let token = subject
            .token
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO graduation_subjects (
                id, owner_id, name, description, image_url, mode, token, status,
                wallet_address, token_address, registration_id, block_ref,
                graduated_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                owner_id = EXCLUDED.owner_id,
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                image_url = EXCLUDED.image_url,
                mode = EXCLUDED.mode,
                token = EXCLUDED.token,
                status = EXCLUDED.status,
                wallet_address = EXCLUDED.wallet_address,
                token_address = EXCLUDED.token_address,
                registration_id = EXCLUDED.registration_id,
                block_ref = EXCLUDED.block_ref,
                graduated_at = EXCLUDED.graduated_at,
                updated_at = NOW()
            "#,
        )
        .bind(subject.id)
        .bind(subject.owner_id)
        .bind(&subject.name)
        .bind(&subject.description)
        .bind(&subject.image_url)
        .bind(subject.mode.to_string())
        .bind(&token)
        .bind(subject.status.to_string())
        .bind(&subject.resources.wallet_address)
        .bind(&subject.resources.token_address)
        .bind(&subject.resources.registration_id)
        .bind(&subject.resources.block_ref)
        .bind(subject.graduated_at)
        .bind(subject.created_at)
        .bind(subject.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save subject: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self, refs))]
    async fn configure_subject(
        &self,
        id: Uuid,
        refs: &ResourceRefs,
    ) -> Result<Subject, StoreError> {
        let sql = format!(
            r#"
            UPDATE graduation_subjects
            SET wallet_address = COALESCE($2, wallet_address),
                token_address = COALESCE($3, token_address),
                registration_id = COALESCE($4, registration_id),
                block_ref = COALESCE($5, block_ref),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {SUBJECT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&refs.wallet_address)
            .bind(&refs.token_address)
            .bind(&refs.registration_id)
            .bind(&refs.block_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to configure subject: {}", e);
                StoreError::Database(e.to_string())
            })?
            .ok_or(StoreError::SubjectNotFound(id))?;

        subject_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn activate_subject(
        &self,
        id: Uuid,
        graduated_at: DateTime<Utc>,
    ) -> Result<Subject, StoreError> {
        let sql = format!(
            r#"
            UPDATE graduation_subjects
            SET status = 'active',
                graduated_at = COALESCE(graduated_at, $2),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {SUBJECT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(graduated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to activate subject: {}", e);
                StoreError::Database(e.to_string())
            })?
            .ok_or(StoreError::SubjectNotFound(id))?;

        subject_from_row(&row)
    }
}

/// `aggregated_cost` as the BIGINT column value
fn cost_column(workflow: &Workflow) -> Result<Option<i64>, StoreError> {
    workflow
        .aggregated_cost
        .map(i64::try_from)
        .transpose()
        .map_err(|e| StoreError::Serialization(format!("aggregated_cost: {e}")))
}

fn workflow_from_row(row: &PgRow) -> Result<Workflow, StoreError> {
    let status: String = row.get("status");
    let steps: serde_json::Value = row.get("steps");
    let steps: Vec<Step> = serde_json::from_value(steps)?;

    Ok(Workflow {
        id: row.get("id"),
        idempotency_key: row.get("idempotency_key"),
        subject_id: row.get("subject_id"),
        requester_id: row.get("requester_id"),
        status: parse_workflow_status(&status)?,
        steps,
        current_step: row.get::<i32, _>("current_step") as usize,
        aggregated_cost: row
            .get::<Option<i64>, _>("aggregated_cost")
            .map(u64::try_from)
            .transpose()
            .map_err(|e| StoreError::Serialization(format!("aggregated_cost: {e}")))?,
        resources: ResourceRefs {
            wallet_address: row.get("wallet_address"),
            token_address: row.get("token_address"),
            registration_id: row.get("registration_id"),
            block_ref: row.get("block_ref"),
        },
        error: row.get("error"),
        attempts: row.get::<i32, _>("attempts") as u32,
        next_retry_at: row.get("next_retry_at"),
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn subject_from_row(row: &PgRow) -> Result<Subject, StoreError> {
    let mode: String = row.get("mode");
    let status: String = row.get("status");
    let token: Option<serde_json::Value> = row.get("token");
    let token: Option<TokenSpec> = token.map(serde_json::from_value).transpose()?;

    Ok(Subject {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        description: row.get("description"),
        image_url: row.get("image_url"),
        mode: LaunchMode::from(mode.as_str()),
        token,
        status: SubjectStatus::from(status.as_str()),
        resources: ResourceRefs {
            wallet_address: row.get("wallet_address"),
            token_address: row.get("token_address"),
            registration_id: row.get("registration_id"),
            block_ref: row.get("block_ref"),
        },
        graduated_at: row.get("graduated_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_workflow_status(status: &str) -> Result<WorkflowStatus, StoreError> {
    status.parse().map_err(StoreError::Database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use graduation_core::StepKind;

    #[test]
    fn test_cost_column_rejects_unstorable_cost() {
        let mut workflow = Workflow::new(
            "k",
            Uuid::now_v7(),
            Uuid::now_v7(),
            vec![Step::new(StepKind::DeployWallet)],
        );
        assert_eq!(cost_column(&workflow).unwrap(), None);

        workflow.aggregated_cost = Some(700_000);
        assert_eq!(cost_column(&workflow).unwrap(), Some(700_000));

        workflow.aggregated_cost = Some(u64::MAX);
        assert!(matches!(
            cost_column(&workflow),
            Err(StoreError::Serialization(_))
        ));
    }
}
