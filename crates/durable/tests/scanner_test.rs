//! Retry scanner and background runner tests
//!
//! Run with: cargo test -p graduation-durable --test scanner_test

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use graduation_core::{
    LaunchMode, ProvisionError, ResourceRefs, StepKind, StepStatus, Subject, SubjectStatus,
    Workflow, WorkflowStatus,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use graduation_durable::build_steps;
use graduation_durable::engine::{Orchestrator, RunOutcome, StepExecutor};
use graduation_durable::persistence::{
    InMemoryWorkflowStore, InsertOutcome, ScanFilter, StoreError, WorkflowStore,
};
use graduation_durable::reliability::RetryPolicy;
use graduation_durable::testing::{
    draft_subject, wait_for_terminal, RecordingRunner, ScriptedProvisioners,
};
use graduation_durable::worker::{
    BackgroundRunner, RetryScanner, RunnerConfig, RunnerError, ScanReport, ScannerConfig,
    WorkflowRunner,
};

fn immediate_retries() -> RetryPolicy {
    RetryPolicy::fixed(Duration::ZERO, 3)
}

fn scanner_config() -> ScannerConfig {
    ScannerConfig::default()
        .with_stale_threshold(Duration::from_secs(60))
        .with_pending_grace(Duration::from_secs(60))
        .with_retry_policy(immediate_retries())
}

fn scanner(
    store: &Arc<InMemoryWorkflowStore>,
    runner: &Arc<RecordingRunner>,
    config: ScannerConfig,
) -> RetryScanner {
    RetryScanner::new(store.clone(), runner.clone(), config)
}

fn workflow_for(subject: &Subject, key: &str) -> Workflow {
    Workflow::new(key, subject.id, Uuid::now_v7(), build_steps(subject.mode))
}

/// A workflow whose executor died while running its first step
fn abandoned_workflow(subject: &Subject) -> Workflow {
    let mut workflow = workflow_for(subject, "abandoned");
    workflow.begin().unwrap();
    workflow.start_step().unwrap();
    workflow.created_at = Utc::now() - ChronoDuration::hours(1);
    workflow.updated_at = Utc::now() - ChronoDuration::minutes(30);
    workflow
}

// ============================================
// Stale Recovery
// ============================================

#[tokio::test]
async fn test_stale_workflow_is_failed_then_retried() {
    let subject = draft_subject(LaunchMode::Standard);
    let store = Arc::new(InMemoryWorkflowStore::with_subjects([subject.clone()]));
    let runner = Arc::new(RecordingRunner::new());
    let workflow = abandoned_workflow(&subject);
    store.force_put(workflow.clone());

    let report = scanner(&store, &runner, scanner_config())
        .scan_once()
        .await
        .unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(runner.submitted(), vec![workflow.id]);

    let reopened = store.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(reopened.status, WorkflowStatus::Processing);
    assert_eq!(reopened.attempts, 2);
    assert_eq!(reopened.steps[0].status, StepStatus::Failed);
    assert_eq!(
        reopened.steps[0].error.as_deref(),
        Some("executor lost: no progress within 60s")
    );

    // The resumed run restarts the abandoned step and finishes
    let provisioners = Arc::new(ScriptedProvisioners::new());
    let executor = StepExecutor::new(store.clone(), provisioners.bind());
    assert_eq!(
        executor.run(workflow.id).await,
        RunOutcome::Completed {
            aggregated_cost: 450_000
        }
    );
    let done = store.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(done.steps[0].attempts, 2);
}

#[tokio::test]
async fn test_stale_recovery_skips_locally_running_workflows() {
    let subject = draft_subject(LaunchMode::Standard);
    let store = Arc::new(InMemoryWorkflowStore::with_subjects([subject.clone()]));
    let runner = Arc::new(RecordingRunner::new());
    let workflow = abandoned_workflow(&subject);
    store.force_put(workflow.clone());
    runner.mark_running(workflow.id);

    let report = scanner(&store, &runner, scanner_config())
        .scan_once()
        .await
        .unwrap();
    assert_eq!(report, ScanReport::default());

    let untouched = store.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, WorkflowStatus::Processing);
}

#[tokio::test]
async fn test_recent_processing_workflow_is_not_stale() {
    let subject = draft_subject(LaunchMode::Standard);
    let store = Arc::new(InMemoryWorkflowStore::with_subjects([subject.clone()]));
    let runner = Arc::new(RecordingRunner::new());
    let mut workflow = abandoned_workflow(&subject);
    workflow.updated_at = Utc::now();
    store.force_put(workflow);

    let report = scanner(&store, &runner, scanner_config())
        .scan_once()
        .await
        .unwrap();
    assert_eq!(report.recovered, 0);
}

// ============================================
// Retry
// ============================================

async fn failed_workflow(
    store: &Arc<InMemoryWorkflowStore>,
    subject: &Subject,
    policy: RetryPolicy,
) -> Workflow {
    let provisioners = Arc::new(ScriptedProvisioners::new());
    provisioners.fail_next(
        StepKind::RegisterOnLedger,
        ProvisionError::retryable("rpc timeout"),
    );
    let executor = StepExecutor::new(store.clone(), provisioners.bind()).with_retry_policy(policy);
    let workflow = workflow_for(subject, &format!("failed-{}", Uuid::now_v7()));
    store.insert_workflow(&workflow).await.unwrap();
    executor.run(workflow.id).await;
    store.get_workflow(workflow.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_due_failure_is_retried() {
    let subject = draft_subject(LaunchMode::Standard);
    let store = Arc::new(InMemoryWorkflowStore::with_subjects([subject.clone()]));
    let runner = Arc::new(RecordingRunner::new());
    let failed = failed_workflow(&store, &subject, immediate_retries()).await;
    assert!(failed.next_retry_at.is_some());

    let report = scanner(&store, &runner, scanner_config())
        .scan_once()
        .await
        .unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(runner.submitted(), vec![failed.id]);

    let reopened = store.get_workflow(failed.id).await.unwrap().unwrap();
    assert_eq!(reopened.status, WorkflowStatus::Processing);
    assert_eq!(reopened.current_step, 2);
}

#[tokio::test]
async fn test_failure_before_backoff_is_not_retried() {
    let subject = draft_subject(LaunchMode::Standard);
    let store = Arc::new(InMemoryWorkflowStore::with_subjects([subject.clone()]));
    let runner = Arc::new(RecordingRunner::new());
    failed_workflow(&store, &subject, RetryPolicy::fixed(Duration::from_secs(3600), 3)).await;

    let report = scanner(&store, &runner, scanner_config())
        .scan_once()
        .await
        .unwrap();
    assert_eq!(report.retried, 0);
    assert!(runner.submitted().is_empty());
}

#[tokio::test]
async fn test_exhausted_and_expired_failures_are_not_retried() {
    let subject = draft_subject(LaunchMode::Standard);
    let store = Arc::new(InMemoryWorkflowStore::with_subjects([subject.clone()]));
    let runner = Arc::new(RecordingRunner::new());

    let mut exhausted = failed_workflow(&store, &subject, immediate_retries()).await;
    exhausted.attempts = 3;
    store.force_put(exhausted);

    let mut expired = failed_workflow(&store, &subject, immediate_retries()).await;
    expired.created_at = Utc::now() - ChronoDuration::hours(7);
    store.force_put(expired);

    let report = scanner(&store, &runner, scanner_config())
        .scan_once()
        .await
        .unwrap();
    assert_eq!(report.retried, 0);
    assert!(runner.submitted().is_empty());
}

// ============================================
// Purge and Pending Sweep
// ============================================

#[tokio::test]
async fn test_old_workflows_are_purged() {
    let subject = draft_subject(LaunchMode::Standard);
    let store = Arc::new(InMemoryWorkflowStore::with_subjects([subject.clone()]));
    let runner = Arc::new(RecordingRunner::new());

    let mut old = workflow_for(&subject, "old");
    old.status = WorkflowStatus::Success;
    old.created_at = Utc::now() - ChronoDuration::days(31);
    store.force_put(old.clone());
    let recent = workflow_for(&subject, "recent");
    store.insert_workflow(&recent).await.unwrap();

    let report = scanner(&store, &runner, scanner_config())
        .scan_once()
        .await
        .unwrap();
    assert_eq!(report.purged, 1);
    assert!(store.get_workflow(old.id).await.unwrap().is_none());
    assert!(store.find_by_idempotency_key("old").await.unwrap().is_none());
    assert!(store.get_workflow(recent.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_orphaned_pending_workflows_are_resubmitted() {
    let subject = draft_subject(LaunchMode::Standard);
    let store = Arc::new(InMemoryWorkflowStore::with_subjects([subject.clone()]));
    let runner = Arc::new(RecordingRunner::new());

    let mut orphan = workflow_for(&subject, "orphan");
    orphan.created_at = Utc::now() - ChronoDuration::minutes(5);
    store.force_put(orphan.clone());
    let fresh = workflow_for(&subject, "fresh");
    store.insert_workflow(&fresh).await.unwrap();

    let report = scanner(&store, &runner, scanner_config())
        .scan_once()
        .await
        .unwrap();
    assert_eq!(report.resubmitted, 1);
    assert_eq!(runner.submitted(), vec![orphan.id]);
}

// ============================================
// Background Runner
// ============================================

fn background(
    store: &Arc<InMemoryWorkflowStore>,
    provisioners: &Arc<ScriptedProvisioners>,
    config: RunnerConfig,
) -> Arc<BackgroundRunner> {
    let executor = Arc::new(StepExecutor::new(store.clone(), provisioners.bind()));
    Arc::new(BackgroundRunner::start(executor, config))
}

#[tokio::test]
async fn test_runner_executes_initiated_workflow() {
    let subject = draft_subject(LaunchMode::Tokenized);
    let store = Arc::new(InMemoryWorkflowStore::with_subjects([subject.clone()]));
    let provisioners = Arc::new(ScriptedProvisioners::new());
    let runner = background(&store, &provisioners, RunnerConfig::default());
    let orchestrator = Orchestrator::new(store.clone(), runner.clone());

    let initiation = orchestrator
        .initiate(subject.id, Uuid::now_v7(), "k-1")
        .await
        .unwrap();
    let done = wait_for_terminal(store.as_ref(), initiation.workflow.id, Duration::from_secs(5))
        .await
        .expect("workflow should finish");

    assert_eq!(done.status, WorkflowStatus::Success);
    assert_eq!(done.aggregated_cost, Some(700_000));
    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runner_records_panics_as_failures() {
    let subject = draft_subject(LaunchMode::Standard);
    let store = Arc::new(InMemoryWorkflowStore::with_subjects([subject.clone()]));
    let provisioners = Arc::new(ScriptedProvisioners::new());
    provisioners.panic_next(StepKind::DeployWallet);
    let runner = background(&store, &provisioners, RunnerConfig::default());

    let workflow = workflow_for(&subject, "k-1");
    store.insert_workflow(&workflow).await.unwrap();
    runner.submit(workflow.id).await.unwrap();

    let failed = wait_for_terminal(store.as_ref(), workflow.id, Duration::from_secs(5))
        .await
        .expect("workflow should be failed");
    assert_eq!(failed.status, WorkflowStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("executor panicked"));
    assert_eq!(failed.steps[1].status, StepStatus::Failed);
    assert!(failed.next_retry_at.is_some());

    runner.shutdown().await.unwrap();
}

/// Which subject write misbehaves
#[derive(Clone, Copy, PartialEq)]
enum SubjectFault {
    ConfigureErrors,
    ActivatePanics,
}

/// In-memory store whose subject writes fail on demand
struct FaultyStore {
    inner: InMemoryWorkflowStore,
    fault: SubjectFault,
}

#[async_trait]
impl WorkflowStore for FaultyStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<InsertOutcome, StoreError> {
        self.inner.insert_workflow(workflow).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        self.inner.get_workflow(id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Workflow>, StoreError> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError> {
        self.inner.update_workflow(workflow).await
    }

    async fn list_for_subject(&self, subject_id: Uuid) -> Result<Vec<Workflow>, StoreError> {
        self.inner.list_for_subject(subject_id).await
    }

    async fn list_by_status(
        &self,
        status: WorkflowStatus,
        filter: ScanFilter,
    ) -> Result<Vec<Workflow>, StoreError> {
        self.inner.list_by_status(status, filter).await
    }

    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.purge_created_before(cutoff).await
    }

    async fn get_subject(&self, id: Uuid) -> Result<Option<Subject>, StoreError> {
        self.inner.get_subject(id).await
    }

    async fn save_subject(&self, subject: &Subject) -> Result<(), StoreError> {
        self.inner.save_subject(subject).await
    }

    async fn configure_subject(
        &self,
        id: Uuid,
        refs: &ResourceRefs,
    ) -> Result<Subject, StoreError> {
        if self.fault == SubjectFault::ConfigureErrors {
            return Err(StoreError::Database("connection reset".to_string()));
        }
        self.inner.configure_subject(id, refs).await
    }

    async fn activate_subject(
        &self,
        id: Uuid,
        graduated_at: DateTime<Utc>,
    ) -> Result<Subject, StoreError> {
        if self.fault == SubjectFault::ActivatePanics {
            panic!("subject row locked");
        }
        self.inner.activate_subject(id, graduated_at).await
    }
}

fn faulty_runner(
    subject: &Subject,
    fault: SubjectFault,
) -> (Arc<FaultyStore>, Arc<BackgroundRunner>) {
    let store = Arc::new(FaultyStore {
        inner: InMemoryWorkflowStore::with_subjects([subject.clone()]),
        fault,
    });
    let provisioners = Arc::new(ScriptedProvisioners::new());
    let executor = Arc::new(StepExecutor::new(store.clone(), provisioners.bind()));
    let runner = Arc::new(BackgroundRunner::start(executor, RunnerConfig::default()));
    (store, runner)
}

#[tokio::test]
async fn test_runner_fails_final_step_when_activation_panics() {
    let subject = draft_subject(LaunchMode::Standard);
    let (store, runner) = faulty_runner(&subject, SubjectFault::ActivatePanics);

    let workflow = workflow_for(&subject, "k-1");
    store.insert_workflow(&workflow).await.unwrap();
    runner.submit(workflow.id).await.unwrap();

    let failed = wait_for_terminal(store.as_ref(), workflow.id, Duration::from_secs(5))
        .await
        .expect("workflow should be failed");
    assert_eq!(failed.status, WorkflowStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("executor panicked"));

    let last = failed.steps.last().unwrap();
    assert_eq!(last.kind, StepKind::ActivateSubject);
    assert_eq!(last.status, StepStatus::Failed);
    assert_eq!(last.error.as_deref(), Some("executor panicked"));
    assert!(failed.steps[..4]
        .iter()
        .all(|s| s.status == StepStatus::Success));
    assert!(failed.next_retry_at.is_some());

    let subject = store.get_subject(subject.id).await.unwrap().unwrap();
    assert_eq!(subject.status, SubjectStatus::Draft);
    assert!(!subject.is_graduated());

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runner_fails_configure_step_on_store_error() {
    let subject = draft_subject(LaunchMode::Standard);
    let (store, runner) = faulty_runner(&subject, SubjectFault::ConfigureErrors);

    let workflow = workflow_for(&subject, "k-1");
    store.insert_workflow(&workflow).await.unwrap();
    runner.submit(workflow.id).await.unwrap();

    let failed = wait_for_terminal(store.as_ref(), workflow.id, Duration::from_secs(5))
        .await
        .expect("workflow should be failed");
    assert_eq!(failed.status, WorkflowStatus::Failed);
    assert_eq!(failed.steps[3].kind, StepKind::ConfigureSubject);
    assert_eq!(failed.steps[3].status, StepStatus::Failed);
    assert_eq!(failed.steps[4].status, StepStatus::Pending);
    assert!(failed
        .error
        .as_deref()
        .unwrap()
        .starts_with("configure-subject: subject update failed"));
    // Store errors are transient, so the scanner may pick it up again
    assert!(failed.next_retry_at.is_some());

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runner_drops_duplicate_submissions() {
    let subject = draft_subject(LaunchMode::Standard);
    let store = Arc::new(InMemoryWorkflowStore::with_subjects([subject.clone()]));
    let provisioners =
        Arc::new(ScriptedProvisioners::new().with_delay(Duration::from_millis(20)));
    let runner = background(&store, &provisioners, RunnerConfig::default());

    let workflow = workflow_for(&subject, "k-1");
    store.insert_workflow(&workflow).await.unwrap();
    runner.submit(workflow.id).await.unwrap();
    runner.submit(workflow.id).await.unwrap();
    assert!(runner.is_running(workflow.id).await);
    assert_eq!(runner.tracked_count(), 1);

    wait_for_terminal(store.as_ref(), workflow.id, Duration::from_secs(5))
        .await
        .expect("workflow should finish");
    assert_eq!(provisioners.call_count(StepKind::DeployWallet), 1);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runner_rejects_work_after_shutdown() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let provisioners = Arc::new(ScriptedProvisioners::new());
    let runner = background(&store, &provisioners, RunnerConfig::default());

    runner.shutdown().await.unwrap();
    assert!(matches!(
        runner.submit(Uuid::now_v7()).await,
        Err(RunnerError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_scanner_loop_stops_on_cancel() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let runner = Arc::new(RecordingRunner::new());
    let scan_loop = Arc::new(scanner(
        &store,
        &runner,
        scanner_config().with_scan_interval(Duration::from_millis(10)),
    ));

    let shutdown = CancellationToken::new();
    let handle = scan_loop.start(shutdown.clone());
    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("scanner should stop")
        .unwrap();
}
