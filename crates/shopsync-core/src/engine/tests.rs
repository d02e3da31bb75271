use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::Mutex;

use super::*;
use crate::db::{Database, LibSqlMirrorStore, LibSqlOperationLog};
use crate::external::{ExternalErrorKind, InMemoryExternal};
use crate::models::{MirrorEntry, Price};

/// Mirror store that can be told to lose version races or fail writes
struct FlakyMirror {
    inner: LibSqlMirrorStore,
    conflicts_remaining: AtomicU32,
    fail_writes: AtomicBool,
    puts: AtomicU32,
}

impl FlakyMirror {
    fn new(inner: LibSqlMirrorStore) -> Self {
        Self {
            inner,
            conflicts_remaining: AtomicU32::new(0),
            fail_writes: AtomicBool::new(false),
            puts: AtomicU32::new(0),
        }
    }

    fn inject_conflicts(&self, count: u32) {
        self.conflicts_remaining.store(count, Ordering::SeqCst);
    }

    fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn puts(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }

    fn check_write(&self, id: &ProductId, expected: u64) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Database("disk unavailable".to_string()));
        }
        let lost_race = self
            .conflicts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost_race {
            return Err(Error::Conflict {
                id: id.to_string(),
                expected,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MirrorStore for FlakyMirror {
    async fn get(&self, id: &ProductId) -> Result<Option<ProductRecord>> {
        self.inner.get(id).await
    }

    async fn entry(&self, id: &ProductId) -> Result<Option<MirrorEntry>> {
        self.inner.entry(id).await
    }

    async fn list(&self) -> Result<Vec<ProductRecord>> {
        self.inner.list().await
    }

    async fn list_entries(&self) -> Result<Vec<MirrorEntry>> {
        self.inner.list_entries().await
    }

    async fn put(&self, record: &ProductRecord, expected_local_version: u64) -> Result<u64> {
        self.check_write(&record.id, expected_local_version)?;
        let version = self.inner.put(record, expected_local_version).await?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    async fn delete(&self, id: &ProductId, expected_local_version: u64) -> Result<()> {
        self.check_write(id, expected_local_version)?;
        self.inner.delete(id, expected_local_version).await
    }

    async fn mark_pending(&self, id: &ProductId, operation: PendingOperation) -> Result<()> {
        self.inner.mark_pending(id, operation).await
    }
}

struct Harness {
    engine: ReconciliationEngine,
    external: Arc<InMemoryExternal>,
    mirror: Arc<FlakyMirror>,
    operations: Arc<LibSqlOperationLog>,
}

fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::immediate(5),
        external_timeout: Duration::from_secs(5),
        sweep_timeout: Duration::from_secs(5),
        conflict_retry_cap: 8,
        operation_lease: Duration::from_secs(60),
        operation_retention: Duration::from_secs(3600),
    }
}

async fn harness_with(config: EngineConfig) -> Harness {
    let db = Arc::new(Database::open_in_memory().await.unwrap());
    let external = Arc::new(InMemoryExternal::new());
    let mirror = Arc::new(FlakyMirror::new(LibSqlMirrorStore::new(Arc::clone(&db))));
    let operations = Arc::new(LibSqlOperationLog::new(db));
    let engine = ReconciliationEngine::new(
        external.clone(),
        mirror.clone(),
        operations.clone(),
        config,
    );
    Harness {
        engine,
        external,
        mirror,
        operations,
    }
}

async fn harness() -> Harness {
    harness_with(test_config()).await
}

fn ctx() -> AuthContext {
    AuthContext::new("test.myshopify.com", "shpat_test")
}

fn fields(title: &str, cents: i64) -> ProductFields {
    ProductFields {
        title: title.to_string(),
        description: format!("<p>{title}</p>"),
        price: Price::from_cents(cents),
        vendor: "Acme".to_string(),
    }
}

fn key(value: &str) -> Option<String> {
    Some(value.to_string())
}

#[tokio::test(flavor = "multi_thread")]
async fn create_writes_external_then_mirror() {
    let h = harness().await;

    let outcome = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("create-mug"))
        .await
        .unwrap();

    assert!(outcome.is_committed());
    assert!(!outcome.replayed);
    let external = h.external.snapshot().await;
    assert_eq!(external.len(), 1);
    assert_eq!(outcome.record.as_ref(), Some(&external[0]));
    assert_eq!(h.engine.list().await.unwrap(), external);

    let entry = h.mirror.entry(&outcome.product_id).await.unwrap().unwrap();
    assert_eq!(entry.sync.pending_operation, PendingOperation::None);
    assert_eq!(entry.sync.local_version, 1);

    let log = h.operations.get("create-mug").await.unwrap().unwrap();
    assert_eq!(log.state, OperationState::Committed);
    assert_eq!(log.product_id, Some(outcome.product_id));
    assert_eq!(log.attempts, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_create_with_same_key_is_applied_once() {
    let h = harness().await;

    let first = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("create-mug"))
        .await
        .unwrap();
    let second = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("create-mug"))
        .await
        .unwrap();

    assert_eq!(first.product_id, second.product_id);
    assert_eq!(first.record, second.record);
    assert!(second.replayed);
    assert_eq!(h.external.snapshot().await.len(), 1);
    assert_eq!(h.external.mutation_count().await, 1);
    assert_eq!(h.engine.list().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reused_key_with_different_payload_is_rejected() {
    let h = harness().await;
    h.engine
        .create(&ctx(), fields("Mug", 1250), key("shared"))
        .await
        .unwrap();

    let error = h
        .engine
        .create(&ctx(), fields("Bowl", 900), key("shared"))
        .await
        .unwrap_err();

    assert!(matches!(error, Error::IdempotencyMismatch(k) if k == "shared"));
    assert_eq!(h.external.snapshot().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn generated_keys_keep_creates_distinct() {
    let h = harness().await;
    let first = h.engine.create(&ctx(), fields("Mug", 1250), None).await.unwrap();
    let second = h.engine.create(&ctx(), fields("Mug", 1250), None).await.unwrap();

    assert_ne!(first.idempotency_key, second.idempotency_key);
    assert_ne!(first.product_id, second.product_id);
    assert_eq!(h.engine.list().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn blank_idempotency_key_is_rejected() {
    let h = harness().await;
    let error = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("   "))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Validation(_)));
    assert_eq!(h.external.mutation_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn version_conflicts_are_retried_until_mirror_matches() {
    let h = harness().await;
    h.mirror.inject_conflicts(3);

    let outcome = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("contended"))
        .await
        .unwrap();

    assert!(outcome.is_committed());
    assert_eq!(h.mirror.puts(), 1);
    assert_eq!(h.engine.list().await.unwrap(), h.external.snapshot().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn update_conflicts_are_retried_until_mirror_matches() {
    let h = harness().await;
    let created = h
        .engine
        .create(&ctx(), fields("Mug", 1250), None)
        .await
        .unwrap();
    h.mirror.inject_conflicts(5);

    let outcome = h
        .engine
        .update(&ctx(), created.product_id.clone(), fields("Mug XL", 1500), None)
        .await
        .unwrap();

    assert!(outcome.is_committed());
    assert_eq!(h.engine.list().await.unwrap(), h.external.snapshot().await);
    let entry = h.mirror.entry(&created.product_id).await.unwrap().unwrap();
    assert_eq!(entry.sync.local_version, 2);
    assert_eq!(entry.sync.pending_operation, PendingOperation::None);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_conflict_budget_leaves_orphan_for_sweep() {
    let h = harness().await;
    h.mirror.inject_conflicts(100);

    let outcome = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("orphan"))
        .await
        .unwrap();

    assert_eq!(outcome.state, OperationState::ExternalConfirmed);
    assert!(outcome.record.is_some());
    assert!(h.engine.list().await.unwrap().is_empty());

    h.mirror.inject_conflicts(0);
    let report = h.engine.sweep(&ctx()).await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(h.engine.list().await.unwrap(), h.external.snapshot().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn mirror_failure_after_external_success_is_reported_as_success() {
    let h = harness().await;
    h.mirror.set_failing(true);

    let outcome = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("orphan"))
        .await
        .unwrap();

    assert_eq!(outcome.state, OperationState::ExternalConfirmed);
    assert_eq!(h.external.snapshot().await.len(), 1);
    assert!(h.engine.list().await.unwrap().is_empty());
    let log = h.operations.get("orphan").await.unwrap().unwrap();
    assert_eq!(log.state, OperationState::ExternalConfirmed);
    assert_eq!(log.result, outcome.record);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_after_orphan_resumes_at_mirror_write() {
    let h = harness_with(EngineConfig {
        operation_lease: Duration::ZERO,
        ..test_config()
    })
    .await;
    h.mirror.set_failing(true);
    let first = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("resume"))
        .await
        .unwrap();
    assert_eq!(first.state, OperationState::ExternalConfirmed);

    h.mirror.set_failing(false);
    let second = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("resume"))
        .await
        .unwrap();

    assert!(second.is_committed());
    assert_eq!(second.product_id, first.product_id);
    assert_eq!(h.external.mutation_count().await, 1);
    assert_eq!(h.engine.list().await.unwrap(), h.external.snapshot().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn live_operation_blocks_duplicate_request() {
    let h = harness().await;
    let request = Request::Create(fields("Mug", 1250));
    let now = now_ms();
    h.operations
        .claim(&OperationRecord {
            idempotency_key: "in-flight".to_string(),
            kind: OperationKind::Create,
            product_id: None,
            fingerprint: fingerprint(&request).unwrap(),
            state: OperationState::ExternalPending,
            result: None,
            error: None,
            attempts: 1,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    let error = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("in-flight"))
        .await
        .unwrap_err();

    assert!(matches!(error, Error::OperationInProgress(_)));
    assert_eq!(h.external.mutation_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_lease_is_reclaimed_and_rerun() {
    let h = harness().await;
    let request = Request::Create(fields("Mug", 1250));
    let stale = now_ms() - 10 * 60 * 1000;
    h.operations
        .claim(&OperationRecord {
            idempotency_key: "abandoned".to_string(),
            kind: OperationKind::Create,
            product_id: None,
            fingerprint: fingerprint(&request).unwrap(),
            state: OperationState::ExternalPending,
            result: None,
            error: None,
            attempts: 1,
            created_at: stale,
            updated_at: stale,
        })
        .await
        .unwrap();

    let outcome = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("abandoned"))
        .await
        .unwrap();

    assert!(outcome.is_committed());
    let log = h.operations.get("abandoned").await.unwrap().unwrap();
    assert_eq!(log.attempts, 2);
    assert_eq!(h.engine.list().await.unwrap(), h.external.snapshot().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_input_never_reaches_either_store() {
    let h = harness().await;

    let error = h
        .engine
        .create(&ctx(), fields("Mug", -500), key("negative"))
        .await
        .unwrap_err();

    assert!(matches!(error, Error::Validation(_)));
    assert_eq!(h.external.mutation_count().await, 0);
    assert!(h.engine.list().await.unwrap().is_empty());
    assert!(h.operations.get("negative").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn permanent_external_failure_skips_mirror_and_replays() {
    let h = harness().await;
    h.external.fail_next(1, ExternalErrorKind::Permanent).await;

    let error = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("rejected"))
        .await
        .unwrap_err();

    let Error::External(external) = error else {
        panic!("expected external error");
    };
    assert!(!external.is_transient());
    assert_eq!(external.status, Some(422));
    assert!(h.engine.list().await.unwrap().is_empty());

    let log = h.operations.get("rejected").await.unwrap().unwrap();
    assert_eq!(log.state, OperationState::Failed(FailureKind::Permanent));
    assert_eq!(log.attempts, 1);

    let replayed = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("rejected"))
        .await
        .unwrap_err();
    assert!(matches!(replayed, Error::External(e) if e == external));
    assert!(h.external.snapshot().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_are_retried_with_backoff() {
    let h = harness().await;
    h.external.fail_next(2, ExternalErrorKind::Transient).await;

    let outcome = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("flaky"))
        .await
        .unwrap();

    assert!(outcome.is_committed());
    let log = h.operations.get("flaky").await.unwrap().unwrap();
    assert_eq!(log.attempts, 3);
    assert_eq!(h.engine.list().await.unwrap(), h.external.snapshot().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_transient_failure_can_be_retried_with_same_key() {
    let h = harness().await;
    h.external.fail_next(5, ExternalErrorKind::Transient).await;

    let error = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("outage"))
        .await
        .unwrap_err();

    assert!(matches!(&error, Error::External(e) if e.is_transient()));
    assert!(h.engine.list().await.unwrap().is_empty());
    let log = h.operations.get("outage").await.unwrap().unwrap();
    assert_eq!(log.state, OperationState::Failed(FailureKind::Transient));
    assert_eq!(log.attempts, 5);

    let outcome = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("outage"))
        .await
        .unwrap();
    assert!(outcome.is_committed());
    assert_eq!(h.external.snapshot().await.len(), 1);
    assert_eq!(h.engine.list().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn update_of_missing_product_fails_without_mirror_write() {
    let h = harness().await;

    let error = h
        .engine
        .update(&ctx(), ProductId::new("404404"), fields("Ghost", 100), None)
        .await
        .unwrap_err();

    assert!(matches!(&error, Error::External(e) if e.is_not_found()));
    assert!(h.engine.list().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_removes_from_both_stores() {
    let h = harness().await;
    let created = h
        .engine
        .create(&ctx(), fields("Mug", 1250), None)
        .await
        .unwrap();

    let outcome = h
        .engine
        .delete(&ctx(), created.product_id.clone(), key("delete-mug"))
        .await
        .unwrap();

    assert!(outcome.is_committed());
    assert_eq!(outcome.record, None);
    assert!(h.external.snapshot().await.is_empty());
    assert!(h.engine.get(&created.product_id).await.unwrap().is_none());
    let entry = h.mirror.entry(&created.product_id).await.unwrap().unwrap();
    assert!(entry.is_deleted);
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_of_unknown_product_is_not_found() {
    let h = harness().await;

    let error = h
        .engine
        .delete(&ctx(), ProductId::new("777"), None)
        .await
        .unwrap_err();

    assert!(matches!(&error, Error::External(e) if e.is_not_found()));
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_of_externally_missing_product_cleans_mirror() {
    let h = harness().await;
    let created = h
        .engine
        .create(&ctx(), fields("Mug", 1250), None)
        .await
        .unwrap();
    h.external.remove(&created.product_id).await;

    let outcome = h
        .engine
        .delete(&ctx(), created.product_id.clone(), None)
        .await
        .unwrap();

    assert!(outcome.is_committed());
    assert!(h.engine.list().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_external_delete_leaves_mirror_untouched() {
    let h = harness().await;
    let created = h
        .engine
        .create(&ctx(), fields("Mug", 1250), None)
        .await
        .unwrap();
    h.external.fail_next(1, ExternalErrorKind::Permanent).await;

    let error = h
        .engine
        .delete(&ctx(), created.product_id.clone(), None)
        .await
        .unwrap_err();

    assert!(matches!(error, Error::External(_)));
    let entry = h.mirror.entry(&created.product_id).await.unwrap().unwrap();
    assert!(!entry.is_deleted);
    assert_eq!(entry.sync.local_version, 1);
    assert_eq!(entry.sync.pending_operation, PendingOperation::None);
    assert_eq!(h.engine.list().await.unwrap(), h.external.snapshot().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_repairs_delete_interrupted_before_mirror_write() {
    let h = harness().await;
    let created = h
        .engine
        .create(&ctx(), fields("Mug", 1250), None)
        .await
        .unwrap();
    // External delete landed, then the process died before the mirror write
    h.external.remove(&created.product_id).await;
    assert_eq!(h.engine.list().await.unwrap().len(), 1);

    let report = h.engine.sweep(&ctx()).await.unwrap();

    assert_eq!(report.tombstoned, 1);
    assert!(h.engine.list().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_converges_and_second_run_is_noop() {
    let h = harness().await;
    let a = h.external.seed(fields("A", 100)).await;
    h.external.seed(fields("B", 200)).await;
    h.external.seed(fields("C", 300)).await;
    h.mirror.put(&a, 0).await.unwrap();

    let report = h.engine.sweep(&ctx()).await.unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.unchanged, 1);
    assert_eq!(h.engine.list().await.unwrap(), h.external.snapshot().await);

    let puts = h.mirror.puts();
    let second = h.engine.sweep(&ctx()).await.unwrap();
    assert!(second.is_noop());
    assert_eq!(second.unchanged, 3);
    assert_eq!(h.mirror.puts(), puts);
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_refreshes_records_edited_elsewhere() {
    let h = harness().await;
    let created = h
        .engine
        .create(&ctx(), fields("Mug", 1250), None)
        .await
        .unwrap();
    h.external
        .edit(&created.product_id, fields("Mug (sale)", 999))
        .await
        .unwrap();

    let report = h.engine.sweep(&ctx()).await.unwrap();

    assert_eq!(report.refreshed, 1);
    assert_eq!(h.engine.list().await.unwrap(), h.external.snapshot().await);
}

/// External store whose point lookups are unreachable
struct UnreachableLookups(Arc<InMemoryExternal>);

#[async_trait]
impl ExternalResourceClient for UnreachableLookups {
    async fn create(
        &self,
        ctx: &AuthContext,
        idempotency_key: &str,
        fields: &ProductFields,
    ) -> std::result::Result<ProductRecord, ExternalError> {
        self.0.create(ctx, idempotency_key, fields).await
    }

    async fn update(
        &self,
        ctx: &AuthContext,
        id: &ProductId,
        fields: &ProductFields,
    ) -> std::result::Result<ProductRecord, ExternalError> {
        self.0.update(ctx, id, fields).await
    }

    async fn delete(
        &self,
        ctx: &AuthContext,
        id: &ProductId,
    ) -> std::result::Result<(), ExternalError> {
        self.0.delete(ctx, id).await
    }

    async fn find_created(
        &self,
        ctx: &AuthContext,
        idempotency_key: &str,
    ) -> std::result::Result<Option<ProductRecord>, ExternalError> {
        self.0.find_created(ctx, idempotency_key).await
    }

    async fn get(
        &self,
        _ctx: &AuthContext,
        _id: &ProductId,
    ) -> std::result::Result<ProductRecord, ExternalError> {
        Err(ExternalError::from_status(503, "lookup unavailable"))
    }

    async fn list(&self, ctx: &AuthContext) -> std::result::Result<Vec<ProductRecord>, ExternalError> {
        self.0.list(ctx).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_keeps_row_when_absence_is_unconfirmed() {
    let h = harness().await;
    let stray = ProductRecord {
        id: ProductId::new("9999"),
        title: "Stray".to_string(),
        description: String::new(),
        price: Price::from_cents(100),
        vendor: String::new(),
        external_version: None,
    };
    h.mirror.put(&stray, 0).await.unwrap();
    let engine = ReconciliationEngine::new(
        Arc::new(UnreachableLookups(h.external.clone())),
        h.mirror.clone(),
        h.operations.clone(),
        test_config(),
    );

    let report = engine.sweep(&ctx()).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.tombstoned, 0);
    assert_eq!(h.engine.get(&stray.id).await.unwrap(), Some(stray.clone()));
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_settles_orphaned_operations() {
    let h = harness_with(EngineConfig {
        operation_lease: Duration::ZERO,
        ..test_config()
    })
    .await;
    h.mirror.set_failing(true);
    h.engine
        .create(&ctx(), fields("Mug", 1250), key("orphan"))
        .await
        .unwrap();
    h.mirror.set_failing(false);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = h.engine.sweep(&ctx()).await.unwrap();

    assert_eq!(report.inserted, 1);
    assert_eq!(report.operations_repaired, 1);
    let log = h.operations.get("orphan").await.unwrap().unwrap();
    assert_eq!(log.state, OperationState::Committed);

    let replayed = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("orphan"))
        .await
        .unwrap();
    assert!(replayed.replayed);
    assert_eq!(h.external.mutation_count().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_does_not_resurrect_tombstones() {
    let h = harness().await;
    let created = h
        .engine
        .create(&ctx(), fields("Mug", 1250), None)
        .await
        .unwrap();
    let entry = h.mirror.entry(&created.product_id).await.unwrap().unwrap();
    // Mirror delete landed but the external record is still listed
    h.mirror
        .delete(&created.product_id, entry.sync.local_version)
        .await
        .unwrap();

    let report = h.engine.sweep(&ctx()).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert!(h.engine.get(&created.product_id).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn create_retry_after_lost_response_reuses_stored_product() {
    let h = harness().await;
    h.external.ignore_idempotency_keys().await;
    h.external.lose_create_responses(1).await;

    let outcome = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("lost-response"))
        .await
        .unwrap();

    assert!(outcome.is_committed());
    let external = h.external.snapshot().await;
    assert_eq!(external.len(), 1);
    assert_eq!(h.external.mutation_count().await, 1);
    assert_eq!(outcome.record.as_ref(), Some(&external[0]));
    assert_eq!(h.engine.list().await.unwrap(), external);
    let log = h.operations.get("lost-response").await.unwrap().unwrap();
    assert_eq!(log.attempts, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn resumed_create_after_exhausted_timeouts_does_not_duplicate() {
    let h = harness_with(EngineConfig {
        retry: RetryPolicy::immediate(1),
        ..test_config()
    })
    .await;
    h.external.ignore_idempotency_keys().await;
    h.external.lose_create_responses(1).await;

    let error = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("timed-out"))
        .await
        .unwrap_err();
    assert!(matches!(&error, Error::External(e) if e.is_transient()));

    let outcome = h
        .engine
        .create(&ctx(), fields("Mug", 1250), key("timed-out"))
        .await
        .unwrap();

    assert!(outcome.is_committed());
    assert_eq!(h.external.snapshot().await.len(), 1);
    assert_eq!(h.engine.list().await.unwrap(), h.external.snapshot().await);
}

type Hook = Pin<Box<dyn Future<Output = ()> + Send>>;

/// External store that runs a hook after taking a listing and before
/// returning it, so the listing is stale by the time the caller sees it
struct ListingRace {
    inner: Arc<InMemoryExternal>,
    during_list: Mutex<Option<Hook>>,
}

#[async_trait]
impl ExternalResourceClient for ListingRace {
    async fn create(
        &self,
        ctx: &AuthContext,
        idempotency_key: &str,
        fields: &ProductFields,
    ) -> std::result::Result<ProductRecord, ExternalError> {
        self.inner.create(ctx, idempotency_key, fields).await
    }

    async fn find_created(
        &self,
        ctx: &AuthContext,
        idempotency_key: &str,
    ) -> std::result::Result<Option<ProductRecord>, ExternalError> {
        self.inner.find_created(ctx, idempotency_key).await
    }

    async fn update(
        &self,
        ctx: &AuthContext,
        id: &ProductId,
        fields: &ProductFields,
    ) -> std::result::Result<ProductRecord, ExternalError> {
        self.inner.update(ctx, id, fields).await
    }

    async fn delete(
        &self,
        ctx: &AuthContext,
        id: &ProductId,
    ) -> std::result::Result<(), ExternalError> {
        self.inner.delete(ctx, id).await
    }

    async fn get(
        &self,
        ctx: &AuthContext,
        id: &ProductId,
    ) -> std::result::Result<ProductRecord, ExternalError> {
        self.inner.get(ctx, id).await
    }

    async fn list(&self, ctx: &AuthContext) -> std::result::Result<Vec<ProductRecord>, ExternalError> {
        let listing = self.inner.list(ctx).await?;
        let hook = self.during_list.lock().await.take();
        if let Some(hook) = hook {
            hook.await;
        }
        Ok(listing)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_never_overwrites_row_updated_after_listing() {
    let h = harness().await;
    let created = h
        .engine
        .create(&ctx(), fields("Mug", 1250), None)
        .await
        .unwrap();
    // Drift the sweep will see in its listing
    h.external
        .edit(&created.product_id, fields("Mug (sale)", 999))
        .await
        .unwrap();

    let live = h.engine.clone();
    let id = created.product_id.clone();
    let concurrent_update: Hook = Box::pin(async move {
        live.update(&ctx(), id, fields("Mug v2", 1500), None)
            .await
            .unwrap();
    });
    let race = Arc::new(ListingRace {
        inner: h.external.clone(),
        during_list: Mutex::new(Some(concurrent_update)),
    });
    let sweeper = ReconciliationEngine::new(
        race,
        h.mirror.clone(),
        h.operations.clone(),
        test_config(),
    );

    let report = sweeper.sweep(&ctx()).await.unwrap();

    assert_eq!(report.refreshed, 0);
    assert_eq!(report.skipped, 1);
    let external = h.external.snapshot().await;
    assert_eq!(external[0].title, "Mug v2");
    let entry = h.mirror.entry(&created.product_id).await.unwrap().unwrap();
    assert_eq!(entry.record, external[0]);
    assert_eq!(entry.sync.pending_operation, PendingOperation::None);

    let again = h.engine.sweep(&ctx()).await.unwrap();
    assert!(again.is_noop());
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_keeps_orphan_open_while_mirror_write_fails() {
    let h = harness_with(EngineConfig {
        operation_lease: Duration::ZERO,
        ..test_config()
    })
    .await;
    h.mirror.set_failing(true);
    h.engine
        .create(&ctx(), fields("Mug", 1250), key("orphan"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = h.engine.sweep(&ctx()).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.inserted, 0);
    assert_eq!(report.operations_repaired, 0);
    let log = h.operations.get("orphan").await.unwrap().unwrap();
    assert_eq!(log.state, OperationState::ExternalConfirmed);
    assert!(h.engine.list().await.unwrap().is_empty());

    h.mirror.set_failing(false);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = h.engine.sweep(&ctx()).await.unwrap();

    assert_eq!(report.inserted, 1);
    assert_eq!(report.operations_repaired, 1);
    let log = h.operations.get("orphan").await.unwrap().unwrap();
    assert_eq!(log.state, OperationState::Committed);
    assert_eq!(h.engine.list().await.unwrap(), h.external.snapshot().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_clears_marker_left_by_orphaned_update() {
    let h = harness().await;
    let created = h
        .engine
        .create(&ctx(), fields("Mug", 1250), None)
        .await
        .unwrap();
    h.mirror.set_failing(true);
    let outcome = h
        .engine
        .update(&ctx(), created.product_id.clone(), fields("Mug XL", 1500), None)
        .await
        .unwrap();
    assert_eq!(outcome.state, OperationState::ExternalConfirmed);
    let entry = h.mirror.entry(&created.product_id).await.unwrap().unwrap();
    assert_eq!(entry.sync.pending_operation, PendingOperation::Update);

    h.mirror.set_failing(false);
    let report = h.engine.sweep(&ctx()).await.unwrap();

    assert_eq!(report.refreshed, 1);
    let entry = h.mirror.entry(&created.product_id).await.unwrap().unwrap();
    assert_eq!(entry.sync.pending_operation, PendingOperation::None);
    assert_eq!(h.engine.list().await.unwrap(), h.external.snapshot().await);
    assert!(h.engine.sweep(&ctx()).await.unwrap().is_noop());
}
