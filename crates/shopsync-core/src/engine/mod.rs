//! Reconciliation engine.
//!
//! Runs create/update/delete as one logical operation over the external
//! resource and the local mirror:
//!
//! ```text
//! Initiated -> ExternalPending -> ExternalConfirmed -> MirrorPending -> Committed
//!                    |
//!                    +-> Failed(Transient)   retry budget exhausted, retryable
//!                    +-> Failed(Permanent)   rejected, terminal
//! ```
//!
//! The external write always lands first. Every operation is recorded in the
//! [`OperationLog`] under its idempotency key before the external call, so a
//! repeated request replays the stored outcome or resumes where the previous
//! attempt stopped. If the mirror write cannot be confirmed after the
//! external write succeeded, the operation still reports success and the
//! drift is left for [`ReconciliationEngine::sweep`].

mod retry;
mod sweep;
#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::db::{MirrorStore, OperationLog};
use crate::error::{Error, Result};
use crate::external::{AuthContext, ExternalError, ExternalResourceClient};
use crate::models::{
    FailureKind, OperationKind, OperationRecord, OperationState, PendingOperation, ProductFields,
    ProductId, ProductRecord,
};

pub use retry::{with_retry, RetryPolicy};
pub use sweep::SweepReport;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Tuning for the engine and the sweep
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Bound on a single external call
    pub external_timeout: Duration,
    /// Bound on the full external listing during a sweep
    pub sweep_timeout: Duration,
    /// Sanity cap on optimistic-concurrency retries for one mirror write
    pub conflict_retry_cap: u32,
    /// How long an unfinished operation is presumed to have a live worker
    pub operation_lease: Duration,
    /// How long settled operations stay replayable
    pub operation_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            external_timeout: Duration::from_secs(10),
            sweep_timeout: Duration::from_secs(120),
            conflict_retry_cap: 32,
            operation_lease: Duration::from_secs(60),
            operation_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Result of a create/update/delete that reached the external resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    pub idempotency_key: String,
    pub product_id: ProductId,
    /// External result; `None` for deletes
    pub record: Option<ProductRecord>,
    /// `Committed`, or `ExternalConfirmed` when the mirror write was
    /// deferred to the sweep
    pub state: OperationState,
    /// The outcome was replayed from an earlier request with the same key
    pub replayed: bool,
}

impl OperationOutcome {
    pub fn is_committed(&self) -> bool {
        self.state == OperationState::Committed
    }
}

/// What a mirror convergence step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MirrorWrite {
    Inserted,
    Refreshed,
    Removed,
    Unchanged,
    /// Row refused the write: tombstoned, or moved since it was read
    Skipped,
}

#[derive(Debug, Clone)]
enum Request {
    Create(ProductFields),
    Update(ProductId, ProductFields),
    Delete(ProductId),
}

impl Request {
    const fn kind(&self) -> OperationKind {
        match self {
            Self::Create(_) => OperationKind::Create,
            Self::Update(..) => OperationKind::Update,
            Self::Delete(_) => OperationKind::Delete,
        }
    }

    const fn product_id(&self) -> Option<&ProductId> {
        match self {
            Self::Create(_) => None,
            Self::Update(id, _) | Self::Delete(id) => Some(id),
        }
    }

    const fn fields(&self) -> Option<&ProductFields> {
        match self {
            Self::Create(fields) | Self::Update(_, fields) => Some(fields),
            Self::Delete(_) => None,
        }
    }
}

#[derive(Serialize)]
struct Fingerprint<'a> {
    kind: OperationKind,
    product_id: Option<&'a ProductId>,
    fields: Option<&'a ProductFields>,
}

fn fingerprint(request: &Request) -> Result<String> {
    Ok(serde_json::to_string(&Fingerprint {
        kind: request.kind(),
        product_id: request.product_id(),
        fields: request.fields(),
    })?)
}

fn resolve_key(idempotency_key: Option<String>) -> Result<String> {
    let Some(key) = idempotency_key else {
        return Ok(uuid::Uuid::now_v7().to_string());
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::validation("idempotency key must not be empty"));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(Error::validation(format!(
            "idempotency key must be at most {MAX_IDEMPOTENCY_KEY_LEN} bytes"
        )));
    }
    Ok(key.to_string())
}

fn validate_id(id: &ProductId) -> Result<()> {
    if id.as_str().trim().is_empty() {
        return Err(Error::validation("product id must not be empty"));
    }
    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn encode_failure(error: &ExternalError) -> String {
    serde_json::to_string(error).unwrap_or_else(|_| error.message.clone())
}

fn decode_failure(stored: Option<&str>) -> ExternalError {
    let stored = stored.unwrap_or("operation failed permanently");
    serde_json::from_str(stored).unwrap_or_else(|_| ExternalError::permanent(stored))
}

/// How a repeated idempotency key continues
enum Resume {
    Replay(OperationOutcome),
    External(OperationRecord),
    Mirror(OperationRecord),
}

/// Coordinates the external resource, the mirror, and the operation log
#[derive(Clone)]
pub struct ReconciliationEngine {
    external: Arc<dyn ExternalResourceClient>,
    mirror: Arc<dyn MirrorStore>,
    operations: Arc<dyn OperationLog>,
    config: EngineConfig,
}

impl ReconciliationEngine {
    pub fn new(
        external: Arc<dyn ExternalResourceClient>,
        mirror: Arc<dyn MirrorStore>,
        operations: Arc<dyn OperationLog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            external,
            mirror,
            operations,
            config,
        }
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Mirror contents ordered by id
    pub async fn list(&self) -> Result<Vec<ProductRecord>> {
        self.mirror.list().await
    }

    pub async fn get(&self, id: &ProductId) -> Result<Option<ProductRecord>> {
        self.mirror.get(id).await
    }

    pub async fn create(
        &self,
        ctx: &AuthContext,
        fields: ProductFields,
        idempotency_key: Option<String>,
    ) -> Result<OperationOutcome> {
        fields.validate()?;
        self.execute(ctx, Request::Create(fields), idempotency_key)
            .await
    }

    pub async fn update(
        &self,
        ctx: &AuthContext,
        id: ProductId,
        fields: ProductFields,
        idempotency_key: Option<String>,
    ) -> Result<OperationOutcome> {
        validate_id(&id)?;
        fields.validate()?;
        self.execute(ctx, Request::Update(id, fields), idempotency_key)
            .await
    }

    pub async fn delete(
        &self,
        ctx: &AuthContext,
        id: ProductId,
        idempotency_key: Option<String>,
    ) -> Result<OperationOutcome> {
        validate_id(&id)?;
        self.execute(ctx, Request::Delete(id), idempotency_key)
            .await
    }

    async fn execute(
        &self,
        ctx: &AuthContext,
        request: Request,
        idempotency_key: Option<String>,
    ) -> Result<OperationOutcome> {
        let key = resolve_key(idempotency_key)?;
        let fingerprint = fingerprint(&request)?;
        let now = now_ms();
        let fresh = OperationRecord {
            idempotency_key: key.clone(),
            kind: request.kind(),
            product_id: request.product_id().cloned(),
            fingerprint: fingerprint.clone(),
            state: OperationState::Initiated,
            result: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };

        let resume = if self.operations.claim(&fresh).await? {
            Resume::External(fresh)
        } else {
            let existing = self
                .operations
                .get(&key)
                .await?
                .ok_or_else(|| Error::OperationInProgress(key.clone()))?;
            if existing.fingerprint != fingerprint {
                return Err(Error::IdempotencyMismatch(key));
            }
            self.resume(existing).await?
        };

        match resume {
            Resume::Replay(outcome) => Ok(outcome),
            Resume::External(mut record) => {
                let result = self.run_external(ctx, &request, &mut record).await?;
                let product_id = match (&result, request.product_id()) {
                    (Some(result), _) => result.id.clone(),
                    (None, Some(id)) => id.clone(),
                    (None, None) => {
                        return Err(Error::Database(
                            "create finished without a product id".to_string(),
                        ))
                    }
                };
                Ok(self
                    .commit(request.kind(), product_id, result, record)
                    .await)
            }
            Resume::Mirror(record) => {
                let product_id = record.product_id.clone().ok_or_else(|| {
                    Error::Database(format!(
                        "operation {} confirmed without a product id",
                        record.idempotency_key
                    ))
                })?;
                let result = record.result.clone();
                tracing::info!(
                    operation = %record.kind,
                    product_id = %product_id,
                    idempotency_key = %record.idempotency_key,
                    "Resuming mirror write for externally confirmed operation"
                );
                Ok(self.commit(record.kind, product_id, result, record).await)
            }
        }
    }

    /// Decide how a request continues when its key is already in the log
    async fn resume(&self, existing: OperationRecord) -> Result<Resume> {
        let key = existing.idempotency_key.clone();
        match existing.state {
            OperationState::Committed => {
                let product_id = existing.product_id.clone().ok_or_else(|| {
                    Error::Database(format!("committed operation {key} has no product id"))
                })?;
                tracing::debug!(idempotency_key = %key, "Replaying committed operation");
                Ok(Resume::Replay(OperationOutcome {
                    idempotency_key: key,
                    product_id,
                    record: existing.result,
                    state: OperationState::Committed,
                    replayed: true,
                }))
            }
            OperationState::Failed(FailureKind::Permanent) => {
                Err(decode_failure(existing.error.as_deref()).into())
            }
            OperationState::Failed(FailureKind::Transient) => {
                self.reclaim(existing).await.map(Resume::External)
            }
            OperationState::Initiated | OperationState::ExternalPending => {
                self.ensure_lease_expired(&existing)?;
                self.reclaim(existing).await.map(Resume::External)
            }
            OperationState::ExternalConfirmed | OperationState::MirrorPending => {
                self.ensure_lease_expired(&existing)?;
                self.reclaim(existing).await.map(Resume::Mirror)
            }
        }
    }

    fn ensure_lease_expired(&self, existing: &OperationRecord) -> Result<()> {
        let idle = now_ms().saturating_sub(existing.updated_at);
        if idle < duration_ms(self.config.operation_lease) {
            return Err(Error::OperationInProgress(existing.idempotency_key.clone()));
        }
        Ok(())
    }

    async fn reclaim(&self, mut existing: OperationRecord) -> Result<OperationRecord> {
        let now = now_ms();
        if !self
            .operations
            .reclaim(&existing.idempotency_key, existing.updated_at, now)
            .await?
        {
            return Err(Error::OperationInProgress(existing.idempotency_key));
        }
        existing.updated_at = now;
        Ok(existing)
    }

    /// One external attempt. `retrying` is set once any earlier attempt for
    /// this key may have reached the store, in which case a create first
    /// looks for the product that attempt stored.
    async fn call_external(
        &self,
        ctx: &AuthContext,
        request: &Request,
        idempotency_key: &str,
        retrying: bool,
    ) -> std::result::Result<Option<ProductRecord>, ExternalError> {
        match request {
            Request::Create(fields) => {
                if retrying {
                    if let Some(existing) =
                        self.external.find_created(ctx, idempotency_key).await?
                    {
                        tracing::info!(
                            product_id = %existing.id,
                            idempotency_key,
                            "Earlier create attempt landed; reusing its product"
                        );
                        return Ok(Some(existing));
                    }
                }
                self.external
                    .create(ctx, idempotency_key, fields)
                    .await
                    .map(Some)
            }
            Request::Update(id, fields) => self.external.update(ctx, id, fields).await.map(Some),
            Request::Delete(id) => self.external.delete(ctx, id).await.map(|()| None),
        }
    }

    /// `Initiated -> ExternalPending -> ExternalConfirmed | Failed`
    async fn run_external(
        &self,
        ctx: &AuthContext,
        request: &Request,
        record: &mut OperationRecord,
    ) -> Result<Option<ProductRecord>> {
        if let Some(id) = request.product_id() {
            self.mirror
                .mark_pending(id, PendingOperation::from(request.kind()))
                .await?;
        }
        record.state = OperationState::ExternalPending;
        record.updated_at = now_ms();
        self.operations.save(record).await?;

        let attempts = AtomicU32::new(record.attempts);
        let attempts_ref = &attempts;
        let snapshot = record.clone();
        let snapshot_ref = &snapshot;
        let operations = &self.operations;
        let key = snapshot.idempotency_key.as_str();

        let outcome = with_retry(
            &self.config.retry,
            self.config.external_timeout,
            move |attempt| async move {
                let total = snapshot_ref.attempts.saturating_add(attempt);
                attempts_ref.store(total, Ordering::SeqCst);
                let mut heartbeat = snapshot_ref.clone();
                heartbeat.attempts = total;
                heartbeat.updated_at = now_ms();
                if let Err(error) = operations.save(&heartbeat).await {
                    tracing::warn!(
                        idempotency_key = %heartbeat.idempotency_key,
                        error = %error,
                        "Failed to record external attempt"
                    );
                }
            },
            move || {
                let retrying = attempts_ref.load(Ordering::SeqCst) > 1;
                self.call_external(ctx, request, key, retrying)
            },
        )
        .await;

        record.attempts = attempts.load(Ordering::SeqCst);
        record.updated_at = now_ms();

        let error = match outcome {
            Ok(result) => {
                self.confirm_external(request, record, result.clone()).await;
                return Ok(result);
            }
            Err(error) => error,
        };

        if let Request::Delete(id) = request {
            if error.is_not_found() && self.mirror.get(id).await?.is_some() {
                tracing::info!(
                    product_id = %id,
                    "External product already absent; removing mirror row"
                );
                self.confirm_external(request, record, None).await;
                return Ok(None);
            }
        }

        let failure = if error.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        };
        tracing::warn!(
            operation = %request.kind(),
            idempotency_key = %record.idempotency_key,
            attempts = record.attempts,
            error = %error,
            "External write failed; mirror untouched"
        );
        record.state = OperationState::Failed(failure);
        record.error = Some(encode_failure(&error));
        self.operations.save(record).await?;
        if let Some(id) = request.product_id() {
            self.mirror
                .mark_pending(id, PendingOperation::None)
                .await?;
        }
        Err(error.into())
    }

    async fn confirm_external(
        &self,
        request: &Request,
        record: &mut OperationRecord,
        result: Option<ProductRecord>,
    ) {
        record.state = OperationState::ExternalConfirmed;
        record.product_id = result
            .as_ref()
            .map(|result| result.id.clone())
            .or_else(|| request.product_id().cloned());
        record.result = result;
        record.error = None;
        if let Err(error) = self.operations.save(record).await {
            tracing::warn!(
                idempotency_key = %record.idempotency_key,
                error = %error,
                "Failed to record external confirmation"
            );
        }
    }

    /// `ExternalConfirmed -> MirrorPending -> Committed`, or an orphan left
    /// in `ExternalConfirmed` for the sweep
    async fn commit(
        &self,
        kind: OperationKind,
        product_id: ProductId,
        result: Option<ProductRecord>,
        mut record: OperationRecord,
    ) -> OperationOutcome {
        record.state = OperationState::MirrorPending;
        record.updated_at = now_ms();
        self.save_quietly(&record).await;

        let write = match &result {
            Some(result) => self.converge(result).await,
            None => self.remove(&product_id).await,
        };

        let state = match write {
            Ok(write) => {
                if write == MirrorWrite::Skipped {
                    tracing::warn!(
                        product_id = %product_id,
                        "Mirror row is tombstoned; external result not applied"
                    );
                }
                if kind == OperationKind::Update {
                    if let Err(error) = self
                        .mirror
                        .mark_pending(&product_id, PendingOperation::None)
                        .await
                    {
                        tracing::warn!(product_id = %product_id, error = %error, "Failed to clear pending marker");
                    }
                }
                tracing::info!(
                    operation = %kind,
                    product_id = %product_id,
                    idempotency_key = %record.idempotency_key,
                    "Operation committed"
                );
                OperationState::Committed
            }
            Err(error) => {
                tracing::warn!(
                    operation = %kind,
                    product_id = %product_id,
                    idempotency_key = %record.idempotency_key,
                    error = %error,
                    "Orphan detected: external write confirmed but mirror write failed; queued for reconciliation sweep"
                );
                OperationState::ExternalConfirmed
            }
        };

        record.state = state;
        record.updated_at = now_ms();
        self.save_quietly(&record).await;

        OperationOutcome {
            idempotency_key: record.idempotency_key,
            product_id,
            record: result,
            state,
            replayed: false,
        }
    }

    async fn save_quietly(&self, record: &OperationRecord) {
        if let Err(error) = self.operations.save(record).await {
            tracing::warn!(
                idempotency_key = %record.idempotency_key,
                state = %record.state,
                error = %error,
                "Failed to persist operation state"
            );
        }
    }

    /// Make the mirror row match `record`, re-reading on version conflicts
    async fn converge(&self, record: &ProductRecord) -> Result<MirrorWrite> {
        let mut expected = 0;
        for _ in 0..self.config.conflict_retry_cap.max(1) {
            let entry = self.mirror.entry(&record.id).await?;
            expected = match &entry {
                Some(entry) if entry.is_deleted => return Ok(MirrorWrite::Skipped),
                Some(entry) if entry.record == *record => return Ok(MirrorWrite::Unchanged),
                Some(entry) => entry.sync.local_version,
                None => 0,
            };

            match self.mirror.put(record, expected).await {
                Ok(_) if expected == 0 => return Ok(MirrorWrite::Inserted),
                Ok(_) => return Ok(MirrorWrite::Refreshed),
                Err(error) if error.is_conflict() => {
                    tracing::debug!(product_id = %record.id, expected, "Mirror version conflict, re-reading");
                }
                Err(error) => return Err(error),
            }
        }

        Err(Error::Conflict {
            id: record.id.to_string(),
            expected,
        })
    }

    /// Tombstone the mirror row, re-reading on version conflicts
    async fn remove(&self, id: &ProductId) -> Result<MirrorWrite> {
        let mut expected = 0;
        for _ in 0..self.config.conflict_retry_cap.max(1) {
            expected = match self.mirror.entry(id).await? {
                Some(entry) if !entry.is_deleted => entry.sync.local_version,
                _ => return Ok(MirrorWrite::Unchanged),
            };

            match self.mirror.delete(id, expected).await {
                Ok(()) => return Ok(MirrorWrite::Removed),
                Err(error) if error.is_conflict() => {
                    tracing::debug!(product_id = %id, expected, "Mirror version conflict, re-reading");
                }
                Err(error) => return Err(error),
            }
        }

        Err(Error::Conflict {
            id: id.to_string(),
            expected,
        })
    }
}
