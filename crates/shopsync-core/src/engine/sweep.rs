//! Background reconciliation of mirror drift

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::{duration_ms, now_ms, with_retry, MirrorWrite, ReconciliationEngine};
use crate::error::Result;
use crate::external::AuthContext;
use crate::models::{MirrorEntry, OperationState, PendingOperation, ProductId, ProductRecord};

/// What one sweep changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// External records missing from the mirror
    pub inserted: u64,
    /// Mirror rows refreshed from a newer external record
    pub refreshed: u64,
    /// Mirror rows whose external record is confirmed gone
    pub tombstoned: u64,
    pub unchanged: u64,
    /// Records left alone: tombstoned rows, rows a live operation moved
    /// since the snapshot, failed writes, or absence that could not be confirmed
    pub skipped: u64,
    /// Orphaned operations whose product converged in this sweep
    pub operations_repaired: u64,
    /// Settled operations past retention
    pub operations_pruned: u64,
}

impl SweepReport {
    /// Nothing in either store was written
    pub const fn is_noop(&self) -> bool {
        self.inserted == 0
            && self.refreshed == 0
            && self.tombstoned == 0
            && self.operations_repaired == 0
            && self.operations_pruned == 0
    }

    fn record(&mut self, write: MirrorWrite) {
        match write {
            MirrorWrite::Inserted => self.inserted += 1,
            MirrorWrite::Refreshed => self.refreshed += 1,
            MirrorWrite::Removed => self.tombstoned += 1,
            MirrorWrite::Unchanged => self.unchanged += 1,
            MirrorWrite::Skipped => self.skipped += 1,
        }
    }
}

impl ReconciliationEngine {
    /// Converge the mirror on the external resource.
    ///
    /// The mirror is snapshotted before the external listing is taken, and
    /// every sweep write is guarded by the snapshot's local version. A row a
    /// live operation touched after the snapshot fails that guard and is left
    /// to the live writer, so an older listing never overwrites a newer row.
    /// A mirror row missing from the listing is only tombstoned after a
    /// direct lookup confirms the record is gone. Running it twice in a row
    /// changes nothing the second time.
    pub async fn sweep(&self, ctx: &AuthContext) -> Result<SweepReport> {
        let started = now_ms();
        let mut report = SweepReport::default();

        let mirror: BTreeMap<ProductId, MirrorEntry> = self
            .mirror
            .list_entries()
            .await?
            .into_iter()
            .map(|entry| (entry.record.id.clone(), entry))
            .collect();

        let external = with_retry(
            &self.config.retry,
            self.config.sweep_timeout,
            |_| async {},
            move || self.external.list(ctx),
        )
        .await?;

        let mut listed = BTreeSet::new();
        let mut converged = BTreeSet::new();
        for record in &external {
            listed.insert(record.id.clone());
            let write = self
                .apply_observed(&record.id, mirror.get(&record.id), Some(record))
                .await;
            if Self::tally(&mut report, &record.id, write) {
                converged.insert(record.id.clone());
            }
        }

        for (id, entry) in mirror.iter().filter(|(id, _)| !listed.contains(*id)) {
            let lookup = with_retry(
                &self.config.retry,
                self.config.external_timeout,
                |_| async {},
                move || self.external.get(ctx, id),
            )
            .await;

            let write = match lookup {
                Ok(record) => self.apply_observed(id, Some(entry), Some(&record)).await,
                Err(error) if error.is_not_found() => self.apply_observed(id, Some(entry), None).await,
                Err(error) => {
                    report.skipped += 1;
                    tracing::warn!(product_id = %id, error = %error, "Could not confirm external absence; keeping mirror row");
                    continue;
                }
            };
            if Self::tally(&mut report, id, write) {
                converged.insert(id.clone());
            }
        }

        // Neither store holds these ids, which is already agreement.
        let absent = |id: &ProductId| !listed.contains(id) && !mirror.contains_key(id);

        let lease_cutoff = started.saturating_sub(duration_ms(self.config.operation_lease));
        for mut operation in self.operations.list_orphaned(lease_cutoff).await? {
            let settled = operation
                .product_id
                .as_ref()
                .is_some_and(|id| converged.contains(id) || absent(id));
            if !settled {
                tracing::debug!(
                    idempotency_key = %operation.idempotency_key,
                    "Orphaned operation not converged by this sweep; leaving it open"
                );
                continue;
            }
            operation.state = OperationState::Committed;
            operation.updated_at = now_ms();
            self.operations.save(&operation).await?;
            report.operations_repaired += 1;
            tracing::info!(
                idempotency_key = %operation.idempotency_key,
                operation = %operation.kind,
                "Orphaned operation settled by sweep"
            );
        }

        let retention_cutoff = now_ms().saturating_sub(duration_ms(self.config.operation_retention));
        report.operations_pruned = self.operations.prune(retention_cutoff).await?;

        if report.is_noop() {
            tracing::debug!(unchanged = report.unchanged, skipped = report.skipped, "Sweep found no drift");
        } else {
            tracing::info!(
                inserted = report.inserted,
                refreshed = report.refreshed,
                tombstoned = report.tombstoned,
                skipped = report.skipped,
                operations_repaired = report.operations_repaired,
                operations_pruned = report.operations_pruned,
                "Sweep reconciled mirror drift"
            );
        }

        Ok(report)
    }

    /// Count one sweep write; true when the row now agrees with the
    /// external resource
    fn tally(report: &mut SweepReport, id: &ProductId, write: Result<MirrorWrite>) -> bool {
        match write {
            Ok(write) => {
                report.record(write);
                write != MirrorWrite::Skipped
            }
            Err(error) => {
                report.skipped += 1;
                tracing::warn!(product_id = %id, error = %error, "Sweep could not converge mirror row");
                false
            }
        }
    }

    /// Write one external observation (`None` for confirmed absence) over
    /// the row as it was snapshotted. Exactly one guarded write is tried; a
    /// conflict means the row moved since the snapshot and it is skipped.
    async fn apply_observed(
        &self,
        id: &ProductId,
        snapshot: Option<&MirrorEntry>,
        observed: Option<&ProductRecord>,
    ) -> Result<MirrorWrite> {
        let expected = snapshot.map_or(0, |entry| entry.sync.local_version);
        let write = match (observed, snapshot) {
            (Some(record), Some(entry)) if entry.record == *record => MirrorWrite::Unchanged,
            (Some(record), _) => match self.mirror.put(record, expected).await {
                Ok(_) if expected == 0 => MirrorWrite::Inserted,
                Ok(_) => MirrorWrite::Refreshed,
                Err(error) if error.is_conflict() => MirrorWrite::Skipped,
                Err(error) => return Err(error),
            },
            (None, Some(_)) => match self.mirror.delete(id, expected).await {
                Ok(()) => return Ok(MirrorWrite::Removed),
                Err(error) if error.is_conflict() => MirrorWrite::Skipped,
                Err(error) => return Err(error),
            },
            (None, None) => MirrorWrite::Unchanged,
        };

        if write == MirrorWrite::Skipped {
            tracing::debug!(product_id = %id, expected, "Mirror row moved or is tombstoned; sweep left it alone");
            return Ok(write);
        }

        // The row matches the external record, so any leftover marker is stale.
        if snapshot.is_some_and(|entry| entry.sync.pending_operation != PendingOperation::None) {
            self.mirror.mark_pending(id, PendingOperation::None).await?;
        }
        Ok(write)
    }
}
