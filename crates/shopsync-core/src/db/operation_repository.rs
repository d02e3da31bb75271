//! Operation log: durable idempotency ledger for logical operations

use std::sync::Arc;

use async_trait::async_trait;
use libsql::{params, Row, Value};

use super::Database;
use crate::error::{Error, Result};
use crate::models::{OperationKind, OperationRecord, OperationState, ProductId, ProductRecord};

/// Storage for [`OperationRecord`]s keyed by idempotency key
#[async_trait]
pub trait OperationLog: Send + Sync {
    /// Look up an operation by idempotency key
    async fn get(&self, key: &str) -> Result<Option<OperationRecord>>;

    /// Insert a new operation; returns `false` if the key is already taken
    async fn claim(&self, record: &OperationRecord) -> Result<bool>;

    /// Persist the mutable columns of an existing operation
    async fn save(&self, record: &OperationRecord) -> Result<()>;

    /// Take over an operation whose lease expired, provided nobody touched it
    /// since `seen_updated_at`. Returns `false` if another worker won.
    async fn reclaim(&self, key: &str, seen_updated_at: i64, now: i64) -> Result<bool>;

    /// Operations whose external write landed but whose mirror write was
    /// never confirmed, last touched before `older_than` (unix ms)
    async fn list_orphaned(&self, older_than: i64) -> Result<Vec<OperationRecord>>;

    /// Delete settled operations last touched before `older_than` (unix ms)
    async fn prune(&self, older_than: i64) -> Result<u64>;
}

/// libSQL implementation of `OperationLog`
#[derive(Clone)]
pub struct LibSqlOperationLog {
    db: Arc<Database>,
}

const SELECT_COLUMNS: &str = "SELECT idempotency_key, kind, product_id, fingerprint, state, \
     result, error, attempts, created_at, updated_at FROM sync_operations";

impl LibSqlOperationLog {
    /// Create a new log over the given database
    pub const fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn parse_record(row: &Row) -> Result<OperationRecord> {
        let kind = row
            .get::<String>(1)?
            .parse::<OperationKind>()
            .map_err(Error::Database)?;
        let state = row
            .get::<String>(4)?
            .parse::<OperationState>()
            .map_err(Error::Database)?;
        let product_id = match row.get_value(2)? {
            Value::Text(id) => Some(ProductId::new(id)),
            _ => None,
        };
        let result = match row.get_value(5)? {
            Value::Text(json) => Some(serde_json::from_str::<ProductRecord>(&json)?),
            _ => None,
        };
        let error = match row.get_value(6)? {
            Value::Text(message) => Some(message),
            _ => None,
        };

        Ok(OperationRecord {
            idempotency_key: row.get(0)?,
            kind,
            product_id,
            fingerprint: row.get(3)?,
            state,
            result,
            error,
            attempts: u32::try_from(row.get::<i64>(7)?).unwrap_or(u32::MAX),
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

fn optional_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

fn encode_result(result: Option<&ProductRecord>) -> Result<Value> {
    Ok(match result {
        Some(record) => Value::Text(serde_json::to_string(record)?),
        None => Value::Null,
    })
}

#[async_trait]
impl OperationLog for LibSqlOperationLog {
    async fn get(&self, key: &str) -> Result<Option<OperationRecord>> {
        let mut rows = self
            .db
            .connection()
            .query(&format!("{SELECT_COLUMNS} WHERE idempotency_key = ?"), [key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn claim(&self, record: &OperationRecord) -> Result<bool> {
        let rows = self
            .db
            .connection()
            .execute(
                "INSERT INTO sync_operations (
                    idempotency_key, kind, product_id, fingerprint, state,
                    result, error, attempts, created_at, updated_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(idempotency_key) DO NOTHING",
                params![
                    record.idempotency_key.as_str(),
                    record.kind.as_str(),
                    optional_text(record.product_id.as_ref().map(ToString::to_string)),
                    record.fingerprint.as_str(),
                    record.state.as_str(),
                    encode_result(record.result.as_ref())?,
                    optional_text(record.error.clone()),
                    i64::from(record.attempts),
                    record.created_at,
                    record.updated_at
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn save(&self, record: &OperationRecord) -> Result<()> {
        let rows = self
            .db
            .connection()
            .execute(
                "UPDATE sync_operations
                 SET product_id = ?, state = ?, result = ?, error = ?, attempts = ?, updated_at = ?
                 WHERE idempotency_key = ?",
                params![
                    optional_text(record.product_id.as_ref().map(ToString::to_string)),
                    record.state.as_str(),
                    encode_result(record.result.as_ref())?,
                    optional_text(record.error.clone()),
                    i64::from(record.attempts),
                    record.updated_at,
                    record.idempotency_key.as_str()
                ],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(format!(
                "operation {}",
                record.idempotency_key
            )));
        }
        Ok(())
    }

    async fn reclaim(&self, key: &str, seen_updated_at: i64, now: i64) -> Result<bool> {
        let rows = self
            .db
            .connection()
            .execute(
                "UPDATE sync_operations SET updated_at = ?
                 WHERE idempotency_key = ? AND updated_at = ?",
                params![now, key, seen_updated_at],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn list_orphaned(&self, older_than: i64) -> Result<Vec<OperationRecord>> {
        let mut rows = self
            .db
            .connection()
            .query(
                &format!(
                    "{SELECT_COLUMNS}
                     WHERE state IN ('external_confirmed', 'mirror_pending') AND updated_at < ?
                     ORDER BY updated_at ASC"
                ),
                [older_than],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }

    async fn prune(&self, older_than: i64) -> Result<u64> {
        let rows = self
            .db
            .connection()
            .execute(
                "DELETE FROM sync_operations
                 WHERE state IN ('committed', 'failed_permanent', 'failed_transient')
                   AND updated_at < ?",
                [older_than],
            )
            .await?;
        Ok(rows)
    }
}
