//! Local mirror of product records with optimistic concurrency

use std::sync::Arc;

use async_trait::async_trait;
use libsql::{params, Row, Value};

use super::Database;
use crate::error::{Error, Result};
use crate::models::{
    MirrorEntry, PendingOperation, Price, ProductId, ProductRecord, SyncState,
};

/// Durable product table keyed by product id.
///
/// `put` and `delete` take the local version the caller last read; a stale
/// version fails with [`Error::Conflict`] and the caller must re-read.
/// Version `0` means "no row yet".
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Live record by id; tombstones read as absent
    async fn get(&self, id: &ProductId) -> Result<Option<ProductRecord>>;

    /// Row with sync metadata, including tombstones
    async fn entry(&self, id: &ProductId) -> Result<Option<MirrorEntry>>;

    /// Live records ordered by id ascending
    async fn list(&self) -> Result<Vec<ProductRecord>>;

    /// Live rows with sync metadata, ordered by id ascending
    async fn list_entries(&self) -> Result<Vec<MirrorEntry>>;

    /// Insert or overwrite a record, returning the new local version
    async fn put(&self, record: &ProductRecord, expected_local_version: u64) -> Result<u64>;

    /// Tombstone a record
    async fn delete(&self, id: &ProductId, expected_local_version: u64) -> Result<()>;

    /// Stamp the in-flight operation marker without touching fields or version
    async fn mark_pending(&self, id: &ProductId, operation: PendingOperation) -> Result<()>;
}

/// libSQL implementation of `MirrorStore`
#[derive(Clone)]
pub struct LibSqlMirrorStore {
    db: Arc<Database>,
}

const SELECT_COLUMNS: &str = "SELECT id, title, description, price_cents, vendor, external_version, \
     local_version, pending_operation, is_deleted FROM products";

impl LibSqlMirrorStore {
    /// Create a new store over the given database
    pub const fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn parse_entry(row: &Row) -> Result<MirrorEntry> {
        let id: String = row.get(0)?;
        let external_version = match row.get_value(5)? {
            Value::Text(version) => Some(version),
            _ => None,
        };
        let local_version = u64::try_from(row.get::<i64>(6)?)
            .map_err(|_| Error::Database(format!("negative local_version for {id}")))?;
        let pending_operation = row
            .get::<String>(7)?
            .parse::<PendingOperation>()
            .map_err(Error::Database)?;

        Ok(MirrorEntry {
            record: ProductRecord {
                id: ProductId::new(id),
                title: row.get(1)?,
                description: row.get(2)?,
                price: Price::from_cents(row.get(3)?),
                vendor: row.get(4)?,
                external_version: external_version.clone(),
            },
            sync: SyncState {
                external_version,
                local_version,
                pending_operation,
            },
            is_deleted: row.get::<i64>(8)? != 0,
        })
    }

    async fn query_entries(&self, sql: &str) -> Result<Vec<MirrorEntry>> {
        let mut rows = self.db.connection().query(sql, ()).await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(Self::parse_entry(&row)?);
        }
        Ok(entries)
    }
}

fn sql_version(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| Error::Database(format!("version overflow: {version}")))
}

fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

#[async_trait]
impl MirrorStore for LibSqlMirrorStore {
    async fn get(&self, id: &ProductId) -> Result<Option<ProductRecord>> {
        Ok(self
            .entry(id)
            .await?
            .filter(|entry| !entry.is_deleted)
            .map(|entry| entry.record))
    }

    async fn entry(&self, id: &ProductId) -> Result<Option<MirrorEntry>> {
        let mut rows = self
            .db
            .connection()
            .query(&format!("{SELECT_COLUMNS} WHERE id = ?"), [id.as_str()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_entry(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<ProductRecord>> {
        Ok(self
            .list_entries()
            .await?
            .into_iter()
            .map(|entry| entry.record)
            .collect())
    }

    async fn list_entries(&self) -> Result<Vec<MirrorEntry>> {
        self.query_entries(&format!(
            "{SELECT_COLUMNS} WHERE is_deleted = 0 ORDER BY id ASC"
        ))
        .await
    }

    async fn put(&self, record: &ProductRecord, expected_local_version: u64) -> Result<u64> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.db.connection();

        let rows = if expected_local_version == 0 {
            conn.execute(
                "INSERT INTO products (
                    id, title, description, price_cents, vendor, external_version,
                    local_version, pending_operation, is_deleted, updated_at
                 ) VALUES (?, ?, ?, ?, ?, ?, 1, 'none', 0, ?)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    record.id.as_str(),
                    record.title.as_str(),
                    record.description.as_str(),
                    record.price.cents(),
                    record.vendor.as_str(),
                    optional_text(record.external_version.as_deref()),
                    now
                ],
            )
            .await?
        } else {
            conn.execute(
                "UPDATE products
                 SET title = ?, description = ?, price_cents = ?, vendor = ?,
                     external_version = ?, local_version = local_version + 1, updated_at = ?
                 WHERE id = ? AND local_version = ? AND is_deleted = 0",
                params![
                    record.title.as_str(),
                    record.description.as_str(),
                    record.price.cents(),
                    record.vendor.as_str(),
                    optional_text(record.external_version.as_deref()),
                    now,
                    record.id.as_str(),
                    sql_version(expected_local_version)?
                ],
            )
            .await?
        };

        if rows == 0 {
            return Err(Error::Conflict {
                id: record.id.to_string(),
                expected: expected_local_version,
            });
        }

        Ok(expected_local_version + 1)
    }

    async fn delete(&self, id: &ProductId, expected_local_version: u64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self
            .db
            .connection()
            .execute(
                "UPDATE products
                 SET is_deleted = 1, local_version = local_version + 1,
                     pending_operation = 'none', updated_at = ?
                 WHERE id = ? AND local_version = ? AND is_deleted = 0",
                params![now, id.as_str(), sql_version(expected_local_version)?],
            )
            .await?;

        if rows == 0 {
            return Err(Error::Conflict {
                id: id.to_string(),
                expected: expected_local_version,
            });
        }
        Ok(())
    }

    async fn mark_pending(&self, id: &ProductId, operation: PendingOperation) -> Result<()> {
        self.db
            .connection()
            .execute(
                "UPDATE products SET pending_operation = ? WHERE id = ? AND is_deleted = 0",
                [operation.as_str(), id.as_str()],
            )
            .await?;
        Ok(())
    }
}
