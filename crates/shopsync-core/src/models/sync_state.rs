//! Per-record sync metadata and per-operation state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::product::{ProductId, ProductRecord};

/// Kind of logical operation spanning both stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown operation kind: {other}")),
        }
    }
}

/// Operation in flight for a mirror row, cleared once both writes land
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOperation {
    #[default]
    None,
    Create,
    Update,
    Delete,
}

impl PendingOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl From<OperationKind> for PendingOperation {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Create => Self::Create,
            OperationKind::Update => Self::Update,
            OperationKind::Delete => Self::Delete,
        }
    }
}

impl FromStr for PendingOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown pending operation: {other}")),
        }
    }
}

/// Sync metadata kept alongside every mirror row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Version token last seen from the external resource
    pub external_version: Option<String>,
    /// Incremented on every successful mirror write; 0 means no row
    pub local_version: u64,
    pub pending_operation: PendingOperation,
}

/// A mirror row: the record plus its sync metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorEntry {
    pub record: ProductRecord,
    pub sync: SyncState,
    /// Tombstoned rows read as absent and reject further writes
    pub is_deleted: bool,
}

/// Why an operation stopped short of `Committed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retry budget exhausted; the same request may be retried later
    Transient,
    /// Rejected by validation or by the external resource; terminal
    Permanent,
}

/// Position of a logical operation in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Initiated,
    ExternalPending,
    ExternalConfirmed,
    MirrorPending,
    Committed,
    Failed(FailureKind),
}

impl OperationState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::ExternalPending => "external_pending",
            Self::ExternalConfirmed => "external_confirmed",
            Self::MirrorPending => "mirror_pending",
            Self::Committed => "committed",
            Self::Failed(FailureKind::Transient) => "failed_transient",
            Self::Failed(FailureKind::Permanent) => "failed_permanent",
        }
    }

    /// No further transitions happen from this state
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::Failed(FailureKind::Permanent)
        )
    }

    /// The external write succeeded but the mirror has not confirmed it
    pub const fn is_orphaned(self) -> bool {
        matches!(self, Self::ExternalConfirmed | Self::MirrorPending)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(Self::Initiated),
            "external_pending" => Ok(Self::ExternalPending),
            "external_confirmed" => Ok(Self::ExternalConfirmed),
            "mirror_pending" => Ok(Self::MirrorPending),
            "committed" => Ok(Self::Committed),
            "failed_transient" => Ok(Self::Failed(FailureKind::Transient)),
            "failed_permanent" => Ok(Self::Failed(FailureKind::Permanent)),
            other => Err(format!("unknown operation state: {other}")),
        }
    }
}

/// Durable record of one logical operation, keyed by idempotency key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub idempotency_key: String,
    pub kind: OperationKind,
    /// Target id; for creates, filled in once the external resource assigns it
    pub product_id: Option<ProductId>,
    /// Canonical encoding of the request, used to detect key reuse
    pub fingerprint: String,
    pub state: OperationState,
    /// Confirmed external result, stored once `ExternalConfirmed` is reached
    pub result: Option<ProductRecord>,
    pub error: Option<String>,
    pub attempts: u32,
    /// Unix ms
    pub created_at: i64,
    /// Unix ms, refreshed on every transition; doubles as the lease clock
    pub updated_at: i64,
}
