//! Data models for shopsync

mod product;
mod sync_state;

pub use product::{Price, ProductFields, ProductId, ProductRecord};
pub use sync_state::{
    FailureKind, MirrorEntry, OperationKind, OperationRecord, OperationState, PendingOperation,
    SyncState,
};
