//! shopsync-core - Core library for shopsync
//!
//! This crate contains the product models, the local mirror store, the
//! external resource clients, and the reconciliation engine that keeps the
//! mirror consistent with the external resource.

pub mod db;
pub mod engine;
pub mod error;
pub mod external;
pub mod models;
pub mod session;

pub use engine::{EngineConfig, OperationOutcome, ReconciliationEngine, RetryPolicy, SweepReport};
pub use error::{Error, Result};
pub use models::{Price, ProductFields, ProductId, ProductRecord};
