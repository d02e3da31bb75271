//! Database layer for shopsync

mod connection;
mod migrations;
mod mirror_repository;
mod operation_repository;

pub use connection::Database;
pub use mirror_repository::{LibSqlMirrorStore, MirrorStore};
pub use operation_repository::{LibSqlOperationLog, OperationLog};
