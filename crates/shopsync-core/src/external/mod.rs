//! Client side of the authoritative external product store.
//!
//! The client is pure transport: callers validate input, and every call
//! carries its own [`AuthContext`] rather than reading shared session state.

mod memory;
mod shopify;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ProductFields, ProductId, ProductRecord};

pub use memory::InMemoryExternal;
pub use shopify::ShopifyRestClient;

/// Per-call authorization for the external resource
#[derive(Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub shop: String,
    pub access_token: String,
}

impl AuthContext {
    pub fn new(shop: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            shop: shop.into(),
            access_token: access_token.into(),
        }
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthContext")
            .field("shop", &self.shop)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Whether a failed external call may succeed if repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalErrorKind {
    /// Timeout, connection failure, rate limit, or 5xx
    Transient,
    /// Rejected input, missing resource, or bad credentials
    Permanent,
}

impl fmt::Display for ExternalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// Failure reported by an [`ExternalResourceClient`]
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("External resource {kind} error: {message}")]
pub struct ExternalError {
    pub kind: ExternalErrorKind,
    /// HTTP status when the failure came from a response
    pub status: Option<u16>,
    pub message: String,
}

impl ExternalError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ExternalErrorKind::Transient,
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ExternalErrorKind::Permanent,
            status: None,
            message: message.into(),
        }
    }

    pub fn not_found(id: &ProductId) -> Self {
        Self {
            kind: ExternalErrorKind::Permanent,
            status: Some(404),
            message: format!("product {id} not found"),
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            408 | 429 | 500..=599 => ExternalErrorKind::Transient,
            _ => ExternalErrorKind::Permanent,
        };
        Self {
            kind,
            status: Some(status),
            message: message.into(),
        }
    }

    pub const fn is_transient(&self) -> bool {
        matches!(self.kind, ExternalErrorKind::Transient)
    }

    /// The resource is confirmed absent, as opposed to merely unreachable
    pub const fn is_not_found(&self) -> bool {
        matches!(self.status, Some(404 | 410))
    }
}

/// Authoritative store for product records
#[async_trait]
pub trait ExternalResourceClient: Send + Sync {
    /// Create a product; the store assigns its id. The idempotency key is
    /// recorded on the product so [`Self::find_created`] can locate it.
    async fn create(
        &self,
        ctx: &AuthContext,
        idempotency_key: &str,
        fields: &ProductFields,
    ) -> Result<ProductRecord, ExternalError>;

    /// The product an earlier `create` with this key stored, if it landed.
    ///
    /// A create whose response was lost may still have been applied; this is
    /// checked before the create is sent again.
    async fn find_created(
        &self,
        ctx: &AuthContext,
        idempotency_key: &str,
    ) -> Result<Option<ProductRecord>, ExternalError>;

    async fn update(
        &self,
        ctx: &AuthContext,
        id: &ProductId,
        fields: &ProductFields,
    ) -> Result<ProductRecord, ExternalError>;

    async fn delete(&self, ctx: &AuthContext, id: &ProductId) -> Result<(), ExternalError>;

    async fn get(&self, ctx: &AuthContext, id: &ProductId) -> Result<ProductRecord, ExternalError>;

    /// Every product in the store
    async fn list(&self, ctx: &AuthContext) -> Result<Vec<ProductRecord>, ExternalError>;
}
