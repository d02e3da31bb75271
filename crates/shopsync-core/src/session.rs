//! Session lookup for external resource authorization

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::external::AuthContext;

/// Supplies the authorization context for each external call
#[async_trait]
pub trait SessionLoader: Send + Sync {
    async fn load_session(&self) -> Result<AuthContext>;
}

/// Session fixed at startup, e.g. an offline access token from configuration
#[derive(Debug, Clone)]
pub struct StaticSessionLoader {
    session: AuthContext,
}

impl StaticSessionLoader {
    pub const fn new(session: AuthContext) -> Self {
        Self { session }
    }
}

#[async_trait]
impl SessionLoader for StaticSessionLoader {
    async fn load_session(&self) -> Result<AuthContext> {
        if self.session.shop.trim().is_empty() || self.session.access_token.trim().is_empty() {
            return Err(Error::Session(
                "session is missing shop or access token".to_string(),
            ));
        }
        Ok(self.session.clone())
    }
}
