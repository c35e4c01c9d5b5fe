//! External permission authority.
//!
//! Provides the [`Authority`] trait that encapsulates all interaction with
//! the ledger hosting the permission registry.  The resolver dispatches
//! through this trait so that no RPC encoding or response parsing leaks
//! outside this module, and so tests can substitute an in-memory registry.

pub mod near;

use async_trait::async_trait;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use thiserror::Error;

use crate::auth::signature::PublicKey;
use crate::config::Config;
use crate::metrics::{AuthorityCallLabels, AuthorityMethod, CallResult};

/// The authority could not answer.  Never treated as "no permission".
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("authority request timed out")]
    Timeout,
    #[error("authority unreachable: {0}")]
    Transport(String),
    #[error("authority rejected query: {0}")]
    Rpc(String),
    #[error("unexpected authority response: {0}")]
    Decode(String),
}

/// Read-only view of the permission registry and account keys.
#[async_trait]
pub trait Authority: Send + Sync {
    /// Permission bitmask registered for `account_id` on repository `path`.
    async fn get_permission(&self, account_id: &str, path: &str) -> Result<u32, AuthorityError>;

    /// Every public key currently registered to `account_id`.
    async fn get_access_keys(&self, account_id: &str) -> Result<Vec<PublicKey>, AuthorityError>;

    /// Identity whose registry entry decides anonymous access.
    fn service_account(&self) -> &str;

    /// Cheap liveness probe used by the health check.
    async fn ping(&self) -> Result<(), AuthorityError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Call accounting
// ---------------------------------------------------------------------------

/// Wraps an [`Authority`] and counts calls by method and result.
pub struct MeteredAuthority {
    inner: Box<dyn Authority>,
    calls: Family<AuthorityCallLabels, Counter>,
}

impl MeteredAuthority {
    pub fn new(inner: Box<dyn Authority>, calls: Family<AuthorityCallLabels, Counter>) -> Self {
        Self { inner, calls }
    }

    fn record<T>(&self, method: AuthorityMethod, result: &Result<T, AuthorityError>) {
        let result = match result {
            Ok(_) => CallResult::Ok,
            Err(AuthorityError::Timeout) => CallResult::Timeout,
            Err(_) => CallResult::Error,
        };
        self.calls
            .get_or_create(&AuthorityCallLabels { method, result })
            .inc();
    }
}

#[async_trait]
impl Authority for MeteredAuthority {
    async fn get_permission(&self, account_id: &str, path: &str) -> Result<u32, AuthorityError> {
        let result = self.inner.get_permission(account_id, path).await;
        self.record(AuthorityMethod::GetPermission, &result);
        result
    }

    async fn get_access_keys(&self, account_id: &str) -> Result<Vec<PublicKey>, AuthorityError> {
        let result = self.inner.get_access_keys(account_id).await;
        self.record(AuthorityMethod::GetAccessKeys, &result);
        result
    }

    fn service_account(&self) -> &str {
        self.inner.service_account()
    }

    async fn ping(&self) -> Result<(), AuthorityError> {
        self.inner.ping().await
    }
}

/// Build the configured [`Authority`] implementation.
pub fn build_authority(config: &Config) -> anyhow::Result<Box<dyn Authority>> {
    Ok(Box::new(near::NearRpcAuthority::new(&config.authority)?))
}
