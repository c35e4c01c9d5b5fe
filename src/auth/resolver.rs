//! Permission resolution against the external authority.
//!
//! Turns a `(repository, token)` pair into a [`ResolvedPermission`]:
//!
//! 1. `ANONYMOUS` gets `READER` iff the service account's mask on the
//!    repository is exactly `FREE`.
//! 2. Bearer tokens are decoded, checked for expiry and future issue times,
//!    signature-verified against the claimed account's access keys, and only
//!    then looked up in the registry.
//!
//! Expired, future-dated and badly signed tokens resolve to permission `0`;
//! only a malformed token or an unreachable authority is an error.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::auth::middleware::{PermissionBits, ResolvedPermission};
use crate::auth::signature;
use crate::auth::token::{self, TokenError, ANONYMOUS};
use crate::authority::{Authority, AuthorityError};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid token: {0}")]
    InvalidToken(#[from] TokenError),
    #[error(transparent)]
    AuthorityUnavailable(#[from] AuthorityError),
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PermissionResolver {
    authority: Arc<dyn Authority>,
    clock: Arc<dyn Clock>,
    ttl_millis: i64,
    max_skew_millis: i64,
}

impl PermissionResolver {
    pub fn new(
        authority: Arc<dyn Authority>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        max_skew: Duration,
    ) -> Self {
        Self {
            authority,
            clock,
            ttl_millis: ttl.as_millis() as i64,
            max_skew_millis: max_skew.as_millis() as i64,
        }
    }

    /// Resolve the permission `token` grants on `repository`.
    #[instrument(skip_all, fields(%repository))]
    pub async fn resolve(
        &self,
        repository: &str,
        token: &str,
    ) -> Result<ResolvedPermission, ResolveError> {
        if token == ANONYMOUS {
            return self.resolve_anonymous(repository).await;
        }

        let decoded = token::decode(token)?;
        let identity = decoded.claims.account_id.as_str();
        let issued_at = decoded.claims.iat;

        let now = self.clock.now_millis();
        if issued_at.saturating_add(self.ttl_millis) < now {
            info!(%identity, issued_at, "token has expired");
            return Ok(ResolvedPermission::denied(identity));
        }
        if issued_at > now.saturating_add(self.max_skew_millis) {
            info!(%identity, issued_at, now, "token issued in the future");
            return Ok(ResolvedPermission::denied(identity));
        }

        let keys = self.authority.get_access_keys(identity).await?;
        let Some(key) = signature::verify(&decoded.payload_segment, &decoded.signature, &keys)
        else {
            info!(%identity, keys = keys.len(), "no access key matches token signature");
            return Ok(ResolvedPermission::denied(identity));
        };
        debug!(%identity, %key, "token signature verified");

        let mask = self.authority.get_permission(identity, repository).await?;
        let permission = PermissionBits(mask);
        info!(%identity, %permission, "permission resolved");

        Ok(ResolvedPermission {
            identity: identity.to_owned(),
            permission,
            issued_at_millis: Some(issued_at),
        })
    }

    async fn resolve_anonymous(&self, repository: &str) -> Result<ResolvedPermission, ResolveError> {
        let service = self.authority.service_account();
        let mask = PermissionBits(self.authority.get_permission(service, repository).await?);

        // Exact match only: a FREE repository with additional bits set does
        // not open anonymous reads.
        if mask == PermissionBits::FREE {
            info!("anonymous read granted");
            Ok(ResolvedPermission {
                identity: ANONYMOUS.to_owned(),
                permission: PermissionBits::READER,
                issued_at_millis: None,
            })
        } else {
            info!(%mask, "no anonymous access");
            Ok(ResolvedPermission::denied(ANONYMOUS))
        }
    }
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::auth::signature::PublicKey;

    pub const SERVICE: &str = "acl.testnet";

    pub struct ManualClock(AtomicI64);

    impl ManualClock {
        pub fn new(now: i64) -> Arc<Self> {
            Arc::new(Self(AtomicI64::new(now)))
        }

        pub fn advance(&self, millis: i64) {
            self.0.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// In-memory registry with call counters.
    #[derive(Default)]
    pub struct StubAuthority {
        permissions: Mutex<HashMap<(String, String), u32>>,
        keys: Mutex<HashMap<String, Vec<PublicKey>>>,
        pub offline: AtomicBool,
        pub permission_calls: AtomicUsize,
        pub key_calls: AtomicUsize,
    }

    impl StubAuthority {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn set_permission(&self, account: &str, path: &str, mask: u32) {
            self.permissions
                .lock()
                .unwrap()
                .insert((account.to_owned(), path.to_owned()), mask);
        }

        pub fn add_key(&self, account: &str, key: PublicKey) {
            self.keys
                .lock()
                .unwrap()
                .entry(account.to_owned())
                .or_default()
                .push(key);
        }

        pub fn calls(&self) -> usize {
            self.permission_calls.load(Ordering::SeqCst) + self.key_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authority for StubAuthority {
        async fn get_permission(&self, account_id: &str, path: &str) -> Result<u32, AuthorityError> {
            self.permission_calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(AuthorityError::Timeout);
            }
            Ok(self
                .permissions
                .lock()
                .unwrap()
                .get(&(account_id.to_owned(), path.to_owned()))
                .copied()
                .unwrap_or(0))
        }

        async fn get_access_keys(&self, account_id: &str) -> Result<Vec<PublicKey>, AuthorityError> {
            self.key_calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(AuthorityError::Transport("connection refused".into()));
            }
            Ok(self
                .keys
                .lock()
                .unwrap()
                .get(account_id)
                .cloned()
                .unwrap_or_default())
        }

        fn service_account(&self) -> &str {
            SERVICE
        }

        async fn ping(&self) -> Result<(), AuthorityError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(AuthorityError::Transport("connection refused".into()));
            }
            Ok(())
        }
    }

    pub const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

    pub fn resolver(authority: Arc<StubAuthority>, clock: Arc<ManualClock>) -> PermissionResolver {
        PermissionResolver::new(
            authority,
            clock,
            Duration::from_millis(DAY_MILLIS as u64),
            Duration::from_millis(1_000),
        )
    }
}
