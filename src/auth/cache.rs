//! In-process permission cache.
//!
//! Entries are keyed by the `(token, repository)` pair, rendered as
//! `"{token}_{repository}"` in logs, and expire 24 hours (the
//! token TTL) after the token's issue time, or after the moment of
//! resolution for results that carry no issue time (anonymous and denied
//! lookups).  Expiry is checked lazily on lookup; nothing sweeps the map.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use prometheus_client::metrics::counter::Counter;
use tracing::{debug, trace};

use crate::auth::middleware::ResolvedPermission;
use crate::auth::resolver::Clock;

#[derive(Debug, Clone)]
struct CacheEntry {
    permission: ResolvedPermission,
    stamp_millis: i64,
}

/// Memoises resolved permissions per `(token, repository)`.
///
/// Concurrent misses on the same key may both resolve; the last write wins.
/// The lock is never held across an await.
pub struct PermissionCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    clock: Arc<dyn Clock>,
    ttl_millis: i64,
    hits: Counter,
    misses: Counter,
}

/// Map key.  Kept as a pair so that `_` in either half cannot make two
/// distinct lookups collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    token: String,
    repository: String,
}

impl CacheKey {
    pub fn new(token: &str, repository: &str) -> Self {
        Self {
            token: token.to_owned(),
            repository: repository.to_owned(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.token, self.repository)
    }
}

impl PermissionCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            ttl_millis: ttl.as_millis() as i64,
            hits: Counter::default(),
            misses: Counter::default(),
        }
    }

    /// Report hits and misses into externally registered counters.
    pub fn with_counters(mut self, hits: Counter, misses: Counter) -> Self {
        self.hits = hits;
        self.misses = misses;
        self
    }

    /// Return the cached permission for `(token, repository)`, or run
    /// `resolve` and remember its result.
    ///
    /// Every successful result is stored, including zero-permission ones, so
    /// repeated denied requests do not reach the authority within the TTL.
    /// Errors are returned as-is and not cached.
    pub async fn get_or_resolve<F, Fut, E>(
        &self,
        repository: &str,
        token: &str,
        resolve: F,
    ) -> Result<ResolvedPermission, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ResolvedPermission, E>>,
    {
        let key = CacheKey::new(token, repository);

        if let Some(hit) = self.lookup(&key) {
            self.hits.inc();
            trace!(%repository, identity = %hit.identity, "permission cache hit");
            return Ok(hit);
        }
        self.misses.inc();

        let resolved = resolve().await?;
        let stamp_millis = resolved
            .issued_at_millis
            .unwrap_or_else(|| self.clock.now_millis());

        self.write().insert(
            key,
            CacheEntry {
                permission: resolved.clone(),
                stamp_millis,
            },
        );
        trace!(%repository, identity = %resolved.identity, "permission cached");
        Ok(resolved)
    }

    /// Fetch a live entry, evicting it if it has expired.
    fn lookup(&self, key: &CacheKey) -> Option<ResolvedPermission> {
        let now = self.clock.now_millis();
        let expired = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(key) {
                None => return None,
                Some(entry) if entry.stamp_millis.saturating_add(self.ttl_millis) >= now => {
                    return Some(entry.permission.clone());
                }
                Some(entry) => entry.permission.identity.clone(),
            }
        };

        debug!(identity = %expired, "cached permission expired");
        self.write().remove(key);
        None
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of entries currently held, expired or not.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[cfg(test)]
    pub fn contains(&self, token: &str, repository: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&CacheKey::new(token, repository))
    }
}
