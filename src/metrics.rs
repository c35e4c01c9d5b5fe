use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    pub operation: OperationLabel,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum OperationLabel {
    Read,
    Write,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Allowed,
    NoPermission,
    QuotaExceeded,
    InvalidToken,
    AuthorityUnavailable,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthorityCallLabels {
    pub method: AuthorityMethod,
    pub result: CallResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AuthorityMethod {
    GetPermission,
    GetAccessKeys,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CallResult {
    Ok,
    Timeout,
    Error,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the gateway.
pub struct Metrics {
    // -- permission cache --
    pub permission_cache_hits: Counter,
    pub permission_cache_misses: Counter,

    // -- authority --
    pub authority_calls: Family<AuthorityCallLabels, Counter>,

    // -- access decisions --
    pub decisions: Family<DecisionLabels, Counter>,

    // -- quota --
    pub quota_checks: Counter,
    pub quota_exceeded: Counter,

    // -- git --
    pub git_backend_failures: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let permission_cache_hits = Counter::default();
        registry.register(
            "ledgergit_permission_cache_hits",
            "Permission lookups served from the cache",
            permission_cache_hits.clone(),
        );

        let permission_cache_misses = Counter::default();
        registry.register(
            "ledgergit_permission_cache_misses",
            "Permission lookups resolved against the authority",
            permission_cache_misses.clone(),
        );

        let authority_calls = Family::<AuthorityCallLabels, Counter>::default();
        registry.register(
            "ledgergit_authority_calls",
            "Authority queries by method and result",
            authority_calls.clone(),
        );

        let decisions = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "ledgergit_access_decisions",
            "Access decisions by operation and outcome",
            decisions.clone(),
        );

        let quota_checks = Counter::default();
        registry.register(
            "ledgergit_quota_checks",
            "Repository size measurements on the write path",
            quota_checks.clone(),
        );

        let quota_exceeded = Counter::default();
        registry.register(
            "ledgergit_quota_exceeded",
            "Writes vetoed because the repository exceeded its quota",
            quota_exceeded.clone(),
        );

        let git_backend_failures = Counter::default();
        registry.register(
            "ledgergit_git_backend_failures",
            "git http-backend invocations that failed before responding",
            git_backend_failures.clone(),
        );

        Self {
            permission_cache_hits,
            permission_cache_misses,
            authority_calls,
            decisions,
            quota_checks,
            quota_exceeded,
            git_backend_failures,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_are_encoded() {
        let registry = MetricsRegistry::new();
        registry.metrics.permission_cache_hits.inc();
        registry
            .metrics
            .decisions
            .get_or_create(&DecisionLabels {
                operation: OperationLabel::Write,
                outcome: Outcome::QuotaExceeded,
            })
            .inc();

        let text = registry.encode().unwrap();
        assert!(text.contains("ledgergit_permission_cache_hits_total 1"));
        assert!(text.contains("operation=\"Write\""));
        assert!(text.contains("outcome=\"QuotaExceeded\""));
        assert!(text.ends_with("# EOF\n"));
    }
}
