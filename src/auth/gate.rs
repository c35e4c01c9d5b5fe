//! Access decision for Git smart-HTTP requests.
//!
//! Combines the cached permission lookup with the operation being attempted
//! and, for writes, the repository quota.  The result says whether the git
//! process may run and which identity it runs as.

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::Uri;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::auth::cache::PermissionCache;
use crate::auth::middleware::Credential;
use crate::auth::resolver::{PermissionResolver, ResolveError};
use crate::authority::AuthorityError;
use crate::metrics::{DecisionLabels, Metrics, OperationLabel, Outcome};
use crate::quota::QuotaGate;

/// Kind of Git operation being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Fetch / clone (`git-upload-pack`).
    Read,
    /// Push (`git-receive-pack`).
    Write,
}

impl Operation {
    /// Classify a smart-HTTP request: receive-pack in the path or in the
    /// `service` query parameter is a write, anything else a read.
    pub fn from_uri(uri: &Uri) -> Self {
        let receive_in_query = uri
            .query()
            .map(|q| q.split('&').any(|kv| kv == "service=git-receive-pack"))
            .unwrap_or(false);
        if uri.path().ends_with("/git-receive-pack") || receive_in_query {
            Operation::Write
        } else {
            Operation::Read
        }
    }

    fn label(self) -> OperationLabel {
        match self {
            Operation::Read => OperationLabel::Read,
            Operation::Write => OperationLabel::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NoPermission,
    QuotaExceeded,
    InvalidToken,
}

impl DenyReason {
    /// Plain-text body returned to the client.
    pub fn message(self) -> &'static str {
        match self {
            DenyReason::NoPermission => "permission denied",
            DenyReason::QuotaExceeded => "repository quota exceeded",
            DenyReason::InvalidToken => "invalid token",
        }
    }

    fn outcome(self) -> Outcome {
        match self {
            DenyReason::NoPermission => Outcome::NoPermission,
            DenyReason::QuotaExceeded => Outcome::QuotaExceeded,
            DenyReason::InvalidToken => Outcome::InvalidToken,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow {
        /// Identity the git process runs as; `None` for read-only access.
        effective_identity: Option<String>,
    },
    Deny(DenyReason),
}

#[cfg(test)]
impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn effective_identity(&self) -> Option<&str> {
        match self {
            Decision::Allow { effective_identity } => effective_identity.as_deref(),
            Decision::Deny(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    AuthorityUnavailable(#[from] AuthorityError),
    #[error("quota measurement failed: {0:#}")]
    QuotaMeasurement(anyhow::Error),
}

// ---------------------------------------------------------------------------
// AccessGate
// ---------------------------------------------------------------------------

pub struct AccessGate {
    cache: Arc<PermissionCache>,
    resolver: PermissionResolver,
    quota: QuotaGate,
    project_root: PathBuf,
    metrics: Option<Arc<Metrics>>,
}

impl AccessGate {
    pub fn new(
        cache: Arc<PermissionCache>,
        resolver: PermissionResolver,
        quota: QuotaGate,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            resolver,
            quota,
            project_root: project_root.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decide whether `credential` may perform `operation` on `repository`.
    #[instrument(skip_all, fields(%repository, ?operation))]
    pub async fn authorize(
        &self,
        repository: &str,
        credential: &Credential,
        operation: Operation,
    ) -> Result<Decision, GateError> {
        let result = self.decide(repository, credential, operation).await;

        let outcome = match &result {
            Ok(Decision::Allow { .. }) => Outcome::Allowed,
            Ok(Decision::Deny(reason)) => reason.outcome(),
            Err(GateError::AuthorityUnavailable(_)) => Outcome::AuthorityUnavailable,
            Err(GateError::QuotaMeasurement(_)) => Outcome::Error,
        };
        if let Some(metrics) = &self.metrics {
            metrics
                .decisions
                .get_or_create(&DecisionLabels {
                    operation: operation.label(),
                    outcome,
                })
                .inc();
        }
        result
    }

    async fn decide(
        &self,
        repository: &str,
        credential: &Credential,
        operation: Operation,
    ) -> Result<Decision, GateError> {
        let Some(token) = credential.as_token() else {
            info!("unsupported authorization scheme");
            return Ok(Decision::Deny(DenyReason::InvalidToken));
        };

        let resolved = match self
            .cache
            .get_or_resolve(repository, token, || self.resolver.resolve(repository, token))
            .await
        {
            Ok(r) => r,
            Err(ResolveError::InvalidToken(e)) => {
                info!(error = %e, "rejecting malformed token");
                return Ok(Decision::Deny(DenyReason::InvalidToken));
            }
            Err(ResolveError::AuthorityUnavailable(e)) => {
                warn!(error = %e, "permission authority unavailable");
                return Err(e.into());
            }
        };

        let permission = resolved.permission;
        match operation {
            Operation::Read if permission.has_read() => {
                info!(identity = %resolved.identity, %permission, "read access granted");
                Ok(Decision::Allow {
                    effective_identity: None,
                })
            }
            Operation::Write if permission.has_write() => {
                if self.quota_exceeded(repository).await? {
                    info!(identity = %resolved.identity, "write denied: quota exceeded");
                    return Ok(Decision::Deny(DenyReason::QuotaExceeded));
                }
                info!(identity = %resolved.identity, %permission, "write access granted");
                Ok(Decision::Allow {
                    effective_identity: Some(resolved.identity),
                })
            }
            Operation::Read | Operation::Write => {
                info!(identity = %resolved.identity, %permission, "permission denied");
                Ok(Decision::Deny(DenyReason::NoPermission))
            }
        }
    }

    async fn quota_exceeded(&self, repository: &str) -> Result<bool, GateError> {
        let exceeded = self
            .quota
            .is_exceeded(&self.project_root.join(repository))
            .await
            .map_err(GateError::QuotaMeasurement)?;
        if let Some(metrics) = &self.metrics {
            metrics.quota_checks.inc();
            if exceeded {
                metrics.quota_exceeded.inc();
            }
        }
        Ok(exceeded)
    }
}
