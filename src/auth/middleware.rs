use std::fmt;

use axum::http::{header, HeaderMap, Uri};
use serde::{Deserialize, Serialize};

use crate::auth::token::ANONYMOUS;

/// Permission bitmask as stored in the registry contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionBits(pub u32);

impl PermissionBits {
    pub const NONE: Self = Self(0);
    pub const OWNER: Self = Self(0x01);
    pub const CONTRIBUTOR: Self = Self(0x02);
    pub const READER: Self = Self(0x04);
    /// Repository is open: anyone may read and registered users may write.
    pub const FREE: Self = Self(0x08);

    const WRITE_MASK: u32 = Self::OWNER.0 | Self::CONTRIBUTOR.0 | Self::FREE.0;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn has_write(self) -> bool {
        self.0 & Self::WRITE_MASK != 0
    }

    pub fn has_read(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PermissionBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Outcome of permission resolution for one `(token, repository)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPermission {
    /// Claimed (and, when bits are non-zero, verified) account, or `ANONYMOUS`.
    pub identity: String,
    pub permission: PermissionBits,
    /// Issue time of the token that produced this result, if it was verified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at_millis: Option<i64>,
}

impl ResolvedPermission {
    pub fn denied(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            permission: PermissionBits::NONE,
            issued_at_millis: None,
        }
    }
}

/// Credential presented with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    Bearer(String),
    /// An `Authorization` header that does not carry a bearer token.
    Unsupported,
}

impl Credential {
    /// Token string used for resolution and as the cache key prefix.
    pub fn as_token(&self) -> Option<&str> {
        match self {
            Credential::Anonymous => Some(ANONYMOUS),
            Credential::Bearer(token) => Some(token),
            Credential::Unsupported => None,
        }
    }
}

/// Read the credential from the `Authorization` header.
pub fn extract_credential(headers: &HeaderMap) -> Credential {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Credential::Anonymous;
    };
    match value.to_str().ok().and_then(|v| v.strip_prefix("Bearer ")) {
        Some(token) if !token.trim().is_empty() => Credential::Bearer(token.trim().to_owned()),
        _ => Credential::Unsupported,
    }
}

/// Whether the request targets a Git smart-HTTP upload or receive endpoint.
///
/// The marker may appear either in the path (`/git-upload-pack`) or in the
/// query (`info/refs?service=git-receive-pack`).
pub fn is_git_request(uri: &Uri) -> bool {
    let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("");
    target.contains("git-upload") || target.contains("git-receive")
}

/// Extract the repository name: the first path segment.
pub fn extract_repository(uri: &Uri) -> Option<String> {
    let repo = uri.path().trim_start_matches('/').split('/').next()?;
    if repo.is_empty() || repo == "." || repo == ".." {
        None
    } else {
        Some(repo.to_string())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    // ── PermissionBits ───────────────────────────────────────────────

    #[test]
    fn write_requires_owner_contributor_or_free() {
        assert!(PermissionBits::OWNER.has_write());
        assert!(PermissionBits::CONTRIBUTOR.has_write());
        assert!(PermissionBits::FREE.has_write());
        assert!(!PermissionBits::READER.has_write());
        assert!(!PermissionBits::NONE.has_write());
        assert!(PermissionBits(0x04 | 0x02).has_write());
    }

    #[test]
    fn read_requires_any_bit() {
        assert!(PermissionBits::READER.has_read());
        assert!(PermissionBits(0x10).has_read());
        assert!(!PermissionBits::NONE.has_read());
    }

    #[test]
    fn permission_serialises_as_integer() {
        let resolved = ResolvedPermission {
            identity: "alice.testnet".into(),
            permission: PermissionBits::CONTRIBUTOR,
            issued_at_millis: Some(5),
        };
        let json = serde_json::to_string(&resolved).unwrap();
        assert_eq!(
            json,
            r#"{"identity":"alice.testnet","permission":2,"issued_at_millis":5}"#
        );
        let denied = serde_json::to_string(&ResolvedPermission::denied("x")).unwrap();
        assert_eq!(denied, r#"{"identity":"x","permission":0}"#);
    }

    // ── Credential extraction ───────────────────────────────────────

    #[test]
    fn missing_header_is_anonymous() {
        let credential = extract_credential(&HeaderMap::new());
        assert_eq!(credential, Credential::Anonymous);
        assert_eq!(credential.as_token(), Some("ANONYMOUS"));
    }

    #[test]
    fn bearer_header_yields_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(
            extract_credential(&headers),
            Credential::Bearer("abc.def".into())
        );
    }

    #[test]
    fn basic_auth_is_unsupported() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        let credential = extract_credential(&headers);
        assert_eq!(credential, Credential::Unsupported);
        assert_eq!(credential.as_token(), None);
    }

    #[test]
    fn empty_bearer_is_unsupported() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_credential(&headers), Credential::Unsupported);
    }

    // ── Request classification ───────────────────────────────────────

    #[test]
    fn git_markers_in_path_and_query() {
        let upload: Uri = "/repo/git-upload-pack".parse().unwrap();
        let refs: Uri = "/repo/info/refs?service=git-receive-pack".parse().unwrap();
        let other: Uri = "/repo/HEAD".parse().unwrap();
        assert!(is_git_request(&upload));
        assert!(is_git_request(&refs));
        assert!(!is_git_request(&other));
    }

    #[test]
    fn repository_is_first_segment() {
        let uri: Uri = "/test/info/refs?service=git-upload-pack".parse().unwrap();
        assert_eq!(extract_repository(&uri).as_deref(), Some("test"));
        let uri: Uri = "/widgets.git/git-receive-pack".parse().unwrap();
        assert_eq!(extract_repository(&uri).as_deref(), Some("widgets.git"));
    }

    #[test]
    fn empty_or_traversal_repository_is_rejected() {
        for path in ["/", "/../git-upload-pack", "/./x"] {
            let uri: Uri = path.parse().unwrap();
            assert_eq!(extract_repository(&uri), None, "{path}");
        }
    }
}
