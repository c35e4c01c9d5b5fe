use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub git: GitConfig,
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:5000`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:5000".to_string()
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    /// Directory holding one bare repository per first-level entry.
    ///
    /// The `GIT_PROJECT_ROOT` environment variable takes precedence when set.
    pub project_root: PathBuf,
    /// Path or name of the `git` executable used for `http-backend`.
    #[serde(default = "default_git_binary")]
    pub binary: String,
}

fn default_git_binary() -> String {
    "git".to_string()
}

// ---------------------------------------------------------------------------
// External authority (permission registry contract)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorityConfig {
    /// JSON-RPC endpoint of the ledger node (e.g. `https://rpc.testnet.near.org`).
    pub rpc_url: String,
    /// Account hosting the permission registry contract.
    ///
    /// Also used as the service identity whose permission decides anonymous
    /// read access.
    pub contract_id: String,
    /// Per-request timeout for authority queries, in milliseconds.
    #[serde(default = "default_authority_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_authority_timeout_ms() -> u64 {
    10_000
}

// ---------------------------------------------------------------------------
// Token validation / permission cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Token lifetime and permission cache TTL in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// How far in the future a token's issue time may lie, in milliseconds.
    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl(),
            max_clock_skew_ms: default_max_clock_skew_ms(),
        }
    }
}

fn default_token_ttl() -> u64 {
    24 * 60 * 60
}

fn default_max_clock_skew_ms() -> u64 {
    1_000
}

// ---------------------------------------------------------------------------
// Storage quota
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Ceiling for a single repository's on-disk size in bytes.
    #[serde(default = "default_max_repository_bytes")]
    pub max_repository_bytes: u64,
    /// How the repository size is measured.
    #[serde(default)]
    pub probe: SizeProbe,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_repository_bytes: default_max_repository_bytes(),
            probe: SizeProbe::default(),
        }
    }
}

/// Directory size measurement strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeProbe {
    /// Sum regular file sizes by walking the tree in-process.
    #[default]
    Walk,
    /// Shell out to `du -sh` and parse its human-readable output.
    Du,
}

fn default_max_repository_bytes() -> u64 {
    10 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    if let Ok(root) = std::env::var("GIT_PROJECT_ROOT") {
        if !root.is_empty() {
            config.git.project_root = PathBuf::from(root);
        }
    }

    validate_config(&config)?;
    Ok(config)
}

pub(crate) fn parse_config(contents: &str) -> Result<Config> {
    Ok(serde_yaml::from_str(contents)?)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.auth.token_ttl_secs > 0,
        "auth.token_ttl_secs must be positive"
    );
    anyhow::ensure!(
        config.quota.max_repository_bytes > 0,
        "quota.max_repository_bytes must be positive"
    );
    anyhow::ensure!(
        !config.authority.contract_id.is_empty(),
        "authority.contract_id must not be empty"
    );
    anyhow::ensure!(
        config.authority.rpc_url.starts_with("http://")
            || config.authority.rpc_url.starts_with("https://"),
        "authority.rpc_url must be an http(s) URL"
    );
    Ok(())
}
