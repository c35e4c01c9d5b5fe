//! Per-repository storage quota.
//!
//! A write is vetoed when the repository directory is larger than the
//! configured ceiling.  The size is measured afresh on every check since the
//! writes being gated are what change it.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::config::{QuotaConfig, SizeProbe};

// ---------------------------------------------------------------------------
// QuotaGate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QuotaGate {
    /// Ceiling in bytes; a repository of exactly this size is within quota.
    pub max_bytes: u64,
    pub probe: SizeProbe,
}

impl QuotaGate {
    pub fn new(config: &QuotaConfig) -> Self {
        Self {
            max_bytes: config.max_repository_bytes,
            probe: config.probe,
        }
    }

    /// Return `true` when `repo_dir` is larger than [`Self::max_bytes`].
    #[instrument(skip(self), fields(repo = %repo_dir.display()))]
    pub async fn is_exceeded(&self, repo_dir: &Path) -> Result<bool> {
        let size = match self.probe {
            SizeProbe::Walk => repo_size_bytes(repo_dir).await?,
            SizeProbe::Du => du_size_bytes(repo_dir).await?,
        };

        let exceeded = size > self.max_bytes;
        if exceeded {
            info!(size, max = self.max_bytes, "repository quota exceeded");
        } else {
            debug!(size, max = self.max_bytes, "repository within quota");
        }
        Ok(exceeded)
    }
}

// ---------------------------------------------------------------------------
// In-process walk
// ---------------------------------------------------------------------------

/// Compute the total size (in bytes) of all files under `path` by
/// recursively walking the directory tree.
///
/// Symlinks are not followed; only regular file sizes are counted.  A missing
/// `path` measures 0; any other I/O failure is an error, never a short count.
pub async fn repo_size_bytes(path: &Path) -> Result<u64> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || dir_size_sync(&path))
        .await
        .context("blocking task panicked")?
        .context("failed to compute repository size")
}

fn dir_size_sync(dir: &Path) -> Result<u64> {
    match dir.symlink_metadata() {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("cannot stat {}", dir.display())),
    }

    let mut total: u64 = 0;
    let mut stack: Vec<PathBuf> = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("cannot list {}", current.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("cannot list {}", current.display()))?;
            let path = entry.path();
            let meta = match path.symlink_metadata() {
                Ok(meta) => meta,
                // Removed under us, e.g. by a concurrent repack.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("cannot stat {}", path.display())),
            };
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }

    Ok(total)
}

// ---------------------------------------------------------------------------
// `du -sh`
// ---------------------------------------------------------------------------

/// Measure `path` with `du -sh` and parse the human-readable total.
pub async fn du_size_bytes(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }

    let output = Command::new("du")
        .arg("-sh")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to spawn du")?;

    if !output.status.success() {
        bail!(
            "du failed (status {}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let field = stdout.split('\t').next().unwrap_or("").trim();
    parse_human_size(field).with_context(|| format!("unparseable du output: {stdout:?}"))
}

/// Parse a `du -h` style size such as `512`, `4.0K`, `7.5M` or `1G`.
///
/// Suffixes are binary multiples; a bare number or a `B` suffix is bytes.
pub fn parse_human_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (number, multiplier) = match s.chars().last()? {
        'B' | 'b' => (&s[..s.len() - 1], 1u64),
        'K' | 'k' => (&s[..s.len() - 1], 1 << 10),
        'M' | 'm' => (&s[..s.len() - 1], 1 << 20),
        'G' | 'g' => (&s[..s.len() - 1], 1 << 30),
        'T' | 't' => (&s[..s.len() - 1], 1 << 40),
        c if c.is_ascii_digit() => (s, 1),
        _ => return None,
    };
    let value: f64 = number.trim().replace(',', ".").parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CEILING: u64 = 10 * 1024 * 1024;

    fn gate() -> QuotaGate {
        QuotaGate {
            max_bytes: CEILING,
            probe: SizeProbe::Walk,
        }
    }

    fn write_zeros(path: &Path, len: u64) {
        let file = std::fs::File::create(path).unwrap();
        file.set_len(len).unwrap();
    }

    #[tokio::test]
    async fn half_ceiling_is_within_quota() {
        let tmp = tempfile::tempdir().unwrap();
        write_zeros(&tmp.path().join("a.bin"), CEILING / 2);
        assert!(!gate().is_exceeded(tmp.path()).await.unwrap());
    }

    #[tokio::test]
    async fn exactly_at_ceiling_is_within_quota() {
        let tmp = tempfile::tempdir().unwrap();
        write_zeros(&tmp.path().join("a.bin"), CEILING / 2);
        write_zeros(&tmp.path().join("b.bin"), CEILING / 2);
        assert!(!gate().is_exceeded(tmp.path()).await.unwrap());
    }

    #[tokio::test]
    async fn one_byte_over_ceiling_is_exceeded() {
        let tmp = tempfile::tempdir().unwrap();
        let objects = tmp.path().join("objects");
        std::fs::create_dir(&objects).unwrap();
        write_zeros(&tmp.path().join("a.bin"), CEILING / 2);
        write_zeros(&objects.join("b.bin"), CEILING / 2 + 1);
        assert!(gate().is_exceeded(tmp.path()).await.unwrap());
    }

    #[tokio::test]
    async fn every_check_measures_afresh() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate();
        write_zeros(&tmp.path().join("a.bin"), CEILING);
        assert!(!gate.is_exceeded(tmp.path()).await.unwrap());
        write_zeros(&tmp.path().join("b.bin"), 1);
        assert!(gate.is_exceeded(tmp.path()).await.unwrap());
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let size = repo_size_bytes(Path::new("/tmp/nonexistent_ledgergit_quota_test"))
            .await
            .unwrap();
        assert_eq!(size, 0);
        assert!(!gate()
            .is_exceeded(Path::new("/tmp/nonexistent_ledgergit_quota_test"))
            .await
            .unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_not_followed() {
        let outside = tempfile::tempdir().unwrap();
        write_zeros(&outside.path().join("big.pack"), CEILING * 2);

        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::os::unix::fs::symlink(outside.path().join("big.pack"), repo.path().join("linked.pack"))
            .unwrap();
        std::os::unix::fs::symlink(outside.path(), repo.path().join("alternates")).unwrap();

        assert_eq!(repo_size_bytes(repo.path()).await.unwrap(), 21);
        assert!(!gate().is_exceeded(repo.path()).await.unwrap());
    }

    #[tokio::test]
    async fn unreadable_repository_is_an_error_not_zero() {
        // A regular file where the repository directory should be cannot
        // be listed.
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        write_zeros(&repo, CEILING * 2);

        assert!(repo_size_bytes(&repo).await.is_err());
        assert!(gate().is_exceeded(&repo).await.is_err());
    }

    // ── du measurement ───────────────────────────────────────────────

    #[tokio::test]
    async fn du_measures_allocated_size() {
        let tmp = tempfile::tempdir().unwrap();
        // Incompressible, so filesystems that compress still allocate it.
        let mut state = 0x9e37_79b9_7f4a_7c15u64;
        let data: Vec<u8> = (0..256 * 1024)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        std::fs::write(tmp.path().join("pack"), data).unwrap();

        let size = du_size_bytes(tmp.path()).await.unwrap();
        assert!(size >= 256 * 1024, "du reported {size}");
        assert!(size < CEILING, "du reported {size}");

        let du = QuotaGate {
            max_bytes: 64 * 1024,
            probe: SizeProbe::Du,
        };
        assert!(du.is_exceeded(tmp.path()).await.unwrap());
    }

    #[tokio::test]
    async fn du_on_missing_directory_is_zero() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(du_size_bytes(&tmp.path().join("absent")).await.unwrap(), 0);
    }

    // ── du output parsing ────────────────────────────────────────────

    #[test]
    fn parses_bytes() {
        assert_eq!(parse_human_size("0"), Some(0));
        assert_eq!(parse_human_size("512"), Some(512));
        assert_eq!(parse_human_size("512B"), Some(512));
    }

    #[test]
    fn parses_binary_units() {
        assert_eq!(parse_human_size("4.0K"), Some(4096));
        assert_eq!(parse_human_size("10M"), Some(CEILING));
        assert_eq!(parse_human_size("7.5M"), Some(7 * 1024 * 1024 + 512 * 1024));
        assert_eq!(parse_human_size("1G"), Some(1 << 30));
        assert_eq!(parse_human_size("2T"), Some(2 << 40));
    }

    #[test]
    fn parses_locale_decimal_comma() {
        assert_eq!(parse_human_size("1,5K"), Some(1536));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_human_size(""), None);
        assert_eq!(parse_human_size("M"), None);
        assert_eq!(parse_human_size("12X"), None);
        assert_eq!(parse_human_size("du: cannot access"), None);
    }
}
