//! `git http-backend` CGI bridge.
//!
//! Each allowed request spawns one `git http-backend` process.  The request
//! body is streamed to its stdin by a helper task, the CGI header block is
//! parsed from stdout, and the rest of stdout becomes the response body
//! without buffering.  The child is created with `kill_on_drop` and reaped by
//! a background task, so an aborted client cannot leak processes.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, instrument, warn};

use super::{GitBackend, GitRequest};
use crate::config::GitConfig;

/// Upper bound on the size of the CGI header block.
const MAX_HEAD_BYTES: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Backend struct
// ---------------------------------------------------------------------------

pub struct HttpBackend {
    binary: String,
    project_root: PathBuf,
}

impl HttpBackend {
    pub fn new(config: &GitConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            project_root: config.project_root.clone(),
        }
    }

    /// CGI environment for one request.
    fn cgi_env(&self, request: &GitRequest, remote_user: Option<&str>) -> Vec<(String, String)> {
        let mut env = vec![
            (
                "GIT_PROJECT_ROOT".to_string(),
                self.project_root.display().to_string(),
            ),
            ("GIT_HTTP_EXPORT_ALL".to_string(), "1".to_string()),
            ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
            ("REQUEST_METHOD".to_string(), request.method.to_string()),
            ("PATH_INFO".to_string(), request.uri.path().to_string()),
            (
                "QUERY_STRING".to_string(),
                request.uri.query().unwrap_or("").to_string(),
            ),
        ];

        let forwarded = [
            ("content-type", "CONTENT_TYPE"),
            ("content-length", "CONTENT_LENGTH"),
            ("content-encoding", "HTTP_CONTENT_ENCODING"),
            ("git-protocol", "GIT_PROTOCOL"),
        ];
        for (name, var) in forwarded {
            if let Some(v) = request.headers.get(name).and_then(|v| v.to_str().ok()) {
                env.push((var.to_string(), v.to_string()));
            }
        }

        if let Some(addr) = request.remote_addr {
            env.push(("REMOTE_ADDR".to_string(), addr.ip().to_string()));
        }
        if let Some(user) = remote_user {
            env.push(("REMOTE_USER".to_string(), user.to_string()));
        }
        env
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl GitBackend for HttpBackend {
    #[instrument(skip_all, fields(method = %request.method, path = %request.uri.path(), remote_user = ?remote_user))]
    async fn serve(&self, request: GitRequest, remote_user: Option<&str>) -> Result<Response> {
        let env = self.cgi_env(&request, remote_user);

        let mut cmd = Command::new(&self.binary);
        cmd.arg("http-backend");
        cmd.current_dir(&self.project_root);
        for (k, v) in &env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().context("failed to spawn git http-backend")?;

        // Feed the request body; dropping stdin signals EOF.
        let mut stdin = child
            .stdin
            .take()
            .context("failed to capture git http-backend stdin")?;
        let mut body = request.body.into_data_stream();
        tokio::spawn(async move {
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(error = %e, "request body aborted");
                        return;
                    }
                };
                if let Err(e) = stdin.write_all(&chunk).await {
                    debug!(error = %e, "git http-backend closed stdin early");
                    return;
                }
            }
            let _ = stdin.shutdown().await;
        });

        let stdout = child
            .stdout
            .take()
            .context("failed to capture git http-backend stdout")?;
        let mut reader = BufReader::new(stdout);

        // Reap the child in the background so we don't leak processes.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    warn!(%status, "git http-backend exited with non-zero status");
                }
                Err(e) => {
                    error!(error = %e, "failed to wait on git http-backend");
                }
                _ => {}
            }
        });

        let head = read_cgi_head(&mut reader).await?;
        debug!(status = %head.status, "git http-backend responded");

        let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
        *response.status_mut() = head.status;
        response.headers_mut().extend(head.headers);
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// CGI response head
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CgiHead {
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

/// Read CGI response headers up to and including the blank separator line.
pub async fn read_cgi_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<CgiHead> {
    let mut status = StatusCode::OK;
    let mut headers = Vec::new();
    let mut consumed = 0usize;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .context("failed to read git http-backend headers")?;
        if n == 0 {
            bail!("git http-backend closed stdout before end of headers");
        }
        consumed += n;
        if consumed > MAX_HEAD_BYTES {
            bail!("git http-backend header block too large");
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        let Some((name, value)) = trimmed.split_once(':') else {
            warn!(line = %trimmed, "ignoring malformed CGI header");
            continue;
        };
        let value = value.trim();

        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next().unwrap_or("");
            status = code
                .parse::<u16>()
                .ok()
                .and_then(|c| StatusCode::from_u16(c).ok())
                .with_context(|| format!("invalid CGI status: {value}"))?;
            continue;
        }

        match (HeaderName::from_bytes(name.trim().as_bytes()), HeaderValue::from_str(value)) {
            (Ok(n), Ok(v)) => headers.push((n, v)),
            _ => warn!(line = %trimmed, "ignoring invalid CGI header"),
        }
    }

    Ok(CgiHead { status, headers })
}

#[cfg(test)]
mod tests {
    use axum::http::{header, HeaderMap, Method, Uri};
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn parses_status_and_headers() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\nExpires: Fri, 01 Jan 1980 00:00:00 GMT\r\n\r\nRepository not exported.";
        let mut reader = &raw[..];
        let head = read_cgi_head(&mut reader).await.unwrap();
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert_eq!(head.headers.len(), 2);
        assert_eq!(head.headers[0].0, header::CONTENT_TYPE);
        assert_eq!(head.headers[0].1, "text/plain");

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "Repository not exported.");
    }

    #[tokio::test]
    async fn missing_status_defaults_to_ok() {
        let raw = b"Content-Type: application/x-git-upload-pack-advertisement\n\n001e# service=git-upload-pack\n";
        let mut reader = &raw[..];
        let head = read_cgi_head(&mut reader).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(
            head.headers[0].1,
            "application/x-git-upload-pack-advertisement"
        );
    }

    #[tokio::test]
    async fn truncated_head_is_an_error() {
        let raw = b"Content-Type: text/plain\r\n";
        let mut reader = &raw[..];
        assert!(read_cgi_head(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn invalid_status_is_an_error() {
        let raw = b"Status: abc\r\n\r\n";
        let mut reader = &raw[..];
        assert!(read_cgi_head(&mut reader).await.is_err());
    }

    #[test]
    fn cgi_env_carries_identity_only_when_given() {
        let backend = HttpBackend {
            binary: "git".into(),
            project_root: PathBuf::from("/srv/git"),
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/x-git-receive-pack-request"));
        headers.insert("git-protocol", HeaderValue::from_static("version=2"));
        let request = GitRequest {
            method: Method::POST,
            uri: "/repo/git-receive-pack".parse::<Uri>().unwrap(),
            headers,
            body: Body::empty(),
            remote_addr: None,
        };

        let env = backend.cgi_env(&request, Some("alice.testnet"));
        let get = |k: &str| env.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get("GIT_PROJECT_ROOT"), Some("/srv/git"));
        assert_eq!(get("GIT_HTTP_EXPORT_ALL"), Some("1"));
        assert_eq!(get("REQUEST_METHOD"), Some("POST"));
        assert_eq!(get("PATH_INFO"), Some("/repo/git-receive-pack"));
        assert_eq!(get("QUERY_STRING"), Some(""));
        assert_eq!(get("CONTENT_TYPE"), Some("application/x-git-receive-pack-request"));
        assert_eq!(get("GIT_PROTOCOL"), Some("version=2"));
        assert_eq!(get("REMOTE_USER"), Some("alice.testnet"));

        let anonymous = backend.cgi_env(&request, None);
        assert!(!anonymous.iter().any(|(n, _)| n == "REMOTE_USER"));
    }

    // ── process exchange ─────────────────────────────────────────────
    //
    // `sh` stands in for git: it is invoked as `sh http-backend` in the
    // project root, so the script below plays the CGI program.

    fn scripted_backend(script: &str) -> (HttpBackend, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("http-backend"), script).unwrap();
        let backend = HttpBackend {
            binary: "sh".into(),
            project_root: root.path().to_path_buf(),
        };
        (backend, root)
    }

    fn push(body: &'static str) -> GitRequest {
        GitRequest {
            method: Method::POST,
            uri: "/repo/git-receive-pack".parse::<Uri>().unwrap(),
            headers: HeaderMap::new(),
            body: Body::from(body),
            remote_addr: None,
        }
    }

    #[tokio::test]
    async fn serve_streams_process_output_after_head() {
        let (backend, _root) = scripted_backend(
            "printf 'Status: 201 Created\\r\\nContent-Type: text/plain\\r\\n\\r\\n'\n\
             printf '%s\\n' \"$REMOTE_USER\"\n\
             cat\n",
        );

        let response = backend.serve(push("hello"), Some("alice.testnet")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"alice.testnet\nhello");
    }

    #[tokio::test]
    async fn serve_fails_when_process_exits_before_head() {
        let (backend, _root) = scripted_backend("echo 'fatal: not a git repository' >&2\nexit 128\n");
        assert!(backend.serve(push(""), None).await.is_err());
    }

    #[tokio::test]
    async fn serve_fails_when_binary_is_missing() {
        let root = tempfile::tempdir().unwrap();
        let backend = HttpBackend {
            binary: root.path().join("no-such-git").display().to_string(),
            project_root: root.path().to_path_buf(),
        };
        assert!(backend.serve(push(""), None).await.is_err());
    }
}
