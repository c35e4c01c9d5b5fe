//! External git process invocation.
//!
//! The gateway never speaks the Git protocol itself: allowed requests are
//! handed to a [`GitBackend`], which in production runs `git http-backend`
//! as a CGI process against the configured project root.

pub mod http_backend;

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;

/// The parts of an inbound request that the git process needs.
#[derive(Debug)]
pub struct GitRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Body,
    pub remote_addr: Option<SocketAddr>,
}

/// Runs a Git smart-HTTP exchange on behalf of an authorised request.
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Serve `request`, attributing it to `remote_user` when one is given.
    ///
    /// Read-only requests pass `None`, in which case pushes are refused by
    /// the git process itself.
    async fn serve(&self, request: GitRequest, remote_user: Option<&str>) -> Result<Response>;
}
