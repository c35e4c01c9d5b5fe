//! HTTP layer for the gateway.
//!
//! This module provides the axum-based HTTP server that intercepts Git smart
//! HTTP protocol requests, asks the access gate for a decision, and streams
//! allowed requests through `git http-backend`.

pub mod handler;
