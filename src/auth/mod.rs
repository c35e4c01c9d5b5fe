//! Authentication and authorisation subsystem.
//!
//! Decodes signed bearer tokens, verifies them against the account's access
//! keys held by the ledger, resolves the registry permission mask for the
//! requested repository, and turns that into an allow/deny decision behind an
//! in-process cache.

pub mod cache;
pub mod gate;
pub mod middleware;
pub mod resolver;
pub mod signature;
pub mod token;
