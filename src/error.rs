//! Crate-wide error types.
//!
//! Following the teacher SDK's split: [`ErrorData`] is the *wire* error
//! payload (re-exported from [`crate::model`]), while [`ServiceError`] is
//! the Rust-side error that never crosses the wire itself — it's what
//! `Peer` methods and the engine's internal plumbing return.

use thiserror::Error;

pub use crate::model::ErrorData;

/// Errors surfaced by [`crate::protocol::Peer`] request/notification
/// methods — the client-facing half of the engine (§7 "Propagation
/// policy").
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request timed out")]
    Timeout,
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("peer returned an error: {0}")]
    PeerError(#[from] ErrorData),
    #[error("transport send failed: {0}")]
    TransportSend(String),
    #[error("remote does not advertise support for {0:?}")]
    UnsupportedCapability(String),
}
