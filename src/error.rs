//! Error types shared by the protocol engine and the hosted protocols.

use crate::session::SessionId;
use crate::topology::NodeId;

/// Errors surfaced by the protocol engine and the protocols running on it.
///
/// `Configuration` and `SignatureInvalid` are returned synchronously to the
/// caller. `ShareMismatch`, `SendFailure` and `Timeout` abort the in-flight
/// round and reach the caller through the round's feedback channel, since the
/// caller is blocked on a receive at that point.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ProtocolError {
    /// Missing or inconsistent inputs, detected before any message is sent.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A dealt subshare did not match the dealer's public commitments.
    #[error("share verification failed in session {session} (dealer {dealer})")]
    ShareMismatch { session: SessionId, dealer: u32 },
    /// Lookup of a session identifier that was never completed here.
    #[error("unknown session {0}")]
    NotFound(SessionId),
    /// The Schnorr verification equation did not hold.
    #[error("signature verification failed")]
    SignatureInvalid,
    /// A relay hop could not be delivered. Logged, never retried in place;
    /// recovery is restarting the round under a supervising timeout.
    #[error("failed to deliver message to node {to}")]
    SendFailure { to: NodeId },
    /// The round did not complete within its deadline.
    #[error("round deadline elapsed")]
    Timeout,
    /// A re-keying proof failed to verify during chain audit.
    #[error("re-keying proof rejected: {0}")]
    ProofInvalid(String),
    /// Marshaling of a point, scalar or wire message failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProtocolError {
    pub(crate) fn serialization<E: core::fmt::Debug>(err: E) -> Self {
        ProtocolError::Serialization(format!("{:?}", err))
    }
}
