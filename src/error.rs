//! Sum-typed error taxonomy for the transaction core.
//!
//! Every failure a caller can observe is one variant of [`CoreError`]. Each
//! variant carries a stable `WFTXN####` identifier through [`CoreError::code`]
//! so that log readers can grep for it regardless of the human-readable
//! message, and a subset additionally map onto the standard XA error codes
//! via [`CoreError::as_xa_error_code`].

use thiserror::Error;

/// Errors raised by the remote-transaction, subordinate-XA, and import
/// registry state machines.
///
/// # Stability
/// The `WFTXN####` code returned by [`Self::code`] is part of the external
/// contract (see spec §6): it must not change for an existing variant.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Sending a request to the peer failed at the transport layer.
    #[error("failed to send request to peer: {0}")]
    FailedToSend(String),
    /// Reading a response from the peer failed at the transport layer.
    #[error("failed to receive response from peer: {0}")]
    FailedToReceive(String),
    /// The response stream closed or errored before a complete message arrived.
    #[error("response failed: {0}")]
    ResponseFailed(String),
    /// The channel this invocation was bound to has been closed.
    #[error("channel closed")]
    ChannelClosed,

    /// The peer sent a message that doesn't parse as a protocol frame.
    #[error("protocol error: {0}")]
    ProtocolError(String),
    /// The peer sent a response with an opcode the caller didn't expect.
    #[error("unknown response opcode {0}")]
    UnknownResponse(u8),

    /// The peer reported `SystemException`.
    #[error("peer threw a system exception")]
    PeerSystemException,
    /// The peer reported `SecurityException`.
    #[error("peer threw a security exception")]
    PeerSecurityException,
    /// The peer reported a heuristic-mixed outcome.
    #[error("peer reported a heuristic mixed outcome")]
    PeerHeuristicMixed,
    /// The peer reported a heuristic-rollback outcome.
    #[error("peer reported a heuristic rollback outcome")]
    PeerHeuristicRollback,
    /// The peer reported `IllegalStateException`.
    #[error("peer threw an illegal state exception")]
    PeerIllegalStateException,
    /// The peer rolled the transaction back instead of committing it.
    #[error("transaction was rolled back by the peer")]
    TransactionRolledBackByPeer,

    /// The requested operation is not valid from the handle's current status.
    #[error("invalid transaction state for this operation")]
    InvalidTxnState,
    /// The branch is already associated with a transaction.
    #[error("branch is already associated with a transaction")]
    AlreadyAssociated,
    /// An outflow handle was resolved more than once.
    #[error("outflow handle was already enlisted")]
    AlreadyEnlisted,
    /// An outflow handle was resolved more than once via `forgetEnlistment`.
    #[error("outflow handle was already forgotten")]
    AlreadyForgotten,
    /// A new enlistment was attempted after the commit window closed.
    #[error("enlistment window is closed")]
    EnlistmentWindowClosed,
    /// `commitLocal` was called on a transaction imported from a peer.
    #[error("cannot commit locally: transaction was imported")]
    CommitOnImported,
    /// `rollbackLocal` was called on a transaction imported from a peer.
    #[error("cannot roll back locally: transaction was imported")]
    RollbackOnImported,

    /// A negative transaction timeout was supplied.
    #[error("transaction timeout must not be negative")]
    NegativeTxnTimeout,
    /// Flags supplied to an XA call were not a recognised combination.
    #[error("invalid XA flags")]
    InvalidFlags,
    /// No provider is registered under the requested name.
    #[error("unknown provider {0:?}")]
    UnknownProvider(String),
    /// No provider is registered for the URL's scheme.
    #[error("no provider for URL {0}")]
    NoProviderForUri(String),

    /// A verb was retried after a rollback decision had already been taken.
    #[error("transaction was marked rollback-only")]
    RollbackException,
    /// An XA verb ran against a gtid the registry has no entry for.
    #[error("no such transaction")]
    XaerNota,
    /// The local engine rejected a 2PC verb after giving an RM-level error.
    #[error("resource manager error: {0}")]
    XaerRmerr(String),
    /// `prepare` failed and the branch has already rolled back.
    #[error("branch rolled back during prepare")]
    XaRbRollback,
    /// `prepare` failed for a reason not covered by a more specific code.
    #[error("branch rolled back for an unspecified reason")]
    XaRbOther,
    /// The engine heuristically committed after a failure.
    #[error("heuristic commit")]
    XaHeurCom,
    /// The engine heuristically rolled back after a failure.
    #[error("heuristic rollback")]
    XaHeurRb,
    /// The engine took inconsistent heuristic decisions across branches.
    #[error("heuristic mixed outcome")]
    XaHeurMix,

    /// A blocked wait for a peer response was cancelled.
    #[error("operation was interrupted")]
    OperationInterrupted,

    /// The local TM engine raised an error with no more specific mapping.
    #[error("local engine error: {0}")]
    EngineError(String),
}

impl CoreError {
    /// Returns the stable `WFTXN####` identifier for this error.
    ///
    /// These identifiers are part of the external contract (spec §6): they
    /// are grepped by log tooling and must remain stable across releases.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::FailedToSend(_) => "WFTXN0001",
            Self::FailedToReceive(_) => "WFTXN0002",
            Self::ResponseFailed(_) => "WFTXN0003",
            Self::ChannelClosed => "WFTXN0004",
            Self::ProtocolError(_) => "WFTXN0005",
            Self::UnknownResponse(_) => "WFTXN0006",
            Self::PeerSystemException => "WFTXN0010",
            Self::PeerSecurityException => "WFTXN0011",
            Self::PeerHeuristicMixed => "WFTXN0012",
            Self::PeerHeuristicRollback => "WFTXN0013",
            Self::PeerIllegalStateException => "WFTXN0014",
            Self::TransactionRolledBackByPeer => "WFTXN0015",
            Self::InvalidTxnState => "WFTXN0020",
            Self::AlreadyAssociated => "WFTXN0021",
            Self::AlreadyEnlisted => "WFTXN0022",
            Self::AlreadyForgotten => "WFTXN0023",
            Self::EnlistmentWindowClosed => "WFTXN0024",
            Self::CommitOnImported => "WFTXN0025",
            Self::RollbackOnImported => "WFTXN0026",
            Self::NegativeTxnTimeout => "WFTXN0030",
            Self::InvalidFlags => "WFTXN0031",
            Self::UnknownProvider(_) => "WFTXN0032",
            Self::NoProviderForUri(_) => "WFTXN0033",
            Self::RollbackException => "WFTXN0040",
            Self::XaerNota => "WFTXN0041",
            Self::XaerRmerr(_) => "WFTXN0042",
            Self::XaRbRollback => "WFTXN0043",
            Self::XaRbOther => "WFTXN0044",
            Self::XaHeurCom => "WFTXN0050",
            Self::XaHeurRb => "WFTXN0051",
            Self::XaHeurMix => "WFTXN0052",
            Self::OperationInterrupted => "WFTXN0060",
            Self::EngineError(_) => "WFTXN0045",
        }
    }

    /// Maps this error onto the standard XA error code a `XAResource`
    /// implementation would surface for it, when one applies.
    ///
    /// Errors that only ever occur on the user-transaction path (C3) have no
    /// XA analogue and return `None`.
    #[must_use]
    pub const fn as_xa_error_code(&self) -> Option<XaErrorCode> {
        match self {
            Self::InvalidTxnState | Self::XaerNota => Some(XaErrorCode::Nota),
            Self::InvalidFlags => Some(XaErrorCode::Inval),
            Self::XaerRmerr(_) | Self::EngineError(_) => Some(XaErrorCode::Rmerr),
            Self::XaRbRollback => Some(XaErrorCode::RbRollback),
            Self::XaRbOther => Some(XaErrorCode::RbOther),
            Self::XaHeurCom => Some(XaErrorCode::HeurCom),
            Self::XaHeurRb => Some(XaErrorCode::HeurRb),
            Self::XaHeurMix => Some(XaErrorCode::HeurMix),
            Self::ChannelClosed | Self::FailedToSend(_) | Self::FailedToReceive(_) => {
                Some(XaErrorCode::Rmfail)
            }
            _ => None,
        }
    }
}

/// Standard XA resource-manager error and rollback-reason codes, as defined
/// by the X/Open XA specification (`javax.transaction.xa.XAResource` /
/// `XAException`).
///
/// The numeric values are part of the XA standard, not an internal
/// convention, and so are preserved bit-exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum XaErrorCode {
    /// The resource manager has no transaction for the given `Xid`.
    Nota = -4,
    /// Invalid arguments were given.
    Inval = -5,
    /// An internal resource-manager error occurred.
    Rmerr = -3,
    /// The resource manager is unavailable.
    Rmfail = -7,
    /// The branch rolled back and the reason is not specified.
    RbOther = 104,
    /// The branch rolled back deliberately.
    RbRollback = 100,
    /// A heuristic decision committed.
    HeurCom = 7,
    /// A heuristic decision rolled back.
    HeurRb = 6,
    /// Heuristic decisions across branches were inconsistent.
    HeurMix = 5,
    /// The branch is read-only; it was not actually voted into the outcome.
    Rdonly = 3,
    /// The operation completed successfully.
    Ok = 0,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn all_variants() -> Vec<CoreError> {
        vec![
            CoreError::FailedToSend(String::new()),
            CoreError::FailedToReceive(String::new()),
            CoreError::ResponseFailed(String::new()),
            CoreError::ChannelClosed,
            CoreError::ProtocolError(String::new()),
            CoreError::UnknownResponse(0),
            CoreError::PeerSystemException,
            CoreError::PeerSecurityException,
            CoreError::PeerHeuristicMixed,
            CoreError::PeerHeuristicRollback,
            CoreError::PeerIllegalStateException,
            CoreError::TransactionRolledBackByPeer,
            CoreError::InvalidTxnState,
            CoreError::AlreadyAssociated,
            CoreError::AlreadyEnlisted,
            CoreError::AlreadyForgotten,
            CoreError::EnlistmentWindowClosed,
            CoreError::CommitOnImported,
            CoreError::RollbackOnImported,
            CoreError::NegativeTxnTimeout,
            CoreError::InvalidFlags,
            CoreError::UnknownProvider(String::new()),
            CoreError::NoProviderForUri(String::new()),
            CoreError::RollbackException,
            CoreError::XaerNota,
            CoreError::XaerRmerr(String::new()),
            CoreError::XaRbRollback,
            CoreError::XaRbOther,
            CoreError::XaHeurCom,
            CoreError::XaHeurRb,
            CoreError::XaHeurMix,
            CoreError::OperationInterrupted,
            CoreError::EngineError(String::new()),
        ]
    }

    #[test]
    fn codes_are_unique_and_in_range() {
        let mut seen = HashSet::new();
        for err in all_variants() {
            let code = err.code();
            assert!(code.starts_with("WFTXN"), "{code} missing prefix");
            let numeric: u32 = code[5..].parse().expect("numeric suffix");
            assert!(numeric <= 60, "{code} out of the WFTXN0000..=WFTXN0060 range");
            assert!(seen.insert(code), "duplicate code {code}");
        }
    }
}
