//! Collaborator contracts consumed by the core (spec §6).
//!
//! These traits are the seams for components this crate treats as external:
//! the message transport, the local pluggable transaction-manager engine,
//! the XA terminator that performs the actual import/recovery bookkeeping,
//! and the provider registry that maps a peer URL to the object that can
//! talk to it. None of them is implemented here; fakes for these traits are
//! what the test suite drives the core against.

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::{error::CoreError, xid::SimpleXid};

/// A bidirectional, request/response-capable link to a single peer.
///
/// The inbound half is not modelled as a pull loop: whatever owns the
/// transport reads frames off the wire and calls
/// [`crate::invocation::InvocationTracker::complete`] once per received
/// message. This trait only covers the outbound half and peer identity.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a pre-framed message to the peer.
    ///
    /// # Errors
    /// Returns [`CoreError::FailedToSend`] if the underlying transport
    /// rejects or fails to deliver the bytes.
    async fn send(&self, request_id: u16, frame: Bytes) -> Result<(), CoreError>;

    /// The peer-identity id this channel authenticated as, or `0` if none.
    fn peer_identity_id(&self) -> u32;

    /// The URL identifying this channel's peer.
    fn location(&self) -> &Url;
}

/// A callback the local engine invokes on a transaction's interposed
/// synchronization, once the transaction completes one way or the other.
pub trait Synchronization: Send + Sync {
    /// Invoked once the local transaction has finished committing or
    /// rolling back.
    fn after_completion(&self);
}

/// The pluggable local transaction-manager engine (out of scope; Narayana-
/// style in the reference system).
pub trait LocalTm: Send + Sync {
    /// Begin a new local transaction on the calling context.
    ///
    /// # Errors
    /// Returns [`CoreError::EngineError`] if the engine cannot begin.
    fn begin(&self) -> Result<(), CoreError>;

    /// Suspend the transaction associated with the calling context.
    ///
    /// # Errors
    /// Returns [`CoreError::EngineError`] if none is associated.
    fn suspend(&self) -> Result<(), CoreError>;

    /// Resume a previously suspended transaction on the calling context.
    ///
    /// # Errors
    /// Returns [`CoreError::EngineError`] if resumption fails.
    fn resume(&self) -> Result<(), CoreError>;

    /// Set the default transaction timeout used by subsequent `begin` calls.
    fn set_transaction_timeout(&self, secs: u32);

    /// The default transaction timeout currently configured.
    fn get_transaction_timeout(&self) -> u32;
}

/// Outcome of an engine-level `prepare` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The branch did no work and may be dropped without further 2PC calls.
    ReadOnly,
    /// The branch voted to commit.
    Ok,
    /// The branch voted to roll back.
    NotOk,
    /// The engine has no record of this transaction.
    InvalidTransaction,
    /// Any other engine-reported outcome.
    Other,
}

/// A handle to a transaction managed by the local engine.
pub trait ManagedTransaction: Send + Sync {
    /// The transaction's global identifier.
    fn xid(&self) -> SimpleXid;

    /// The branch timeout this transaction was imported/begun with.
    fn timeout_secs(&self) -> u32;

    /// Register a callback to run after the transaction completes.
    fn register_interposed_synchronization(&self, sync: Box<dyn Synchronization>);

    /// Attach an opaque value to this transaction's local resource slot
    /// under `key`, returning the previous value if one was attached.
    fn put_local_resource(&self, key: &'static str, value: Box<dyn std::any::Any + Send + Sync>);

    /// Whether a value is already attached under `key`.
    fn has_local_resource(&self, key: &'static str) -> bool;

    /// Run the `beforeCompletion` phase.
    ///
    /// # Errors
    /// Returns [`CoreError::EngineError`] if the engine call fails.
    fn do_before_completion(&self) -> Result<(), CoreError>;

    /// Run `prepare`.
    ///
    /// # Errors
    /// Returns [`CoreError::EngineError`] if the engine call fails outright
    /// (as opposed to voting not-ok, which is a [`PrepareOutcome`]).
    fn do_prepare(&self) -> Result<PrepareOutcome, CoreError>;

    /// Run two-phase `commit`.
    ///
    /// # Errors
    /// Returns the engine's error, already mapped onto [`CoreError`]'s
    /// heuristic/RM-error variants.
    fn do_commit(&self) -> Result<(), CoreError>;

    /// Run one-phase `commit`.
    ///
    /// # Errors
    /// See [`Self::do_commit`].
    fn do_one_phase_commit(&self) -> Result<(), CoreError>;

    /// Run `rollback`.
    ///
    /// # Errors
    /// See [`Self::do_commit`].
    fn do_rollback(&self) -> Result<(), CoreError>;

    /// Run `forget`, discarding any heuristic outcome record.
    ///
    /// # Errors
    /// Returns [`CoreError::EngineError`] if the engine call fails.
    fn do_forget(&self) -> Result<(), CoreError>;
}

/// The XA terminator: performs the actual import/lookup/recovery work the
/// registry (C6) delegates to.
pub trait XaTerminator: Send + Sync {
    /// Import `xid` as a subordinate transaction, or look it up if
    /// `do_not_import` is set. Returns the managed transaction and whether
    /// this call actually performed a new import.
    ///
    /// # Errors
    /// Returns [`CoreError::EngineError`] if the engine cannot import/locate
    /// the transaction.
    fn import_transaction(
        &self,
        xid: &SimpleXid,
        timeout_secs: u32,
        do_not_import: bool,
    ) -> Result<(std::sync::Arc<dyn ManagedTransaction>, bool), CoreError>;

    /// Look up an already-imported transaction by gtid, without importing.
    fn get_transaction(&self, gtid: &SimpleXid) -> Option<std::sync::Arc<dyn ManagedTransaction>>;

    /// Remove a gtid's bookkeeping from the engine once the registry has
    /// evicted it.
    fn remove_imported_transaction(&self, gtid: &SimpleXid);

    /// List the in-doubt transactions the engine knows about for recovery
    /// scans, optionally scoped to `parent_name`.
    fn recover(&self, parent_name: &str) -> Vec<SimpleXid>;
}

/// A concrete means of reaching a peer for either user-transaction or XA
/// traffic, keyed by URL scheme in the provider registry (C8).
pub trait RemoteTransactionProvider: Send + Sync {
    /// The URL scheme this provider handles (e.g. `"remote+http"`).
    fn scheme(&self) -> &str;
}
