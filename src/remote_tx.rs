//! Remote user-transaction (UT) handle and its status state machine
//! (spec §4.3, C3).
//!
//! A [`RemoteTransactionHandle`] represents one flat transaction begun
//! against a peer. All network I/O for a given handle is serialised through
//! a single async mutex: the spec models this on a JVM intrinsic lock held
//! for the duration of the remote call, which an async `Mutex` held across
//! `.await` reproduces directly (a `std::sync::Mutex` cannot be held across
//! an await point).

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, Message, P_TXN_CONTEXT, P_TXN_TIMEOUT};
use crate::engine::Channel;
use crate::error::CoreError;
use crate::invocation::InvocationTracker;

fn log_failure(verb: &'static str, err: &CoreError) {
    tracing::warn!(code = err.code(), verb, "{err}");
}

/// Status of a remote transaction, mirroring `javax.transaction.Status`'s
/// numeric codes so log output lines up with the reference system's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    /// A transaction is active.
    Active = 0,
    /// The transaction has been marked for rollback, e.g. as the result of
    /// `setRollbackOnly()`.
    MarkedRollback = 1,
    /// The transaction is in the process of committing.
    Committing = 8,
    /// The transaction has completed successfully, by committing.
    Committed = 3,
    /// The transaction is in the process of rolling back.
    RollingBack = 9,
    /// The transaction has completed successfully, by rolling back.
    RolledBack = 4,
    /// A transaction is associated with the target object but is in a
    /// state that cannot be determined; this is a transient state returned
    /// only as the result of a system failure.
    Unknown = 5,
    /// No transaction is currently associated with the target object.
    NoTransaction = 6,
}

impl Status {
    const fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::MarkedRollback,
            8 => Self::Committing,
            3 => Self::Committed,
            9 => Self::RollingBack,
            4 => Self::RolledBack,
            6 => Self::NoTransaction,
            _ => Self::Unknown,
        }
    }
}

/// RAII finalizer that collapses any residual intermediate status to
/// [`Status::Unknown`] if the in-flight operation never reaches a terminal
/// outcome — for example because the caller's future was cancelled mid-await
/// (spec §8 scenario 6: an interrupted `begin` must leave the handle
/// `UNKNOWN`, not stuck `ACTIVE`-in-progress).
struct StatusGuard<'a> {
    status: &'a AtomicI32,
    resolved: bool,
}

impl<'a> StatusGuard<'a> {
    fn new(status: &'a AtomicI32) -> Self {
        Self {
            status,
            resolved: false,
        }
    }

    /// Marks the operation as having reached `outcome` normally, suppressing
    /// the `UNKNOWN` collapse on drop.
    fn resolve(mut self, outcome: Status) {
        self.status.store(outcome as i32, Ordering::SeqCst);
        self.resolved = true;
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.status.store(Status::Unknown as i32, Ordering::SeqCst);
        }
    }
}

/// A handle to one flat transaction begun against a remote peer.
pub struct RemoteTransactionHandle {
    channel: Arc<dyn Channel>,
    tracker: Arc<InvocationTracker>,
    status: AtomicI32,
    txn_context: tokio::sync::Mutex<Option<Bytes>>,
}

impl RemoteTransactionHandle {
    /// Creates a handle in the `NO_TRANSACTION` state over `channel`.
    #[must_use]
    pub fn new(channel: Arc<dyn Channel>, tracker: Arc<InvocationTracker>) -> Self {
        Self {
            channel,
            tracker,
            status: AtomicI32::new(Status::NoTransaction as i32),
            txn_context: tokio::sync::Mutex::new(None),
        }
    }

    /// The handle's current status.
    #[must_use]
    pub fn status(&self) -> Status { Status::from_i32(self.status.load(Ordering::SeqCst)) }

    /// Marks the transaction for rollback-only. Valid from `ACTIVE`.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTxnState`] if no transaction is active.
    pub fn set_rollback_only(&self) -> Result<(), CoreError> {
        match self.status() {
            Status::Active | Status::MarkedRollback => {
                self.status.store(Status::MarkedRollback as i32, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(CoreError::InvalidTxnState),
        }
    }

    /// Begins a new transaction with the peer, timing it out after
    /// `timeout_secs` (`0` uses the peer's default).
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTxnState`] if a transaction is already
    /// active, [`CoreError::OperationInterrupted`] if `cancel` fires first,
    /// or a transport/protocol error from the peer exchange.
    #[tracing::instrument(skip(self, cancel), fields(timeout_secs))]
    pub async fn begin(
        &self,
        timeout_secs: u32,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        if self.status() != Status::NoTransaction {
            log_failure("begin", &CoreError::InvalidTxnState);
            return Err(CoreError::InvalidTxnState);
        }
        let guard = {
            let mut txn_context = self.txn_context.lock().await;
            self.status.store(Status::Active as i32, Ordering::SeqCst);
            let guard = StatusGuard::new(&self.status);

            let request = Message::new(0, codec::M_UT_BEGIN)
                .with_param(crate::codec::Param::unsigned(P_TXN_TIMEOUT, timeout_secs));
            let response = match self.run_cancellable(request, cancel).await {
                Ok(response) => response,
                Err(err) => {
                    log_failure("begin", &err);
                    return Err(err);
                }
            };
            // A peer-reported security exception means the peer never
            // associated a context with this attempt, so the handle goes
            // back to NO_TRANSACTION rather than the default UNKNOWN collapse.
            if let Err(err) = response_outcome(&response) {
                if matches!(err, CoreError::PeerSecurityException) {
                    guard.resolve(Status::NoTransaction);
                }
                log_failure("begin", &err);
                return Err(err);
            }
            let context = match response
                .param(P_TXN_CONTEXT)
                .ok_or_else(|| CoreError::ProtocolError("missing txn context".to_owned()))
            {
                Ok(param) => param.data.clone(),
                Err(err) => {
                    log_failure("begin", &err);
                    return Err(err);
                }
            };
            *txn_context = Some(context);
            guard
        };
        guard.resolve(Status::Active);
        Ok(())
    }

    /// Commits the transaction. If the transaction is marked rollback-only,
    /// rolls it back instead and surfaces [`CoreError::RollbackException`].
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTxnState`] if no transaction is active,
    /// peer-reported heuristic/system errors mapped onto [`CoreError`], or
    /// [`CoreError::OperationInterrupted`] if `cancel` fires first.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn commit(&self, cancel: &CancellationToken) -> Result<(), CoreError> {
        match self.status() {
            Status::Active => {}
            Status::MarkedRollback => {
                self.rollback(cancel).await?;
                log_failure("commit", &CoreError::RollbackException);
                return Err(CoreError::RollbackException);
            }
            _ => {
                log_failure("commit", &CoreError::InvalidTxnState);
                return Err(CoreError::InvalidTxnState);
            }
        }

        let guard = StatusGuard::new(&self.status);
        self.status.store(Status::Committing as i32, Ordering::SeqCst);
        let mut txn_context = self.txn_context.lock().await;
        let context = match txn_context
            .clone()
            .ok_or_else(|| CoreError::ProtocolError("no transaction context".to_owned()))
        {
            Ok(context) => context,
            Err(err) => {
                log_failure("commit", &err);
                return Err(err);
            }
        };
        let request = Message::new(0, codec::M_UT_COMMIT)
            .with_param(crate::codec::Param { id: P_TXN_CONTEXT, data: context });
        let response = match self.run_cancellable(request, cancel).await {
            Ok(response) => response,
            Err(err) => {
                log_failure("commit", &err);
                return Err(err);
            }
        };
        *txn_context = None;
        if let Err(err) = response_outcome(&response) {
            // Only a peer-reported rollback is actually ROLLEDBACK; a
            // security exception restores the prior ACTIVE status (the
            // peer never acted on the commit), and every other peer error
            // (heuristic/system/illegal-state) collapses to UNKNOWN via the
            // guard's default drop behaviour.
            match err {
                CoreError::TransactionRolledBackByPeer => guard.resolve(Status::RolledBack),
                CoreError::PeerSecurityException => guard.resolve(Status::Active),
                _ => {}
            }
            log_failure("commit", &err);
            return Err(err);
        }
        guard.resolve(Status::Committed);
        Ok(())
    }

    /// Rolls the transaction back. Valid from `ACTIVE` or `MARKED_ROLLBACK`.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTxnState`] if no transaction is active, a
    /// peer-reported error mapped onto [`CoreError`], or
    /// [`CoreError::OperationInterrupted`] if `cancel` fires first.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn rollback(&self, cancel: &CancellationToken) -> Result<(), CoreError> {
        let prior_status = match self.status() {
            status @ (Status::Active | Status::MarkedRollback) => status,
            _ => {
                log_failure("rollback", &CoreError::InvalidTxnState);
                return Err(CoreError::InvalidTxnState);
            }
        };

        let guard = StatusGuard::new(&self.status);
        self.status.store(Status::RollingBack as i32, Ordering::SeqCst);
        let mut txn_context = self.txn_context.lock().await;
        let context = match txn_context
            .clone()
            .ok_or_else(|| CoreError::ProtocolError("no transaction context".to_owned()))
        {
            Ok(context) => context,
            Err(err) => {
                log_failure("rollback", &err);
                return Err(err);
            }
        };
        let request = Message::new(0, codec::M_UT_ROLLBACK)
            .with_param(crate::codec::Param { id: P_TXN_CONTEXT, data: context });
        let response = match self.run_cancellable(request, cancel).await {
            Ok(response) => response,
            Err(err) => {
                log_failure("rollback", &err);
                return Err(err);
            }
        };
        if let Err(err) = response_outcome(&response) {
            // A peer-reported security exception means the peer never acted
            // on the rollback, so the handle is restored to whichever
            // status it held before this call rather than collapsing to
            // UNKNOWN.
            if matches!(err, CoreError::PeerSecurityException) {
                guard.resolve(prior_status);
            }
            log_failure("rollback", &err);
            return Err(err);
        }
        guard.resolve(Status::RolledBack);
        *txn_context = None;
        Ok(())
    }

    /// Tears down this handle because its channel has closed: resolves any
    /// in-flight invocation with `ChannelClosed` and leaves the handle
    /// `UNKNOWN` if a transaction was in flight.
    pub fn disconnect(&self) {
        self.tracker.close();
        if !matches!(self.status(), Status::NoTransaction | Status::Committed | Status::RolledBack) {
            self.status.store(Status::Unknown as i32, Ordering::SeqCst);
        }
    }

    async fn run_cancellable(
        &self,
        request: Message,
        cancel: &CancellationToken,
    ) -> Result<Message, CoreError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CoreError::OperationInterrupted),
            result = self.tracker.invoke(self.channel.as_ref(), request) => {
                Message::decode(&result?)
            }
        }
    }
}

/// Maps a UT response's error-marker parameters onto the matching
/// [`CoreError`], if the peer reported one.
fn response_outcome(response: &Message) -> Result<(), CoreError> {
    if response.param(codec::P_UT_IS_EXC).is_some() {
        return Err(CoreError::PeerIllegalStateException);
    }
    if response.param(codec::P_UT_SYS_EXC).is_some() {
        return Err(CoreError::PeerSystemException);
    }
    if response.param(codec::P_SEC_EXC).is_some() {
        return Err(CoreError::PeerSecurityException);
    }
    if response.param(codec::P_UT_HME_EXC).is_some() {
        return Err(CoreError::PeerHeuristicMixed);
    }
    if response.param(codec::P_UT_HRE_EXC).is_some() {
        return Err(CoreError::PeerHeuristicRollback);
    }
    if response.param(codec::P_UT_RB_EXC).is_some() {
        return Err(CoreError::TransactionRolledBackByPeer);
    }
    Ok(())
}
