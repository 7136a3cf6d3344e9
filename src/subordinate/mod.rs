//! Client-side facade for a single outflowed XA branch (spec §4.4, C4).
//!
//! When this node outflows a transaction to a peer, the local engine gets
//! handed a [`SubordinateXaResource`] to drive the branch through the
//! standard XA verb sequence. The actual bookkeeping for "has this peer
//! already prepared/committed/forgotten the branch" lives on the peer's own
//! import registry (C6/C7); this side only needs to remember enough to
//! reissue the right wire call and to deduplicate when more than one local
//! resource shares the same outflowed branch (C5).

pub mod outflow;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::codec::{self, Message, Param};
use crate::engine::{Channel, PrepareOutcome};
use crate::error::CoreError;
use crate::invocation::InvocationTracker;
use crate::subordinate::outflow::XAOutflowHandle;
use crate::xid::SimpleXid;

/// Local lifecycle state of a [`SubordinateXaResource`].
///
/// This tracks only what this side has *attempted*, not what the peer has
/// actually recorded — the peer's registry (C6/C7) is authoritative for
/// that, and can be queried again during recovery if this side's state is
/// lost (e.g. on restart; there is no passivated-state recovery in this
/// crate, only the `(location, parent_name)` pair needed to reconnect, see
/// [`SubordinateXaResource::snapshot`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum LocalState {
    Active = 0,
    Prepared = 1,
    Committed = 2,
    RolledBack = 3,
    Forgotten = 4,
}

impl LocalState {
    const fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Prepared,
            2 => Self::Committed,
            3 => Self::RolledBack,
            4 => Self::Forgotten,
            _ => Self::Active,
        }
    }
}

/// The durable part of a [`SubordinateXaResource`]: just enough to
/// reconstruct it across a passivation boundary. The branch's `xid`,
/// timeout, and live transport are recovered separately and are not part of
/// this snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSnapshot {
    /// The peer this branch was outflowed to.
    pub location: Url,
    /// The local transaction name the branch belongs to.
    pub parent_name: String,
}

/// A handle the local transaction manager drives through XA `prepare` /
/// `commit` / `rollback` / `forget` for one branch outflowed to a peer.
pub struct SubordinateXaResource {
    location: Url,
    parent_name: String,
    xid: SimpleXid,
    timeout_secs: u32,
    start_time: Instant,
    channel: Arc<dyn Channel>,
    tracker: Arc<InvocationTracker>,
    outflow: XAOutflowHandle,
    state: AtomicU32,
}

impl SubordinateXaResource {
    /// Creates a resource for branch `xid`, outflowed to `location` from the
    /// transaction rooted on `parent_name`.
    #[must_use]
    pub fn new(
        location: Url,
        parent_name: String,
        xid: SimpleXid,
        timeout_secs: u32,
        channel: Arc<dyn Channel>,
        tracker: Arc<InvocationTracker>,
        outflow: XAOutflowHandle,
    ) -> Self {
        Self {
            location,
            parent_name,
            xid,
            timeout_secs,
            start_time: Instant::now(),
            channel,
            tracker,
            outflow,
            state: AtomicU32::new(LocalState::Active as u32),
        }
    }

    /// The branch's global transaction identifier.
    #[must_use]
    pub fn xid(&self) -> &SimpleXid { &self.xid }

    /// The branch timeout this resource was outflowed with.
    #[must_use]
    pub fn timeout_secs(&self) -> u32 { self.timeout_secs }

    /// How long this branch has been open.
    #[must_use]
    pub fn age(&self) -> std::time::Duration { self.start_time.elapsed() }

    /// The `(location, parent name)` pair needed to reconstruct a resource
    /// for this branch after passivation — the peer's registry remains the
    /// source of truth for the branch's actual XA state.
    #[must_use]
    pub fn snapshot(&self) -> BranchSnapshot {
        BranchSnapshot {
            location: self.location.clone(),
            parent_name: self.parent_name.clone(),
        }
    }

    /// Reconstructs a resource for recovery from a previously captured
    /// [`BranchSnapshot`] plus the fields that aren't persisted: the branch's
    /// `xid`/timeout (recovered separately, from the peer or a recovery
    /// scan), and the live channel/tracker/outflow to reach it through.
    ///
    /// The rebuilt resource always starts `Active`, regardless of what this
    /// side last attempted before passivation — the peer's registry is
    /// authoritative for the branch's actual XA state.
    #[must_use]
    pub fn from_snapshot(
        snapshot: BranchSnapshot,
        xid: SimpleXid,
        timeout_secs: u32,
        channel: Arc<dyn Channel>,
        tracker: Arc<InvocationTracker>,
        outflow: XAOutflowHandle,
    ) -> Self {
        Self {
            location: snapshot.location,
            parent_name: snapshot.parent_name,
            xid,
            timeout_secs,
            start_time: Instant::now(),
            channel,
            tracker,
            outflow,
            state: AtomicU32::new(LocalState::Active as u32),
        }
    }

    /// The enlistment accounting shared with any other local resource
    /// outflowed to the same branch.
    #[must_use]
    pub fn outflow(&self) -> &XAOutflowHandle { &self.outflow }

    /// Marks that this resource verified the branch is still served by the
    /// same resource manager instance it was outflowed to (C5). Returns
    /// `true` if this was the first enlistment on the branch to verify.
    ///
    /// # Errors
    /// Returns [`CoreError::AlreadyEnlisted`] if this resource's enlistment
    /// has already been resolved.
    pub fn verify_enlistment(&self) -> Result<bool, CoreError> { self.outflow.verify() }

    /// Marks that this resource discovered it is not talking to the
    /// branch's master resource manager instance (C5).
    ///
    /// # Errors
    /// Returns [`CoreError::AlreadyEnlisted`] if this resource's enlistment
    /// has already been resolved.
    pub fn non_master_enlistment(&self) -> Result<(), CoreError> { self.outflow.non_master_one() }

    /// Releases this resource's open enlistment against the branch (C5).
    ///
    /// # Errors
    /// Returns [`CoreError::AlreadyForgotten`] if this resource's enlistment
    /// has already been resolved.
    pub fn forget_enlistment(&self) -> Result<bool, CoreError> { self.outflow.forget_one() }

    fn local_state(&self) -> LocalState { LocalState::from_u32(self.state.load(Ordering::Acquire)) }

    /// Issues XA `prepare` for this branch.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTxnState`] if this resource isn't
    /// `Active`, or the peer's reported outcome mapped onto [`CoreError`].
    pub async fn prepare(&self, cancel: &CancellationToken) -> Result<PrepareOutcome, CoreError> {
        if self.local_state() != LocalState::Active {
            return Err(CoreError::InvalidTxnState);
        }
        // Nothing enlisted against this branch ever verified it did real
        // work, so it can be dropped as read-only without a wire round trip.
        if !self.outflow.any_verified() {
            self.state.store(LocalState::Prepared as u32, Ordering::Release);
            return Ok(PrepareOutcome::ReadOnly);
        }
        let request = Message::new(0, codec::M_XA_PREPARE).with_param(self.xid_param());
        let response = self.call(request, cancel).await?;
        let outcome = match response.param(codec::P_UT_RB_EXC) {
            Some(_) => PrepareOutcome::NotOk,
            None => PrepareOutcome::Ok,
        };
        if outcome == PrepareOutcome::Ok {
            self.state.store(LocalState::Prepared as u32, Ordering::Release);
        }
        Ok(outcome)
    }

    /// Issues XA `commit` for this branch.
    ///
    /// When this resource shares its outflow accounting with other local
    /// resources, only the first caller to reach this method actually hits
    /// the wire; later callers observe the branch already committed and
    /// return `Ok(())` without a second round trip.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTxnState`] if this resource is not in a
    /// state commit is valid from, or the peer's reported outcome mapped
    /// onto [`CoreError`].
    pub async fn commit(&self, one_phase: bool, cancel: &CancellationToken) -> Result<(), CoreError> {
        let expected = if one_phase {
            LocalState::Active
        } else {
            LocalState::Prepared
        };
        if self.local_state() != expected {
            return Err(CoreError::InvalidTxnState);
        }
        if !self.outflow.try_begin_commit()? {
            self.state.store(LocalState::Committed as u32, Ordering::Release);
            return Ok(());
        }

        let mut request = Message::new(0, codec::M_XA_COMMIT).with_param(self.xid_param());
        if one_phase {
            request = request.with_param(Param::marker(codec::P_XA_ONE_PHASE));
        }
        self.call(request, cancel).await?;
        self.state.store(LocalState::Committed as u32, Ordering::Release);
        Ok(())
    }

    /// Issues XA `rollback` for this branch.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTxnState`] if this resource is already
    /// completed, or the peer's reported outcome mapped onto [`CoreError`].
    pub async fn rollback(&self, cancel: &CancellationToken) -> Result<(), CoreError> {
        if matches!(
            self.local_state(),
            LocalState::Committed | LocalState::RolledBack | LocalState::Forgotten
        ) {
            return Err(CoreError::InvalidTxnState);
        }
        let request = Message::new(0, codec::M_XA_ROLLBACK).with_param(self.xid_param());
        self.call(request, cancel).await?;
        self.state.store(LocalState::RolledBack as u32, Ordering::Release);
        Ok(())
    }

    /// Issues XA `forget`, discarding any heuristic outcome the peer
    /// recorded for this branch. Idempotent: calling it more than once, or
    /// after the peer has already forgotten the branch, is not an error.
    ///
    /// # Errors
    /// Returns a transport/protocol error if the peer exchange itself
    /// fails; a peer report of "no such transaction" is treated as already
    /// forgotten rather than an error.
    pub async fn forget(&self, cancel: &CancellationToken) -> Result<(), CoreError> {
        let request = Message::new(0, codec::M_XA_FORGET).with_param(self.xid_param());
        match self.call(request, cancel).await {
            Ok(_) | Err(CoreError::XaerNota) => {
                self.state.store(LocalState::Forgotten as u32, Ordering::Release);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn xid_param(&self) -> Param {
        Param {
            id: codec::P_XA_XID,
            data: encode_xid(&self.xid),
        }
    }

    async fn call(&self, request: Message, cancel: &CancellationToken) -> Result<Message, CoreError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CoreError::OperationInterrupted),
            result = self.tracker.invoke(self.channel.as_ref(), request) => {
                Message::decode(&result?)
            }
        }
    }
}

/// Encodes an [`SimpleXid`] as `[format_id: i32 BE][global_len packed][global][branch]`
/// for carriage inside a [`Param`]'s payload.
fn encode_xid(xid: &SimpleXid) -> bytes::Bytes {
    let mut out = bytes::BytesMut::new();
    bytes::BufMut::put_i32(&mut out, xid.format_id());
    codec::encode_packed_u32(u32::try_from(xid.global_id().len()).unwrap_or(u32::MAX), &mut out);
    bytes::BufMut::put_slice(&mut out, xid.global_id());
    bytes::BufMut::put_slice(&mut out, xid.branch_id());
    out.freeze()
}
