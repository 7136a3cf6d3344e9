//! Outflow enlistment accounting for a single subordinate XA branch
//! (spec §4.5, C5).
//!
//! When a transaction outflows to the same peer more than once, every
//! `XAResource` handed to the local engine for that peer shares one branch
//! rather than opening a second one: the branch only needs to be
//! committed/rolled back once, no matter how many local resources got
//! enlisted against it. The bookkeeping for "how many enlistments are still
//! open" and "has this branch already been told to commit" is lock-free,
//! packed into a single `AtomicU32` word so enlist and forget can race
//! without a mutex.
//!
//! Each [`XAOutflowHandle`] represents exactly one local resource's
//! enlistment against the branch. Its per-handle resolution — whether it
//! was forgotten, verified, or discovered not to be the master enlistment —
//! may happen at most once; a second resolution attempt on the same handle
//! is a caller bug and fails with [`CoreError::AlreadyForgotten`] or
//! [`CoreError::AlreadyEnlisted`] rather than silently succeeding again.
//! [`XAOutflowHandle::enlist_another`] mints a fresh handle sharing the same
//! underlying counter for exactly this purpose.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::CoreError;

/// Mask over the low 30 bits: the count of enlistment handles still open
/// against this branch.
const OPEN_COUNT_MASK: u32 = 0x3FFF_FFFF;
/// Set once this branch has been told to commit; no further enlistments are
/// accepted once set.
const COMMITTED_BIT: u32 = 0x4000_0000;
/// Set once at least one enlistment has verified this branch is still
/// talking to the same resource manager instance it started with.
const ANY_VERIFIED_BIT: u32 = 0x8000_0000;

fn open_count(word: u32) -> u32 { word & OPEN_COUNT_MASK }

/// Lock-free enlistment counter for one outflowed XA branch, plus one-shot
/// resolution state private to this particular handle.
pub struct XAOutflowHandle {
    word: Arc<AtomicU32>,
    resolved: AtomicBool,
}

impl XAOutflowHandle {
    /// Creates a handle for a freshly outflowed branch with one open
    /// enlistment (the caller that is outflowing it).
    #[must_use]
    pub fn new() -> Self {
        Self {
            word: Arc::new(AtomicU32::new(1)),
            resolved: AtomicBool::new(false),
        }
    }

    /// Registers one more local resource against this branch, returning a
    /// new handle for it that shares the same underlying counter.
    ///
    /// # Errors
    /// Returns [`CoreError::EnlistmentWindowClosed`] if the branch has
    /// already been committed — a fresh branch must be outflowed instead.
    pub fn enlist_another(&self) -> Result<Self, CoreError> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if current & COMMITTED_BIT != 0 {
                return Err(CoreError::EnlistmentWindowClosed);
            }
            let next = current + 1;
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(Self {
                        word: Arc::clone(&self.word),
                        resolved: AtomicBool::new(false),
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Resolves this handle exactly once, decrementing the open count and
    /// optionally setting `ANY_VERIFIED_BIT`.
    ///
    /// Returns the word's value immediately before this resolution took
    /// effect, so callers can derive their own return semantics from it.
    fn resolve_once(&self, already_resolved: CoreError, set_verified: bool) -> Result<u32, CoreError> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return Err(already_resolved);
        }
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            debug_assert!(open_count(current) > 0, "resolve with no open enlistments");
            let mut next = (current & !OPEN_COUNT_MASK) | open_count(current).saturating_sub(1);
            if set_verified {
                next |= ANY_VERIFIED_BIT;
            }
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(observed) => current = observed,
            }
        }
    }

    /// Resolves this handle by marking that it verified the branch is still
    /// served by the same resource manager instance it was outflowed to.
    ///
    /// Returns `true` if this was the first enlistment on the branch to
    /// verify.
    ///
    /// # Errors
    /// Returns [`CoreError::AlreadyEnlisted`] if this handle has already
    /// been resolved (by `verify`, `non_master_one`, or `forget_one`).
    pub fn verify(&self) -> Result<bool, CoreError> {
        let before = self.resolve_once(CoreError::AlreadyEnlisted, true)?;
        Ok(before & ANY_VERIFIED_BIT == 0)
    }

    /// Resolves this handle by marking that it discovered it is not talking
    /// to the branch's master resource manager instance, without verifying
    /// anything about the branch itself.
    ///
    /// # Errors
    /// Returns [`CoreError::AlreadyEnlisted`] if this handle has already
    /// been resolved.
    pub fn non_master_one(&self) -> Result<(), CoreError> {
        self.resolve_once(CoreError::AlreadyEnlisted, false)?;
        Ok(())
    }

    /// Whether any enlistment has verified this branch.
    #[must_use]
    pub fn any_verified(&self) -> bool {
        self.word.load(Ordering::Acquire) & ANY_VERIFIED_BIT != 0
    }

    /// Releases this handle's open enlistment, e.g. because the local
    /// engine dropped the resource without ever needing to commit or roll
    /// it back.
    ///
    /// Returns `true` if this was the last open enlistment and the branch
    /// was never committed, meaning it can be discarded outright rather
    /// than contacted.
    ///
    /// # Errors
    /// Returns [`CoreError::AlreadyForgotten`] if this handle has already
    /// been resolved.
    pub fn forget_one(&self) -> Result<bool, CoreError> {
        let before = self.resolve_once(CoreError::AlreadyForgotten, false)?;
        Ok(open_count(before) - 1 == 0 && before & COMMITTED_BIT == 0)
    }

    /// Attempts to claim responsibility for actually committing this
    /// branch on the wire.
    ///
    /// Only the first caller across every enlistment wins the race and must
    /// perform the network commit; later callers observe the branch already
    /// committed and should treat their own commit call as a no-op success.
    ///
    /// # Errors
    /// Returns [`CoreError::AlreadyEnlisted`] if the branch was already
    /// committed by a previous winner — callers that need to distinguish
    /// "I must commit" from "already done" should match on `Ok(true)` vs.
    /// `Ok(false)`, not on this error; it is reserved for defensive callers
    /// that require committing to be impossible to retry.
    pub fn try_begin_commit(&self) -> Result<bool, CoreError> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if current & COMMITTED_BIT != 0 {
                return Ok(false);
            }
            let next = current | COMMITTED_BIT;
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(true),
                Err(observed) => current = observed,
            }
        }
    }

    /// The number of enlistments still open against this branch.
    #[must_use]
    pub fn open_count(&self) -> u32 { open_count(self.word.load(Ordering::Acquire)) }

    /// Whether this branch has already been committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.word.load(Ordering::Acquire) & COMMITTED_BIT != 0
    }
}

impl Default for XAOutflowHandle {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn enlist_another_increments_open_count() {
        let handle = XAOutflowHandle::new();
        let second = handle.enlist_another().expect("not yet committed");
        assert_eq!(handle.open_count(), 2);
        assert_eq!(second.open_count(), 2);
    }

    #[test]
    fn enlist_after_commit_is_rejected() {
        let handle = XAOutflowHandle::new();
        assert!(handle.try_begin_commit().expect("wins race"));
        let err = handle.enlist_another().expect_err("window closed");
        assert!(matches!(err, CoreError::EnlistmentWindowClosed));
    }

    #[test]
    fn only_first_caller_wins_commit_race() {
        let handle = XAOutflowHandle::new();
        assert!(handle.try_begin_commit().expect("first wins"));
        assert!(!handle.try_begin_commit().expect("second observes done"));
    }

    #[test]
    fn forget_one_reports_last_enlistment_when_never_committed() {
        let handle = XAOutflowHandle::new();
        let second = handle.enlist_another().expect("enlist");
        assert!(!handle.forget_one().expect("first forget"), "one enlistment still open");
        assert!(second.forget_one().expect("last forget"), "last enlistment, never committed");
    }

    #[test]
    fn forget_one_after_commit_does_not_report_discardable() {
        let handle = XAOutflowHandle::new();
        assert!(handle.try_begin_commit().expect("commits"));
        assert!(!handle.forget_one().expect("forget"), "branch was committed, not discardable");
    }

    #[test]
    fn verify_reports_first_caller_only() {
        let handle = XAOutflowHandle::new();
        let second = handle.enlist_another().expect("enlist");
        assert!(handle.verify().expect("first verify"));
        assert!(!second.verify().expect("second verify"));
        assert!(handle.any_verified());
    }

    #[test]
    fn forget_one_is_one_shot_per_handle() {
        let handle = XAOutflowHandle::new();
        handle.forget_one().expect("first forget");
        let err = handle.forget_one().expect_err("already resolved");
        assert!(matches!(err, CoreError::AlreadyForgotten));
    }

    #[test]
    fn verify_is_one_shot_per_handle() {
        let handle = XAOutflowHandle::new();
        handle.verify().expect("first verify");
        let err = handle.verify().expect_err("already resolved");
        assert!(matches!(err, CoreError::AlreadyEnlisted));
    }

    #[test]
    fn non_master_one_is_one_shot_and_does_not_set_verified() {
        let handle = XAOutflowHandle::new();
        handle.non_master_one().expect("first resolution");
        assert!(!handle.any_verified());
        let err = handle.non_master_one().expect_err("already resolved");
        assert!(matches!(err, CoreError::AlreadyEnlisted));
    }

    #[test]
    fn concurrent_enlist_and_forget_never_underflows() {
        let handle = XAOutflowHandle::new();
        let mut handles: Vec<XAOutflowHandle> = Vec::new();
        thread::scope(|scope| {
            let tasks: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| handle.enlist_another().expect("enlist")))
                .collect();
            for task in tasks {
                handles.push(task.join().expect("enlist thread"));
            }
        });
        assert_eq!(handle.open_count(), 9);
        handles.push(handle);
        thread::scope(|scope| {
            for h in &handles {
                scope.spawn(move || {
                    h.forget_one().expect("forget");
                });
            }
        });
        assert_eq!(handles[0].open_count(), 0);
    }
}
