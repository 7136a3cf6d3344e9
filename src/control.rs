//! Server-side control of one imported transaction's completion sequence
//! (spec §4.6, C7).
//!
//! When a peer outflows a transaction to this node, [`ImportedEntry`] is
//! what answers the peer's `prepare` / `commit` / `rollback` / `forget`
//! wire calls by driving the local engine's [`ManagedTransaction`]. The
//! completion-bit lattice exists so that a retried wire call (the peer never
//! saw our response and resends) is idempotent instead of re-running
//! `beforeCompletion` or double-committing.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::engine::{ManagedTransaction, PrepareOutcome};
use crate::error::CoreError;

bitflags! {
    /// Which phases of the completion sequence have already run for an
    /// imported transaction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompletionBits: u8 {
        /// `beforeCompletion` has run.
        const BEFORE_COMP = 0b001;
        /// Either `prepare` or `rollback` has run.
        const PREPARE_OR_ROLLBACK = 0b010;
        /// Either `commit` or `forget` has run.
        const COMMIT_OR_FORGET = 0b100;
    }
}

/// One imported transaction's completion state, shared between the
/// registry's lookup table and whatever verb calls arrive for it.
pub struct ImportedEntry {
    transaction: Arc<dyn ManagedTransaction>,
    completion: Mutex<CompletionBits>,
}

impl ImportedEntry {
    /// Wraps a freshly imported transaction with an empty completion state.
    #[must_use]
    pub fn new(transaction: Arc<dyn ManagedTransaction>) -> Self {
        Self {
            transaction,
            completion: Mutex::new(CompletionBits::empty()),
        }
    }

    /// The underlying managed transaction.
    #[must_use]
    pub fn transaction(&self) -> &Arc<dyn ManagedTransaction> { &self.transaction }

    fn completion(&self) -> CompletionBits {
        *self
            .completion
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_completion(&self, bits: CompletionBits) {
        self.completion
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(bits);
    }

    /// Runs `beforeCompletion`.
    ///
    /// # Errors
    /// Returns [`CoreError::XaerNota`] if `beforeCompletion` already ran for
    /// this entry, or [`CoreError::EngineError`] if the engine call fails.
    pub fn before_completion(&self) -> Result<(), CoreError> {
        if self.completion().contains(CompletionBits::BEFORE_COMP) {
            return Err(CoreError::XaerNota);
        }
        self.transaction.do_before_completion()?;
        self.set_completion(CompletionBits::BEFORE_COMP);
        Ok(())
    }

    /// Runs `prepare`, running `beforeCompletion` first.
    ///
    /// # Errors
    /// Returns [`CoreError::XaerNota`] if the branch already resolved via a
    /// prior `prepare` or `rollback`, or an engine-reported error otherwise.
    pub fn prepare(&self) -> Result<PrepareOutcome, CoreError> {
        if self.completion().contains(CompletionBits::PREPARE_OR_ROLLBACK) {
            return Err(CoreError::XaerNota);
        }
        if !self.completion().contains(CompletionBits::BEFORE_COMP) {
            self.transaction.do_before_completion()?;
        }
        let outcome = self.transaction.do_prepare()?;
        self.set_completion(CompletionBits::PREPARE_OR_ROLLBACK | CompletionBits::BEFORE_COMP);
        Ok(outcome)
    }

    /// Runs `rollback`.
    ///
    /// # Errors
    /// Returns [`CoreError::XaerNota`] if the branch already resolved via a
    /// prior `prepare` or `rollback`, or an engine-reported error otherwise.
    pub fn rollback(&self) -> Result<(), CoreError> {
        if self.completion().contains(CompletionBits::PREPARE_OR_ROLLBACK) {
            return Err(CoreError::XaerNota);
        }
        self.transaction.do_rollback()?;
        self.set_completion(CompletionBits::PREPARE_OR_ROLLBACK | CompletionBits::BEFORE_COMP);
        Ok(())
    }

    /// Runs `commit`.
    ///
    /// A one-phase commit additionally fails if `prepare`/`rollback` already
    /// ran (it must be the branch's only verb); a two-phase commit only
    /// requires that `commit`/`forget` hasn't already run.
    ///
    /// # Errors
    /// Returns [`CoreError::XaerNota`] if the relevant completion bits are
    /// already set, or an engine-reported error otherwise.
    pub fn commit(&self, one_phase: bool) -> Result<(), CoreError> {
        let forbidden = if one_phase {
            CompletionBits::PREPARE_OR_ROLLBACK | CompletionBits::COMMIT_OR_FORGET
        } else {
            CompletionBits::COMMIT_OR_FORGET
        };
        if self.completion().intersects(forbidden) {
            return Err(CoreError::XaerNota);
        }
        if one_phase {
            self.transaction.do_one_phase_commit()?;
        } else {
            self.transaction.do_commit()?;
        }
        self.set_completion(CompletionBits::all());
        Ok(())
    }

    /// Runs `forget`, discarding a heuristic outcome.
    ///
    /// # Errors
    /// Returns [`CoreError::XaerNota`] if the branch already resolved via a
    /// prior `commit` or `forget`, or an engine-reported error otherwise.
    pub fn forget(&self) -> Result<(), CoreError> {
        if self.completion().contains(CompletionBits::COMMIT_OR_FORGET) {
            return Err(CoreError::XaerNota);
        }
        self.transaction.do_forget()?;
        self.set_completion(CompletionBits::all());
        Ok(())
    }
}
