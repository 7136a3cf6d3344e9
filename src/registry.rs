//! Bounded-lifetime registry of transactions imported from peers
//! (spec §4.6, C6).
//!
//! Keyed by gtid (the xid with its branch qualifier cleared), so that every
//! branch a peer outflows under the same global transaction resolves to one
//! [`ImportedEntry`] and one call into the local engine. Entries outlive
//! local completion for a stale window so that a peer's retried `commit`/
//! `forget` (sent before it saw our response) still finds something to
//! answer, instead of getting `XAER_NOTA` for a transaction this node
//! actually already finished.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use crate::control::ImportedEntry;
use crate::engine::{Synchronization, XaTerminator};
use crate::error::CoreError;
use crate::xid::{SimpleXid, XidKey};

/// Registry of transactions this node holds as a subordinate on behalf of a
/// peer.
pub struct ImportRegistry {
    entries: RwLock<HashMap<SimpleXid, Arc<ImportedEntry>>>,
    expirations: Mutex<BTreeSet<XidKey>>,
    epoch: Instant,
    stale_window: Duration,
    terminator: Arc<dyn XaTerminator>,
    self_ref: Weak<ImportRegistry>,
}

/// Interposed `afterCompletion` hook that sweeps the registry's stale
/// entries once the local transaction for one imported gtid finishes, one
/// way or the other (spec §4.6 step 5).
struct SweepOnCompletion {
    registry: Weak<ImportRegistry>,
    gtid: SimpleXid,
}

impl Synchronization for SweepOnCompletion {
    fn after_completion(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.mark_complete(&self.gtid);
            registry.sweep();
        }
    }
}

impl ImportRegistry {
    /// Creates a registry backed by `terminator`, evicting entries
    /// `stale_window` after they complete locally.
    #[must_use]
    pub fn new(terminator: Arc<dyn XaTerminator>, stale_window: Duration) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            entries: RwLock::new(HashMap::new()),
            expirations: Mutex::new(BTreeSet::new()),
            epoch: Instant::now(),
            stale_window,
            terminator,
            self_ref: self_ref.clone(),
        })
    }

    fn entries_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SimpleXid, Arc<ImportedEntry>>> {
        self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn entries_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SimpleXid, Arc<ImportedEntry>>> {
        self.entries.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Looks up an already-imported transaction by gtid, without importing.
    #[must_use]
    pub fn find_existing(&self, gtid: &SimpleXid) -> Option<Arc<ImportedEntry>> {
        self.entries_read().get(gtid).cloned()
    }

    /// Finds the entry for `xid`'s gtid, importing it from the engine if
    /// this is the first time this node has seen it.
    ///
    /// # Errors
    /// Returns whatever [`XaTerminator::import_transaction`] reports if the
    /// engine cannot import the transaction.
    pub fn find_or_import(
        &self,
        xid: &SimpleXid,
        timeout_secs: u32,
    ) -> Result<Arc<ImportedEntry>, CoreError> {
        let gtid = xid.without_branch();
        if let Some(entry) = self.find_existing(&gtid) {
            return Ok(entry);
        }

        let mut entries = self.entries_write();
        if let Some(entry) = entries.get(&gtid) {
            return Ok(Arc::clone(entry));
        }
        let (transaction, _imported) = match self.terminator.import_transaction(xid, timeout_secs, false) {
            Ok(imported) => imported,
            Err(err) => {
                tracing::warn!(code = err.code(), "failed to import transaction from peer");
                return Err(err);
            }
        };
        transaction.register_interposed_synchronization(Box::new(SweepOnCompletion {
            registry: self.self_ref.clone(),
            gtid: gtid.clone(),
        }));
        tracing::debug!(?gtid, "imported transaction from peer");
        let entry = Arc::new(ImportedEntry::new(transaction));
        entries.insert(gtid, Arc::clone(&entry));
        Ok(entry)
    }

    /// Runs `commit` against the imported entry for `gtid`.
    ///
    /// # Errors
    /// Returns [`CoreError::XaerNota`] if `gtid` isn't a known imported
    /// transaction, or whatever [`ImportedEntry::commit`] reports otherwise.
    pub fn commit(&self, gtid: &SimpleXid, one_phase: bool) -> Result<(), CoreError> {
        self.find_existing(gtid).ok_or(CoreError::XaerNota)?.commit(one_phase)
    }

    /// Runs `rollback` against the imported entry for `gtid`.
    ///
    /// # Errors
    /// Returns [`CoreError::XaerNota`] if `gtid` isn't a known imported
    /// transaction, or whatever [`ImportedEntry::rollback`] reports
    /// otherwise.
    pub fn rollback(&self, gtid: &SimpleXid) -> Result<(), CoreError> {
        self.find_existing(gtid).ok_or(CoreError::XaerNota)?.rollback()
    }

    /// Runs `forget` against the imported entry for `gtid`.
    ///
    /// # Errors
    /// Returns [`CoreError::XaerNota`] if `gtid` isn't a known imported
    /// transaction, or whatever [`ImportedEntry::forget`] reports otherwise.
    pub fn forget(&self, gtid: &SimpleXid) -> Result<(), CoreError> {
        self.find_existing(gtid).ok_or(CoreError::XaerNota)?.forget()
    }

    /// Rejects an explicit local commit/rollback attempt against `gtid` if
    /// this node is holding it only as a subordinate for a peer — an
    /// imported transaction can only be resolved by that peer's 2PC verbs,
    /// never by a local caller (spec: `CommitOnImported` / `RollbackOnImported`).
    ///
    /// # Errors
    /// Returns `on_imported` if `gtid` is registered as imported.
    pub fn reject_if_imported(
        &self,
        gtid: &SimpleXid,
        on_imported: CoreError,
    ) -> Result<(), CoreError> {
        if self.find_existing(gtid).is_some() {
            return Err(on_imported);
        }
        Ok(())
    }

    /// Marks `gtid` as locally complete, scheduling its entry for eviction
    /// after the stale window rather than removing it immediately.
    pub fn mark_complete(&self, gtid: &SimpleXid) {
        let expiration_ns = u64::try_from(
            self.epoch.elapsed().saturating_add(self.stale_window).as_nanos(),
        )
        .unwrap_or(u64::MAX);
        self.expirations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(XidKey {
                expiration_ns,
                gtid: gtid.clone(),
            });
    }

    /// Evicts every entry whose stale window has elapsed as of now, telling
    /// the engine to drop its own bookkeeping for each.
    ///
    /// Returns the number of entries evicted.
    pub fn sweep(&self) -> usize {
        let now_ns = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let mut expired = Vec::new();
        {
            let mut expirations = self
                .expirations
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            while let Some(key) = expirations.iter().next().cloned() {
                if key.expiration_ns > now_ns {
                    break;
                }
                expirations.remove(&key);
                expired.push(key.gtid);
            }
        }
        let count = expired.len();
        if count > 0 {
            let mut entries = self.entries_write();
            for gtid in &expired {
                entries.remove(gtid);
            }
            drop(entries);
            for gtid in &expired {
                self.terminator.remove_imported_transaction(gtid);
            }
            tracing::debug!(count, "evicted stale imported transaction entries");
        }
        count
    }

    /// The in-doubt transactions the engine can recover for `parent_name`.
    #[must_use]
    pub fn recover(&self, parent_name: &str) -> Vec<SimpleXid> { self.terminator.recover(parent_name) }

    /// Number of entries currently tracked, imported or pending eviction.
    #[must_use]
    pub fn len(&self) -> usize { self.entries_read().len() }

    /// Whether the registry currently tracks no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries_read().is_empty() }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::engine::{ManagedTransaction, PrepareOutcome, Synchronization};

    struct StubTransaction {
        xid: SimpleXid,
        sync: StdMutex<Option<Box<dyn Synchronization>>>,
    }

    impl StubTransaction {
        fn new(xid: SimpleXid) -> Self {
            Self {
                xid,
                sync: StdMutex::new(None),
            }
        }

        /// Invokes whatever `afterCompletion` hook the registry interposed on
        /// this transaction, as the engine would once the branch resolves.
        fn fire_after_completion(&self) {
            if let Some(sync) = self.sync.lock().expect("lock").as_ref() {
                sync.after_completion();
            }
        }
    }

    impl ManagedTransaction for StubTransaction {
        fn xid(&self) -> SimpleXid { self.xid.clone() }

        fn timeout_secs(&self) -> u32 { 60 }

        fn register_interposed_synchronization(&self, sync: Box<dyn Synchronization>) {
            *self.sync.lock().expect("lock") = Some(sync);
        }

        fn put_local_resource(&self, _key: &'static str, _value: Box<dyn std::any::Any + Send + Sync>) {}

        fn has_local_resource(&self, _key: &'static str) -> bool { false }

        fn do_before_completion(&self) -> Result<(), CoreError> { Ok(()) }

        fn do_prepare(&self) -> Result<PrepareOutcome, CoreError> { Ok(PrepareOutcome::Ok) }

        fn do_commit(&self) -> Result<(), CoreError> { Ok(()) }

        fn do_one_phase_commit(&self) -> Result<(), CoreError> { Ok(()) }

        fn do_rollback(&self) -> Result<(), CoreError> { Ok(()) }

        fn do_forget(&self) -> Result<(), CoreError> { Ok(()) }
    }

    struct StubTerminator {
        imports: StdMutex<u32>,
        removed: StdMutex<Vec<SimpleXid>>,
        last_transaction: StdMutex<Option<Arc<StubTransaction>>>,
    }

    impl XaTerminator for StubTerminator {
        fn import_transaction(
            &self,
            xid: &SimpleXid,
            _timeout_secs: u32,
            _do_not_import: bool,
        ) -> Result<(Arc<dyn ManagedTransaction>, bool), CoreError> {
            *self.imports.lock().expect("lock") += 1;
            let transaction = Arc::new(StubTransaction::new(xid.clone()));
            *self.last_transaction.lock().expect("lock") = Some(Arc::clone(&transaction));
            Ok((transaction, true))
        }

        fn get_transaction(&self, _gtid: &SimpleXid) -> Option<Arc<dyn ManagedTransaction>> { None }

        fn remove_imported_transaction(&self, gtid: &SimpleXid) {
            self.removed.lock().expect("lock").push(gtid.clone());
        }

        fn recover(&self, _parent_name: &str) -> Vec<SimpleXid> { Vec::new() }
    }

    fn xid(branch: &[u8]) -> SimpleXid { SimpleXid::new(1, b"gtid".to_vec(), branch.to_vec()) }

    fn stub_terminator() -> Arc<StubTerminator> {
        Arc::new(StubTerminator {
            imports: StdMutex::new(0),
            removed: StdMutex::new(Vec::new()),
            last_transaction: StdMutex::new(None),
        })
    }

    #[test]
    fn find_or_import_imports_once_per_gtid() {
        let terminator = stub_terminator();
        let registry = ImportRegistry::new(terminator.clone(), Duration::from_secs(1));

        registry.find_or_import(&xid(b"a"), 60).expect("import");
        registry.find_or_import(&xid(b"b"), 60).expect("same gtid, cached");

        assert_eq!(*terminator.imports.lock().expect("lock"), 1);
    }

    #[test]
    fn reject_if_imported_blocks_local_commit() {
        let terminator = stub_terminator();
        let registry = ImportRegistry::new(terminator, Duration::from_secs(1));
        let gtid = xid(b"").without_branch();

        registry.find_or_import(&xid(b"a"), 60).expect("import");
        let err = registry
            .reject_if_imported(&gtid, CoreError::CommitOnImported)
            .expect_err("is imported");
        assert!(matches!(err, CoreError::CommitOnImported));
    }

    #[test]
    fn commit_delegates_to_the_imported_entry() {
        let terminator = stub_terminator();
        let registry = ImportRegistry::new(terminator, Duration::from_secs(1));
        let gtid = xid(b"").without_branch();
        registry.find_or_import(&xid(b"a"), 60).expect("import");

        registry.commit(&gtid, false).expect("commit delegates");
    }

    #[test]
    fn rollback_delegates_to_the_imported_entry() {
        let terminator = stub_terminator();
        let registry = ImportRegistry::new(terminator, Duration::from_secs(1));
        let gtid = xid(b"").without_branch();
        registry.find_or_import(&xid(b"a"), 60).expect("import");

        registry.rollback(&gtid).expect("rollback delegates");
    }

    #[test]
    fn forget_delegates_to_the_imported_entry() {
        let terminator = stub_terminator();
        let registry = ImportRegistry::new(terminator, Duration::from_secs(1));
        let gtid = xid(b"").without_branch();
        registry.find_or_import(&xid(b"a"), 60).expect("import");

        registry.forget(&gtid).expect("forget delegates");
    }

    #[test]
    fn commit_rollback_forget_on_unknown_gtid_is_xaer_nota() {
        let terminator = stub_terminator();
        let registry = ImportRegistry::new(terminator, Duration::from_secs(1));
        let unknown = xid(b"").without_branch();

        assert!(matches!(registry.commit(&unknown, false), Err(CoreError::XaerNota)));
        assert!(matches!(registry.rollback(&unknown), Err(CoreError::XaerNota)));
        assert!(matches!(registry.forget(&unknown), Err(CoreError::XaerNota)));
    }

    #[test]
    fn after_completion_hook_sweeps_the_entry_once_the_engine_fires_it() {
        let terminator = stub_terminator();
        let registry = ImportRegistry::new(terminator.clone(), Duration::from_millis(1));
        let gtid = xid(b"").without_branch();
        registry.find_or_import(&xid(b"a"), 60).expect("import");

        let transaction = terminator
            .last_transaction
            .lock()
            .expect("lock")
            .clone()
            .expect("transaction was imported");
        thread::sleep(Duration::from_millis(5));
        transaction.fire_after_completion();

        assert!(registry.is_empty(), "hook should mark complete and sweep");
        assert_eq!(terminator.removed.lock().expect("lock").as_slice(), &[gtid]);
    }

    #[test]
    fn sweep_evicts_only_after_stale_window_elapses() {
        let terminator = stub_terminator();
        let registry = ImportRegistry::new(terminator.clone(), Duration::from_millis(20));
        let gtid = xid(b"").without_branch();
        registry.find_or_import(&xid(b"a"), 60).expect("import");
        registry.mark_complete(&gtid);

        assert_eq!(registry.sweep(), 0, "stale window hasn't elapsed yet");
        thread::sleep(Duration::from_millis(40));
        assert_eq!(registry.sweep(), 1);
        assert!(registry.is_empty());
        assert_eq!(terminator.removed.lock().expect("lock").as_slice(), &[gtid]);
    }
}
