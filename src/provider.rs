//! Provider registry: maps a peer URL's scheme to the object that knows how
//! to reach it (spec §4.7/§6, C8).
//!
//! Providers are registered by scheme (e.g. `remote+http`, `remote+https`)
//! rather than by full URL, since one provider typically serves every peer
//! reachable under a transport family.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use url::Url;

use crate::control::ImportedEntry;
use crate::engine::RemoteTransactionProvider;
use crate::error::CoreError;

/// Outcome of resolving an imported transaction through the registry: the
/// entry itself, plus whether this call performed a fresh import (as
/// opposed to finding one already in flight for the same gtid).
#[derive(Clone)]
pub struct ImportResult {
    /// The resolved entry.
    pub entry: Arc<ImportedEntry>,
    /// Whether this call imported the transaction for the first time.
    pub newly_imported: bool,
}

/// Registry of [`RemoteTransactionProvider`]s, keyed by URL scheme.
pub struct ProviderRegistry {
    by_scheme: RwLock<HashMap<String, Arc<dyn RemoteTransactionProvider>>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self { Self { by_scheme: RwLock::new(HashMap::new()) } }

    /// Registers `provider` under its own [`RemoteTransactionProvider::scheme`].
    ///
    /// Replaces any provider previously registered for the same scheme.
    pub fn register(&self, provider: Arc<dyn RemoteTransactionProvider>) {
        self.by_scheme
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(provider.scheme().to_owned(), provider);
    }

    /// Looks up the provider registered for `name` (a scheme string), used
    /// when an operation names a provider explicitly rather than deriving
    /// it from a peer URL.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownProvider`] if no provider is registered
    /// under that name.
    pub fn by_name(&self, name: &str) -> Result<Arc<dyn RemoteTransactionProvider>, CoreError> {
        self.by_scheme
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownProvider(name.to_owned()))
    }

    /// Looks up the provider that can reach `url`, by its scheme.
    ///
    /// # Errors
    /// Returns [`CoreError::NoProviderForUri`] if no provider is registered
    /// for the URL's scheme.
    pub fn for_url(&self, url: &Url) -> Result<Arc<dyn RemoteTransactionProvider>, CoreError> {
        self.by_scheme
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(url.scheme())
            .cloned()
            .ok_or_else(|| CoreError::NoProviderForUri(url.to_string()))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self { Self::new() }
}
