//! Tunables the core needs by value rather than as hard-coded constants.
//!
//! Loading these from a file, environment, or CLI is explicitly out of
//! scope (spec §1) — that's the job of the builder/config layer the
//! application wires around this crate. [`CoreConfig`] is the seam such a
//! layer fills in.

use serde::{Deserialize, Serialize};

/// Default transaction timeout, in seconds: 12 hours.
pub const DEFAULT_TXN_TIMEOUT_SECS: u32 = 43_200;
/// Default stale window, in seconds, that an imported transaction's entry
/// survives past local completion (spec §4.6).
pub const DEFAULT_STALE_WINDOW_SECS: u64 = 600;

/// Runtime tunables for the transaction core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Default XA branch timeout applied when a caller doesn't override it,
    /// and the value `setTransactionTimeout(0)` resets to.
    pub default_txn_timeout_secs: u32,
    /// How long an imported transaction's registry entry survives after the
    /// local transaction completes, to answer late peer retries/recovery
    /// queries.
    pub stale_window_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_txn_timeout_secs: DEFAULT_TXN_TIMEOUT_SECS,
            stale_window_secs: DEFAULT_STALE_WINDOW_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.default_txn_timeout_secs, 43_200);
        assert_eq!(cfg.stale_window_secs, 600);
    }
}
