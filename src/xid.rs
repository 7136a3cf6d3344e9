//! Global transaction identifiers and the eviction keys derived from them.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Length of the UID prefix that node-name-bearing format ids embed ahead of
/// the node name (spec §6, "Node-name extraction from Xid").
const NODE_NAME_UID_LEN: usize = 28;

/// Format ids whose global transaction id is `[28-byte UID][UTF-8 node name]`.
const NODE_NAME_FORMAT_IDS: [i32; 3] = [0x2_0000, 0x2_0005, 0x2_0008];

/// An immutable XA transaction identifier.
///
/// Equality and ordering are byte-lexicographic across
/// `(format_id, global_id, branch_id)`, matching the wire representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimpleXid {
    format_id: i32,
    global_id: Vec<u8>,
    branch_id: Vec<u8>,
}

impl SimpleXid {
    /// Construct a new identifier from its three XA fields.
    #[must_use]
    pub const fn new(format_id: i32, global_id: Vec<u8>, branch_id: Vec<u8>) -> Self {
        Self {
            format_id,
            global_id,
            branch_id,
        }
    }

    /// The XA format id.
    #[must_use]
    pub const fn format_id(&self) -> i32 { self.format_id }

    /// The global transaction id portion.
    #[must_use]
    pub fn global_id(&self) -> &[u8] { &self.global_id }

    /// The branch qualifier portion.
    #[must_use]
    pub fn branch_id(&self) -> &[u8] { &self.branch_id }

    /// Returns this identifier with the branch qualifier cleared — the
    /// **global tid** (gtid) used to key imported transactions.
    #[must_use]
    pub fn without_branch(&self) -> Self {
        Self {
            format_id: self.format_id,
            global_id: self.global_id.clone(),
            branch_id: Vec::new(),
        }
    }

    /// Extracts the node name embedded in the global id, if this xid's
    /// format id is one of the node-name-bearing formats and the global id
    /// is long enough to carry one.
    ///
    /// See spec §6: for format ids `{0x20000, 0x20005, 0x20008}` the global
    /// transaction id is `[28-byte UID][UTF-8 node name]`; shorter global ids
    /// or other format ids yield no name.
    #[must_use]
    pub fn node_name(&self) -> Option<String> {
        if !NODE_NAME_FORMAT_IDS.contains(&self.format_id) {
            return None;
        }
        let suffix = self.global_id.get(NODE_NAME_UID_LEN..)?;
        if suffix.is_empty() {
            return None;
        }
        String::from_utf8(suffix.to_vec()).ok()
    }
}

impl PartialOrd for SimpleXid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for SimpleXid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.format_id
            .cmp(&other.format_id)
            .then_with(|| self.global_id.cmp(&other.global_id))
            .then_with(|| self.branch_id.cmp(&other.branch_id))
    }
}

/// Eviction key for the imported-transaction registry: orders by expiration
/// first so the registry can sweep a contiguous stale prefix, then by gtid
/// to keep the set total-ordered even when two entries share an expiration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XidKey {
    /// Monotonic instant, in nanoseconds since the registry's epoch, after
    /// which no peer should still be referencing this gtid.
    pub expiration_ns: u64,
    /// The gtid this key tracks.
    pub gtid: SimpleXid,
}

impl PartialOrd for XidKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for XidKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expiration_ns
            .cmp(&other.expiration_ns)
            .then_with(|| self.gtid.cmp(&other.gtid))
    }
}
