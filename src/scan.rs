//! Scan result bookkeeping.
//!
//! Advertisements repeat for as long as a peripheral is in range; the
//! result set keeps one entry per identity so UI lists stay stable. A
//! repeat advertisement refreshes the stored entry (name and RSSI drift
//! between packets) without moving it.

use std::collections::HashMap;

use crate::transport::{Advertisement, PeripheralIdentity};

/// Deduplicated, insertion-ordered set of scan observations.
#[derive(Debug, Clone, Default)]
pub struct ScanResults {
    entries: Vec<Advertisement>,
    index: HashMap<String, usize>,
}

impl ScanResults {
    /// Create an empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an advertisement.
    ///
    /// Returns `true` when the identity is new to this scan window.
    pub fn insert(&mut self, advertisement: Advertisement) -> bool {
        match self.index.get(&advertisement.identity.id) {
            Some(&position) => {
                self.entries[position] = advertisement;
                false
            }
            None => {
                self.index
                    .insert(advertisement.identity.id.clone(), self.entries.len());
                self.entries.push(advertisement);
                true
            }
        }
    }

    /// All entries in the order their identities first appeared.
    pub fn entries(&self) -> &[Advertisement] {
        &self.entries
    }

    /// Identities in first-appearance order.
    pub fn identities(&self) -> impl Iterator<Item = &PeripheralIdentity> {
        self.entries.iter().map(|e| &e.identity)
    }

    /// Look up an entry by its platform identifier.
    pub fn find(&self, id: &str) -> Option<&Advertisement> {
        self.index.get(id).map(|&position| &self.entries[position])
    }

    /// Check if an identity has been observed this window.
    pub fn contains(&self, identity: &PeripheralIdentity) -> bool {
        self.index.contains_key(&identity.id)
    }

    /// Number of distinct identities observed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing has been observed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything. Called when a new scan window opens.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}
