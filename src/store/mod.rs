//! Versioned, thread-safe storage for the flag dataset.

mod memory;
pub(crate) mod sort;

pub use memory::InMemoryDataStore;

use std::collections::HashMap;

use serde::Deserialize;

use crate::eval::FlagLookup;
use crate::model::{FeatureFlag, Segment};

/// The kinds of data the store holds. Segments sort before flags on init
/// because flags depend on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    /// Segment data.
    Segment,
    /// Feature flag data.
    Flag,
}

/// Data items that carry a version and a deletion marker.
pub trait Versioned {
    /// The item's version.
    fn version(&self) -> u64;
    /// Whether the item is a deletion marker.
    fn is_deleted(&self) -> bool;
}

impl Versioned for FeatureFlag {
    fn version(&self) -> u64 {
        self.version
    }
    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl Versioned for Segment {
    fn version(&self) -> u64 {
        self.version
    }
    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// A store entry: either a live item or a tombstone left by a deletion.
///
/// Tombstones are invisible to readers but keep their version so that a
/// lower-versioned update cannot revive the item.
#[derive(Debug, Clone)]
pub enum StorageItem<T> {
    /// A live item.
    Item(T),
    /// A versioned deletion marker.
    Tombstone(u64),
}

impl<T: Versioned> StorageItem<T> {
    pub(crate) fn version(&self) -> u64 {
        match self {
            StorageItem::Item(item) => item.version(),
            StorageItem::Tombstone(version) => *version,
        }
    }

    pub(crate) fn live(&self) -> Option<&T> {
        match self {
            StorageItem::Item(item) => Some(item),
            StorageItem::Tombstone(_) => None,
        }
    }
}

impl<T: Versioned> From<T> for StorageItem<T> {
    // An incoming item already marked deleted is stored as a tombstone.
    fn from(item: T) -> Self {
        if item.is_deleted() {
            StorageItem::Tombstone(item.version())
        } else {
            StorageItem::Item(item)
        }
    }
}

/// A full dataset, as served by the polling endpoint and the stream's `put`
/// event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllData {
    /// All flags, keyed by flag key.
    #[serde(default)]
    pub flags: HashMap<String, FeatureFlag>,
    /// All segments, keyed by segment key.
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}

/// A single-item update from the data source pipeline.
#[derive(Debug, Clone)]
pub enum PatchTarget {
    /// A flag upsert (or tombstone).
    Flag(StorageItem<FeatureFlag>),
    /// A segment upsert (or tombstone).
    Segment(StorageItem<Segment>),
}

/// The store contract used by the evaluator (reads) and the data source
/// pipeline (writes).
///
/// Reads must be cheap snapshots; writers serialize among themselves. A
/// reader observing one write of an `init` sequence observes every write
/// sorted before it.
pub trait DataStore: FlagLookup + Send + Sync {
    /// All live flags, excluding tombstones.
    fn all_flags(&self) -> HashMap<String, FeatureFlag>;

    /// Atomically replaces the entire contents. After the first `init` the
    /// store reports itself initialized.
    fn init(&self, data: AllData);

    /// Stores the item if the slot is empty or holds a strictly older
    /// version; otherwise the update is ignored.
    fn upsert(&self, key: &str, item: PatchTarget);

    /// Equivalent to upserting a tombstone at the given version.
    fn delete(&self, kind: DataKind, key: &str, version: u64);

    /// Whether an initial dataset has been stored.
    fn initialized(&self) -> bool;
}

impl FlagLookup for std::sync::Arc<dyn DataStore> {
    fn flag(&self, key: &str) -> Option<FeatureFlag> {
        (**self).flag(key)
    }
    fn segment(&self, key: &str) -> Option<Segment> {
        (**self).segment(key)
    }
}
