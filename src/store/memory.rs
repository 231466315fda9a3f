//! The default in-memory store.
//!
//! Readers load an immutable snapshot through an atomic pointer, so reads are
//! wait-free and always observe a consistent dataset. Writers serialize on a
//! mutex, build a new snapshot, and swap it in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::eval::FlagLookup;
use crate::model::{FeatureFlag, Segment};

use super::sort::dependency_ordered_flags;
use super::{AllData, DataKind, DataStore, PatchTarget, StorageItem, Versioned};

#[derive(Default)]
struct Contents {
    flags: HashMap<String, StorageItem<FeatureFlag>>,
    segments: HashMap<String, StorageItem<Segment>>,
}

/// Thread-safe in-memory [`DataStore`] keyed by `(kind, key)`.
pub struct InMemoryDataStore {
    contents: ArcSwap<Contents>,
    // Writers serialize here; the guard is held across load-modify-swap.
    write_lock: Mutex<()>,
    initialized: AtomicBool,
}

impl InMemoryDataStore {
    /// Creates an empty, uninitialized store.
    pub fn new() -> Self {
        InMemoryDataStore {
            contents: ArcSwap::new(Arc::new(Contents::default())),
            write_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
        }
    }

    fn upsert_into<T: Versioned + Clone>(
        map: &HashMap<String, StorageItem<T>>,
        key: &str,
        item: StorageItem<T>,
    ) -> Option<HashMap<String, StorageItem<T>>> {
        if let Some(existing) = map.get(key) {
            if existing.version() >= item.version() {
                return None;
            }
        }
        let mut updated = map.clone();
        updated.insert(key.to_owned(), item);
        Some(updated)
    }
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        InMemoryDataStore::new()
    }
}

impl FlagLookup for InMemoryDataStore {
    fn flag(&self, key: &str) -> Option<FeatureFlag> {
        self.contents.load().flags.get(key)?.live().cloned()
    }

    fn segment(&self, key: &str) -> Option<Segment> {
        self.contents.load().segments.get(key)?.live().cloned()
    }
}

impl DataStore for InMemoryDataStore {
    fn all_flags(&self) -> HashMap<String, FeatureFlag> {
        self.contents
            .load()
            .flags
            .iter()
            .filter_map(|(key, item)| Some((key.clone(), item.live()?.clone())))
            .collect()
    }

    fn init(&self, data: AllData) {
        let _guard = self
            .write_lock
            .lock()
            .expect("thread holding store write lock should not panic");

        // Segments first, then flags after their prerequisites. For this
        // store a single swap makes the whole init atomic either way; the
        // ordering is the contract persistent stores rely on.
        let mut contents = Contents::default();
        for (key, segment) in data.segments {
            contents.segments.insert(key, segment.into());
        }
        for (key, flag) in dependency_ordered_flags(data.flags) {
            contents.flags.insert(key, flag.into());
        }

        self.contents.store(Arc::new(contents));
        self.initialized.store(true, Ordering::SeqCst);
    }

    fn upsert(&self, key: &str, item: PatchTarget) {
        let _guard = self
            .write_lock
            .lock()
            .expect("thread holding store write lock should not panic");

        let current = self.contents.load();
        let updated = match item {
            PatchTarget::Flag(item) => {
                Self::upsert_into(&current.flags, key, item).map(|flags| Contents {
                    flags,
                    segments: current.segments.clone(),
                })
            }
            PatchTarget::Segment(item) => {
                Self::upsert_into(&current.segments, key, item).map(|segments| Contents {
                    flags: current.flags.clone(),
                    segments,
                })
            }
        };

        match updated {
            Some(contents) => self.contents.store(Arc::new(contents)),
            None => {
                log::debug!(target: "darklaunch",
                    key;
                    "ignoring stale update");
            }
        }
    }

    fn delete(&self, kind: DataKind, key: &str, version: u64) {
        let item = match kind {
            DataKind::Flag => PatchTarget::Flag(StorageItem::Tombstone(version)),
            DataKind::Segment => PatchTarget::Segment(StorageItem::Tombstone(version)),
        };
        self.upsert(key, item);
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(key: &str, version: u64) -> FeatureFlag {
        serde_json::from_value(serde_json::json!({
            "key": key,
            "version": version,
            "on": true,
            "salt": "s",
            "variations": [true, false],
            "fallthrough": {"variation": 0},
        }))
        .unwrap()
    }

    fn segment(key: &str, version: u64) -> Segment {
        serde_json::from_value(serde_json::json!({
            "key": key,
            "version": version,
        }))
        .unwrap()
    }

    fn all_data(flags: Vec<FeatureFlag>, segments: Vec<Segment>) -> AllData {
        AllData {
            flags: flags
                .into_iter()
                .map(|f| (f.key.to_string(), f))
                .collect(),
            segments: segments.into_iter().map(|s| (s.key.clone(), s)).collect(),
        }
    }

    #[test]
    fn starts_empty_and_uninitialized() {
        let store = InMemoryDataStore::new();
        assert!(!store.initialized());
        assert!(store.flag("f").is_none());
        assert!(store.all_flags().is_empty());
    }

    #[test]
    fn init_replaces_contents_atomically() {
        let store = InMemoryDataStore::new();
        store.init(all_data(vec![flag("a", 1), flag("b", 1)], vec![segment("s", 1)]));
        assert!(store.initialized());
        assert!(store.flag("a").is_some());
        assert!(store.segment("s").is_some());

        // A second init fully replaces the first dataset.
        store.init(all_data(vec![flag("c", 1)], vec![]));
        assert!(store.flag("a").is_none());
        assert!(store.segment("s").is_none());
        let all = store.all_flags();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("c"));
    }

    #[test]
    fn upsert_respects_version_ordering() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = InMemoryDataStore::new();
        store.init(AllData::default());

        store.upsert("f", PatchTarget::Flag(flag("f", 5).into()));
        assert_eq!(store.flag("f").unwrap().version, 5);

        // Older update is ignored.
        store.upsert("f", PatchTarget::Flag(flag("f", 3).into()));
        assert_eq!(store.flag("f").unwrap().version, 5);

        // Older delete is ignored.
        store.delete(DataKind::Flag, "f", 4);
        assert_eq!(store.flag("f").unwrap().version, 5);

        // Newer update wins.
        store.upsert("f", PatchTarget::Flag(flag("f", 7).into()));
        assert_eq!(store.flag("f").unwrap().version, 7);
        assert!(store.all_flags().contains_key("f"));

        // Newer delete tombstones the item.
        store.delete(DataKind::Flag, "f", 8);
        assert!(store.flag("f").is_none());
        assert!(!store.all_flags().contains_key("f"));

        // Same-version upsert cannot revive the tombstone.
        store.upsert("f", PatchTarget::Flag(flag("f", 8).into()));
        assert!(store.flag("f").is_none());

        // A strictly newer version can.
        store.upsert("f", PatchTarget::Flag(flag("f", 9).into()));
        assert_eq!(store.flag("f").unwrap().version, 9);
    }

    #[test]
    fn deleted_items_arriving_in_data_are_tombstones() {
        let store = InMemoryDataStore::new();
        store.init(AllData::default());

        let mut deleted = flag("f", 6);
        deleted.deleted = true;
        store.upsert("f", PatchTarget::Flag(deleted.into()));

        assert!(store.flag("f").is_none());
        // The tombstone still blocks older versions.
        store.upsert("f", PatchTarget::Flag(flag("f", 5).into()));
        assert!(store.flag("f").is_none());
    }

    #[test]
    fn segment_versioning_matches_flag_versioning() {
        let store = InMemoryDataStore::new();
        store.init(AllData::default());

        store.upsert("s", PatchTarget::Segment(segment("s", 2).into()));
        assert_eq!(store.segment("s").unwrap().version, 2);
        store.delete(DataKind::Segment, "s", 3);
        assert!(store.segment("s").is_none());
        store.upsert("s", PatchTarget::Segment(segment("s", 4).into()));
        assert_eq!(store.segment("s").unwrap().version, 4);
    }

    #[test]
    fn readers_see_consistent_snapshots_across_threads() {
        let store = Arc::new(InMemoryDataStore::new());
        store.init(all_data(vec![flag("a", 1), flag("b", 1)], vec![]));

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    store.init(all_data(vec![flag("a", 1), flag("b", 1)], vec![]));
                    store.init(all_data(vec![flag("c", 1)], vec![]));
                }
            })
        };

        // Every observed snapshot equals exactly one init's input.
        for _ in 0..100 {
            let all = store.all_flags();
            let keys: Vec<_> = {
                let mut keys: Vec<_> = all.keys().cloned().collect();
                keys.sort();
                keys
            };
            assert!(
                keys == ["a", "b"] || keys == ["c"],
                "unexpected snapshot {keys:?}"
            );
        }
        writer.join().unwrap();
    }
}
