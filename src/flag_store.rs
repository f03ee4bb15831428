//! A thread-safe in-memory storage for the flags of the currently active identity. [`FlagStore`]
//! provides lock-free access for readers (flag lookups) and serialized access for writers (the
//! data source and identity switches).
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use derive_more::From;

use crate::{FeatureFlag, Identity};

/// Mapping from flag key to flag.
pub type FlagMap = HashMap<String, FeatureFlag>;

/// Where a snapshot's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Initial state or an identity switch cleared the store.
    Reset,
    /// Loaded from the persistent cache. Values may be stale.
    Cache,
    /// Received over the streaming channel.
    Stream,
    /// Received from a poll (or a ping-triggered fetch).
    Poll,
}

impl UpdateSource {
    /// Returns `true` for data that came from the flag service during this session.
    pub fn is_live(self) -> bool {
        matches!(self, UpdateSource::Stream | UpdateSource::Poll)
    }
}

/// A deletion marker. It hides the key from readers but keeps its version for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    #[allow(missing_docs)]
    pub version: i64,
}

/// An entry in a snapshot: a live flag or a tombstone.
#[derive(Debug, Clone, PartialEq, From)]
pub enum StoredItem {
    #[allow(missing_docs)]
    Flag(FeatureFlag),
    #[allow(missing_docs)]
    Tombstone(Tombstone),
}

impl StoredItem {
    fn version(&self) -> Option<i64> {
        match self {
            StoredItem::Flag(flag) => flag.model_version,
            StoredItem::Tombstone(tombstone) => Some(tombstone.version),
        }
    }

    fn as_flag(&self) -> Option<&FeatureFlag> {
        match self {
            StoredItem::Flag(flag) => Some(flag),
            StoredItem::Tombstone(_) => None,
        }
    }
}

/// An immutable point-in-time view of all flags for one identity.
///
/// Snapshots are never mutated once installed in the store. Every write builds a new snapshot and
/// swaps it in, so readers holding an older snapshot keep a consistent view.
#[derive(Debug, Clone)]
pub struct FlagSnapshot {
    identity: Option<Identity>,
    source: UpdateSource,
    items: HashMap<String, StoredItem>,
}

impl FlagSnapshot {
    /// An empty snapshot with no identity.
    pub fn empty() -> FlagSnapshot {
        FlagSnapshot {
            identity: None,
            source: UpdateSource::Reset,
            items: HashMap::new(),
        }
    }

    /// Identity the snapshot belongs to, `None` before the first identity is set.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Source of the most recent write that produced this snapshot.
    pub fn source(&self) -> UpdateSource {
        self.source
    }

    /// Returns `true` if the data was loaded from the persistent cache and has not been refreshed
    /// by the flag service yet.
    pub fn is_from_cache(&self) -> bool {
        self.source == UpdateSource::Cache
    }

    /// Look up a visible flag. Tombstoned keys are reported as absent.
    pub fn get(&self, key: &str) -> Option<&FeatureFlag> {
        self.items.get(key)?.as_flag()
    }

    /// Iterate over visible flags.
    pub fn flags(&self) -> impl Iterator<Item = (&str, &FeatureFlag)> {
        self.items
            .iter()
            .filter_map(|(key, item)| Some((key.as_str(), item.as_flag()?)))
    }

    /// Copy visible flags into a map, e.g. for persistence.
    pub fn to_flag_map(&self) -> FlagMap {
        self.flags()
            .map(|(key, flag)| (key.to_owned(), flag.clone()))
            .collect()
    }

    /// Number of visible flags.
    pub fn len(&self) -> usize {
        self.flags().count()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a store write: the snapshot active before the write and the one active after.
///
/// When the write was rejected (stale version, identity mismatch), `prior` and `current` point
/// to the same snapshot.
#[derive(Debug, Clone)]
pub struct StoreUpdate {
    #[allow(missing_docs)]
    pub prior: Arc<FlagSnapshot>,
    #[allow(missing_docs)]
    pub current: Arc<FlagSnapshot>,
}

impl StoreUpdate {
    fn unchanged(snapshot: Arc<FlagSnapshot>) -> StoreUpdate {
        StoreUpdate {
            prior: snapshot.clone(),
            current: snapshot,
        }
    }

    /// Returns `true` if the store was not modified.
    pub fn is_unchanged(&self) -> bool {
        Arc::ptr_eq(&self.prior, &self.current)
    }
}

/// `FlagStore` holds the authoritative flags of the active identity.
///
/// Reads load an atomically swapped snapshot pointer and never block. Writes are serialized by
/// an internal mutex and never block readers.
pub struct FlagStore {
    current: ArcSwap<FlagSnapshot>,
    write_lock: Mutex<()>,
}

impl Default for FlagStore {
    fn default() -> FlagStore {
        FlagStore {
            current: ArcSwap::from_pointee(FlagSnapshot::empty()),
            write_lock: Mutex::new(()),
        }
    }
}

impl FlagStore {
    /// Create a new empty store.
    pub fn new() -> FlagStore {
        FlagStore::default()
    }

    /// Get the currently active snapshot.
    pub fn read(&self) -> Arc<FlagSnapshot> {
        self.current.load_full()
    }

    /// Look up a visible flag in the currently active snapshot.
    pub fn get(&self, key: &str) -> Option<FeatureFlag> {
        self.current.load().get(key).cloned()
    }

    /// Make `identity` the active identity and clear all flags.
    ///
    /// Writes tagged with any other identity are ignored from now on.
    pub fn switch_identity(&self, identity: Identity) -> StoreUpdate {
        let _guard = self.lock();
        self.install(FlagSnapshot {
            identity: Some(identity),
            source: UpdateSource::Reset,
            items: HashMap::new(),
        })
    }

    /// Replace all flags of `identity` with `flags`.
    pub fn replace(&self, identity: &Identity, flags: FlagMap, source: UpdateSource) -> StoreUpdate {
        // Constructing new value before requesting the lock to minimize lock span.
        let items = flags
            .into_iter()
            .map(|(key, flag)| (key, StoredItem::Flag(flag)))
            .collect();

        let _guard = self.lock();
        let prior = self.current.load_full();
        if !self.is_active(&prior, identity) {
            return StoreUpdate::unchanged(prior);
        }
        self.install(FlagSnapshot {
            identity: Some(identity.clone()),
            source,
            items,
        })
    }

    /// Apply a partial update.
    ///
    /// Each incoming item replaces the stored one only if the key is unknown or the incoming
    /// version is strictly newer. If either version is missing, the incoming item wins.
    pub fn merge(
        &self,
        identity: &Identity,
        partial: HashMap<String, StoredItem>,
        source: UpdateSource,
    ) -> StoreUpdate {
        let _guard = self.lock();
        let prior = self.current.load_full();
        if !self.is_active(&prior, identity) {
            return StoreUpdate::unchanged(prior);
        }

        let mut items = None;
        for (key, incoming) in partial {
            if !is_newer(prior.items.get(&key), &incoming) {
                log::trace!(target: "flagsync", flag_key = key.as_str(); "ignoring stale update");
                continue;
            }
            items
                .get_or_insert_with(|| prior.items.clone())
                .insert(key, incoming);
        }

        match items {
            Some(items) => self.install(FlagSnapshot {
                identity: Some(identity.clone()),
                source,
                items,
            }),
            None => StoreUpdate::unchanged(prior),
        }
    }

    /// Upsert a single flag, subject to the same version check as [`FlagStore::merge`].
    pub fn upsert(
        &self,
        identity: &Identity,
        key: impl Into<String>,
        flag: FeatureFlag,
        source: UpdateSource,
    ) -> StoreUpdate {
        self.merge(
            identity,
            HashMap::from([(key.into(), StoredItem::Flag(flag))]),
            source,
        )
    }

    /// Tombstone `key` if `version` is newer than the stored version.
    pub fn delete(
        &self,
        identity: &Identity,
        key: impl Into<String>,
        version: i64,
        source: UpdateSource,
    ) -> StoreUpdate {
        self.merge(
            identity,
            HashMap::from([(key.into(), StoredItem::Tombstone(Tombstone { version }))]),
            source,
        )
    }

    fn is_active(&self, snapshot: &FlagSnapshot, identity: &Identity) -> bool {
        let active = snapshot.identity.as_ref() == Some(identity);
        if !active {
            log::debug!(target: "flagsync", identity; "ignoring update for inactive identity");
        }
        active
    }

    /// Must be called with the write lock held.
    fn install(&self, snapshot: FlagSnapshot) -> StoreUpdate {
        let current = Arc::new(snapshot);
        let prior = self.current.swap(current.clone());
        StoreUpdate { prior, current }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .expect("thread holding flag store lock should not panic")
    }
}

fn is_newer(stored: Option<&StoredItem>, incoming: &StoredItem) -> bool {
    match (stored.and_then(StoredItem::version), incoming.version()) {
        (Some(stored), Some(incoming)) => incoming > stored,
        _ => true,
    }
}
