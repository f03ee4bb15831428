//! Bounded multi-identity persistence of flag snapshots.
//!
//! [`FlagCache`] stores one record per identity in a [`KeyValueStore`] and evicts the least
//! recently updated identities beyond a fixed bound. [`CacheWriter`] runs cache writes on a
//! background thread, coalescing bursts of updates for the same identity.
use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{flag::Timestamp, flag_store::FlagMap, storage::KeyValueStore, Error, Identity, Result};

/// Persisted form of one identity's flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    #[allow(missing_docs)]
    pub user_key: String,
    #[allow(missing_docs)]
    pub environment_key: String,
    #[allow(missing_docs)]
    pub feature_flags: FlagMap,
    /// When the record was written.
    #[serde(with = "iso8601_millis")]
    pub last_updated: Timestamp,
}

impl CacheRecord {
    fn belongs_to(&self, identity: &Identity) -> bool {
        self.user_key == identity.context_key() && self.environment_key == identity.environment_key()
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2018-08-13T19:06:38.123Z`.
mod iso8601_millis {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

/// Persistent flag cache bounded by the number of retained identities.
pub struct FlagCache {
    storage: Arc<dyn KeyValueStore>,
    max_identities: usize,
    /// Serializes write-then-evict cycles.
    write_lock: Mutex<()>,
}

impl FlagCache {
    /// Default value for the number of retained identities.
    pub const DEFAULT_MAX_IDENTITIES: usize = 5;

    /// Create a cache retaining at most `max_identities` identities. `0` disables persistence:
    /// stores become no-ops and loads find nothing new.
    pub fn new(storage: Arc<dyn KeyValueStore>, max_identities: usize) -> FlagCache {
        FlagCache {
            storage,
            max_identities,
            write_lock: Mutex::new(()),
        }
    }

    /// Load the cached flags for `identity`. Never touches the network.
    pub fn load(&self, identity: &Identity) -> Result<Option<CacheRecord>> {
        let Some(bytes) = self.storage.get(&identity.storage_key())? else {
            return Ok(None);
        };
        let record: CacheRecord = serde_json::from_slice(&bytes)?;
        if !record.belongs_to(identity) {
            log::warn!(target: "flagsync", identity; "cache record belongs to another identity, ignoring it");
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Upsert the flags of `identity` and evict the least recently updated identities beyond the
    /// bound.
    pub fn store(&self, identity: &Identity, flags: FlagMap) -> Result<()> {
        if self.max_identities == 0 {
            return Ok(());
        }

        let record = CacheRecord {
            user_key: identity.context_key().to_owned(),
            environment_key: identity.environment_key().to_owned(),
            feature_flags: flags,
            last_updated: Utc::now(),
        };
        // Serializing before requesting the lock to minimize lock span.
        let bytes = serde_json::to_vec(&record)?;

        let _guard = self
            .write_lock
            .lock()
            .expect("thread holding cache lock should not panic");
        self.storage.put(&identity.storage_key(), &bytes)?;

        for key in self
            .storage
            .list_keys_by_recency()?
            .into_iter()
            .skip(self.max_identities)
        {
            log::debug!(target: "flagsync", storage_key = key.as_str(); "evicting cached flags");
            self.storage.delete(&key)?;
        }
        Ok(())
    }

    /// Remove the cached flags of `identity`.
    pub fn remove(&self, identity: &Identity) -> Result<()> {
        self.storage.delete(&identity.storage_key())
    }

    /// Remove every cached identity.
    pub fn clear(&self) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .expect("thread holding cache lock should not panic");
        for key in self.storage.list_keys_by_recency()? {
            self.storage.delete(&key)?;
        }
        Ok(())
    }
}

enum CacheCommand {
    Store(Identity, FlagMap),
    Flush(Sender<()>),
}

/// Runs [`FlagCache::store`] on a background thread.
///
/// Writes are eventually durable: after receiving an update the thread waits for `debounce` to
/// collect more, keeps only the last update per identity, and then writes. [`CacheWriter::flush`]
/// forces pending writes out.
pub struct CacheWriter {
    sender: Mutex<Option<Sender<CacheCommand>>>,
    join_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CacheWriter {
    /// Start the writer thread.
    pub fn start(cache: Arc<FlagCache>, debounce: Duration) -> std::io::Result<CacheWriter> {
        let (sender, receiver) = mpsc::channel();

        let join_handle = std::thread::Builder::new()
            .name("flagsync-cache".to_owned())
            .spawn(move || run_writer(&cache, &receiver, debounce))?;

        Ok(CacheWriter {
            sender: Mutex::new(Some(sender)),
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    /// Queue `flags` to be persisted for `identity`.
    pub fn store(&self, identity: Identity, flags: FlagMap) {
        self.send(CacheCommand::Store(identity, flags));
    }

    /// Write out all pending updates, waiting at most `timeout`.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let (done_sender, done_receiver) = mpsc::channel();
        if !self.send(CacheCommand::Flush(done_sender)) {
            return Ok(());
        }
        match done_receiver.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(Error::ShutdownTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ThreadPanicked),
        }
    }

    /// Flush pending writes with a bounded wait and stop the thread.
    ///
    /// If the flush does not finish within `timeout`, the thread is left to finish on its own.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        let flushed = self.flush(timeout);

        // Dropping the sender disconnects the channel, which stops the thread.
        self.sender
            .lock()
            .expect("thread holding cache writer lock should not panic")
            .take();

        let join_handle = self
            .join_handle
            .lock()
            .expect("thread holding cache writer lock should not panic")
            .take();
        if let (Ok(()), Some(join_handle)) = (&flushed, join_handle) {
            join_handle.join().map_err(|_| Error::ThreadPanicked)?;
        }
        flushed
    }

    fn send(&self, command: CacheCommand) -> bool {
        let sender = self
            .sender
            .lock()
            .expect("thread holding cache writer lock should not panic");
        match sender.as_ref() {
            Some(sender) => sender.send(command).is_ok(),
            None => false,
        }
    }
}

fn run_writer(cache: &FlagCache, receiver: &Receiver<CacheCommand>, debounce: Duration) {
    log::debug!(target: "flagsync", "cache writer thread started");
    let mut pending: Vec<(Identity, FlagMap)> = Vec::new();

    while let Ok(command) = receiver.recv() {
        let mut flush_waiters = Vec::new();
        let deadline = Instant::now() + debounce;
        let mut next = Some(command);

        while let Some(command) = next.take() {
            match command {
                CacheCommand::Store(identity, flags) => {
                    pending.retain(|(pending_identity, _)| *pending_identity != identity);
                    pending.push((identity, flags));
                }
                CacheCommand::Flush(waiter) => {
                    flush_waiters.push(waiter);
                    // Stop collecting, the caller is waiting.
                    break;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            next = receiver.recv_timeout(remaining).ok();
        }

        for (identity, flags) in pending.drain(..) {
            if let Err(err) = cache.store(&identity, flags) {
                // The in-memory store stays authoritative; the next update retries.
                log::warn!(target: "flagsync", identity; "failed to persist flags: {err}");
            }
        }
        for waiter in flush_waiters {
            let _ = waiter.send(());
        }
    }
    log::debug!(target: "flagsync", "cache writer thread stopped");
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::{TimeZone, Utc};

    use super::{CacheRecord, CacheWriter, FlagCache};
    use crate::{
        flag_store::FlagMap,
        storage::{KeyValueStore, MemoryStore},
        Error, FeatureFlag, Identity, Result,
    };

    fn flags(value: bool) -> FlagMap {
        FlagMap::from([(
            "a".to_owned(),
            FeatureFlag::new(value).with_variation(0).with_model_version(5),
        )])
    }

    #[test]
    fn loads_stored_flags() {
        let cache = FlagCache::new(Arc::new(MemoryStore::new()), 5);
        let identity = Identity::new("user", "env");

        assert_eq!(cache.load(&identity).unwrap(), None);
        cache.store(&identity, flags(true)).unwrap();

        let record = cache.load(&identity).unwrap().unwrap();
        assert_eq!(record.feature_flags, flags(true));
        assert_eq!(record.user_key, "user");
        assert_eq!(record.environment_key, "env");
    }

    #[test]
    fn evicts_least_recently_stored_identities() {
        let cache = FlagCache::new(Arc::new(MemoryStore::new()), 5);
        let identities: Vec<Identity> = (0..8)
            .map(|i| Identity::new(format!("user-{i}"), "env"))
            .collect();

        for identity in &identities {
            cache.store(identity, flags(true)).unwrap();
        }

        for identity in &identities[..3] {
            assert_eq!(cache.load(identity).unwrap(), None, "{identity}");
        }
        for identity in &identities[3..] {
            assert!(cache.load(identity).unwrap().is_some(), "{identity}");
        }
    }

    #[test]
    fn restoring_refreshes_recency() {
        let cache = FlagCache::new(Arc::new(MemoryStore::new()), 2);
        let a = Identity::new("a", "env");
        let b = Identity::new("b", "env");
        let c = Identity::new("c", "env");

        cache.store(&a, flags(true)).unwrap();
        cache.store(&b, flags(true)).unwrap();
        cache.store(&a, flags(false)).unwrap();
        cache.store(&c, flags(true)).unwrap();

        assert!(cache.load(&a).unwrap().is_some());
        assert!(cache.load(&b).unwrap().is_none());
        assert!(cache.load(&c).unwrap().is_some());
    }

    #[test]
    fn zero_bound_disables_persistence() {
        let cache = FlagCache::new(Arc::new(MemoryStore::new()), 0);
        let identity = Identity::new("user", "env");

        cache.store(&identity, flags(true)).unwrap();

        assert_eq!(cache.load(&identity).unwrap(), None);
    }

    #[test]
    fn clear_removes_everything() {
        let cache = FlagCache::new(Arc::new(MemoryStore::new()), 5);
        let identity = Identity::new("user", "env");
        cache.store(&identity, flags(true)).unwrap();

        cache.clear().unwrap();

        assert_eq!(cache.load(&identity).unwrap(), None);
    }

    #[test]
    fn record_format() {
        let record = CacheRecord {
            user_key: "user".into(),
            environment_key: "env".into(),
            feature_flags: flags(true),
            last_updated: Utc.timestamp_millis_opt(1_534_187_198_123).unwrap(),
        };

        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["userKey"], "user");
        assert_eq!(json["environmentKey"], "env");
        assert_eq!(json["lastUpdated"], "2018-08-13T19:06:38.123Z");
        assert_eq!(json["featureFlags"]["a"]["value"], true);
        assert_eq!(json["featureFlags"]["a"]["version"], 5);
        assert_eq!(
            serde_json::from_value::<CacheRecord>(json).unwrap(),
            record
        );
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let storage = Arc::new(MemoryStore::new());
        let identity = Identity::new("user", "env");
        storage.put(&identity.storage_key(), b"not json").unwrap();

        let cache = FlagCache::new(storage, 5);

        assert!(matches!(cache.load(&identity), Err(Error::Serialization(_))));
    }

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn put(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Err(std::io::Error::other("disk full").into())
        }
        fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        fn list_keys_by_recency(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn writer_survives_storage_failures() {
        let writer =
            CacheWriter::start(Arc::new(FlagCache::new(Arc::new(FailingStore), 5)), Duration::ZERO)
                .unwrap();

        writer.store(Identity::new("user", "env"), flags(true));

        assert!(writer.flush(Duration::from_secs(5)).is_ok());
        assert!(writer.shutdown(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn writer_persists_last_update_on_flush() {
        let cache = Arc::new(FlagCache::new(Arc::new(MemoryStore::new()), 5));
        let writer = CacheWriter::start(cache.clone(), Duration::from_secs(60)).unwrap();
        let identity = Identity::new("user", "env");

        writer.store(identity.clone(), flags(true));
        writer.store(identity.clone(), flags(false));
        writer.shutdown(Duration::from_secs(5)).unwrap();

        let record = cache.load(&identity).unwrap().unwrap();
        assert_eq!(record.feature_flags, flags(false));
    }

    #[test]
    fn store_after_shutdown_is_ignored() {
        let cache = Arc::new(FlagCache::new(Arc::new(MemoryStore::new()), 5));
        let writer = CacheWriter::start(cache.clone(), Duration::ZERO).unwrap();
        writer.shutdown(Duration::from_secs(5)).unwrap();

        writer.store(Identity::new("user", "env"), flags(true));

        assert!(writer.flush(Duration::from_secs(1)).is_ok());
    }
}
