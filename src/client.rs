use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

#[cfg(doc)]
use crate::Error;
use crate::{
    change_notifier::{ChangeNotifier, ChangedFlag, ChangedFlags, ObserverOwner},
    connection::{ConnectionInformation, ConnectionMode},
    data_source::{DataSourceThread, FlagUpdate, UpdateSink},
    evaluation_logger::{EvaluationDetail, EvaluationEvent},
    flag_cache::{CacheWriter, FlagCache},
    flag_store::{FlagStore, StoreUpdate, UpdateSource},
    ClientConfig, EvaluationLogger, FeatureFlag, FlagValue, Identity, Result,
};

/// A flag client for one identity at a time.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// Creating a client warms the flag store from the persistent cache and, if configured to start
/// online, connects to the flag service in the background. Flag reads never block on the network:
/// they return whatever the client knows at the time of the call.
///
/// # Examples
/// ```no_run
/// # use flagsync::{ClientConfig, Identity, ObserverOwner};
/// let client = ClientConfig::new("mob-key-123")
///     .to_client(Identity::new("user-42", "mob-key-123"))
///     .expect("client should start");
///
/// let owner = ObserverOwner::new();
/// client.observe("dark-mode", &owner, |change| {
///     println!("dark-mode is now {:?}", change.new_value);
/// });
///
/// let dark_mode = client.variation("dark-mode", false).as_bool().unwrap_or(false);
/// ```
pub struct Client<'a> {
    inner: Arc<ClientInner>,
    data_source: DataSourceThread,
    evaluation_logger: Box<dyn EvaluationLogger + Send + Sync + 'a>,
    shutdown_timeout: Duration,
}

/// State shared with the data source thread.
struct ClientInner {
    store: FlagStore,
    notifier: ChangeNotifier,
    cache: Arc<FlagCache>,
    cache_writer: CacheWriter,
    connection: Mutex<ConnectionInformation>,
    /// Held across a store write and the hand-off of its result, so observers and the cache see
    /// updates in store order.
    pipeline: Mutex<()>,
}

impl<'a> Client<'a> {
    /// Create a new `Client` for `identity` using the specified configuration.
    ///
    /// Same as [`ClientConfig::to_client`].
    pub fn new(mut config: ClientConfig<'a>, identity: Identity) -> Result<Self> {
        let data_source_config = config.data_source_config()?;
        let transport = config.take_transport()?;
        let cache = Arc::new(FlagCache::new(
            config.take_storage(),
            config.max_cached_identities,
        ));

        let inner = Arc::new(ClientInner {
            store: FlagStore::new(),
            notifier: ChangeNotifier::start()?,
            cache_writer: CacheWriter::start(Arc::clone(&cache), config.cache_debounce)?,
            cache,
            connection: Mutex::new(ConnectionInformation::default()),
            pipeline: Mutex::new(()),
        });
        let data_source = DataSourceThread::start(
            data_source_config,
            transport,
            inner.clone(),
            config.start_online,
        )?;

        let client = Client {
            inner,
            data_source,
            evaluation_logger: config.evaluation_logger,
            shutdown_timeout: config.shutdown_timeout,
        };
        client.switch_identity(identity);
        Ok(client)
    }

    /// Get a flag of the current identity.
    ///
    /// Returns `None` if the flag has never been seen for this identity. A flag that is known but
    /// evaluated to nothing is returned with a null value.
    pub fn get_flag(&self, key: &str) -> Option<FeatureFlag> {
        self.inner.store.get(key)
    }

    /// Get the value of a flag, or `default` if the flag is unknown or null.
    ///
    /// Every call is reported to the configured [`EvaluationLogger`].
    ///
    /// # Examples
    ///
    /// ```
    /// # fn test(client: &flagsync::Client) {
    /// let limit = client
    ///     .variation("upload-limit-mb", 10.0)
    ///     .as_f64()
    ///     .unwrap_or(10.0);
    /// # }
    /// ```
    pub fn variation(&self, key: &str, default: impl Into<FlagValue>) -> FlagValue {
        self.evaluate(key, default.into(), false).value
    }

    /// Same as [`Client::variation`], but also returns the variation index and the evaluation
    /// reason. The reason is also included in the event handed to the [`EvaluationLogger`].
    ///
    /// Reasons are only available when requested with [`ClientConfig::evaluation_reasons`].
    pub fn variation_detail(&self, key: &str, default: impl Into<FlagValue>) -> EvaluationDetail {
        self.evaluate(key, default.into(), true)
    }

    fn evaluate(&self, key: &str, default: FlagValue, include_reason: bool) -> EvaluationDetail {
        let snapshot = self.inner.store.read();
        let flag = snapshot.get(key);
        let detail = EvaluationDetail::new(flag, default.clone());

        if let Some(identity) = snapshot.identity() {
            let event = EvaluationEvent::new(
                identity,
                key,
                flag,
                detail.value.clone(),
                default,
                include_reason,
            );
            log::trace!(target: "flagsync",
                        event:serde;
                        "logging evaluation");
            self.evaluation_logger.log_evaluation(event);
        }

        detail
    }

    /// Values of all visible flags of the current identity.
    pub fn all_flags(&self) -> HashMap<String, FlagValue> {
        self.inner
            .store
            .read()
            .flags()
            .map(|(key, flag)| (key.to_owned(), flag.value.clone()))
            .collect()
    }

    /// The identity flags are currently served for.
    pub fn identity(&self) -> Option<Identity> {
        self.inner.store.read().identity().cloned()
    }

    /// Returns `true` if the current flags were loaded from the persistent cache and have not been
    /// refreshed by the flag service yet.
    pub fn is_serving_cached_flags(&self) -> bool {
        self.inner.store.read().is_from_cache()
    }

    /// Switch to another identity.
    ///
    /// The flags of the previous identity are cleared at once (observers see them disappear),
    /// then cached flags of `identity` are loaded, if any, and the data source reconnects.
    pub fn switch_identity(&self, identity: Identity) {
        log::debug!(target: "flagsync", identity = &identity; "switching identity");

        // Let pending writes of the outgoing identity land before reading the cache.
        if let Err(err) = self.inner.cache_writer.flush(self.shutdown_timeout) {
            log::warn!(target: "flagsync", "failed to flush flag cache: {err}");
        }

        {
            let _guard = self.inner.lock_pipeline();
            let update = self.inner.store.switch_identity(identity.clone());
            self.inner.notifier.notify(&update.prior, &update.current);

            match self.inner.cache.load(&identity) {
                Ok(Some(record)) => {
                    log::debug!(target: "flagsync", identity = &identity; "loaded flags from cache");
                    let update =
                        self.inner
                            .store
                            .replace(&identity, record.feature_flags, UpdateSource::Cache);
                    self.inner.publish(update);
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!(target: "flagsync", identity = &identity; "failed to load cached flags: {err}");
                }
            }
        }

        self.data_source.reconnect(identity);
    }

    /// Connect to (`true`) or disconnect from (`false`) the flag service.
    ///
    /// Going online while waiting to reconnect after a failure reconnects immediately.
    pub fn set_online(&self, online: bool) {
        self.data_source.set_online(online);
    }

    /// Current connection status.
    pub fn connection_information(&self) -> ConnectionInformation {
        self.inner.lock_connection().clone()
    }

    /// Observe changes of the flag `key`.
    ///
    /// The observer stays registered until [`Client::unobserve`] is called or `owner` is dropped.
    pub fn observe(
        &self,
        key: impl Into<String>,
        owner: &ObserverOwner,
        handler: impl Fn(&ChangedFlag) + Send + Sync + 'static,
    ) {
        self.inner.notifier.observe(key, owner, handler);
    }

    /// Observe changes of any of `keys`. The handler receives the changes of one update at once.
    pub fn observe_keys<I, K>(
        &self,
        keys: I,
        owner: &ObserverOwner,
        handler: impl Fn(&ChangedFlags) + Send + Sync + 'static,
    ) where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.inner.notifier.observe_keys(keys, owner, handler);
    }

    /// Observe changes of any flag.
    pub fn observe_all(
        &self,
        owner: &ObserverOwner,
        handler: impl Fn(&ChangedFlags) + Send + Sync + 'static,
    ) {
        self.inner.notifier.observe_all(owner, handler);
    }

    /// Observe updates from the flag service that did not change any flag.
    pub fn observe_flags_unchanged(
        &self,
        owner: &ObserverOwner,
        handler: impl Fn() + Send + Sync + 'static,
    ) {
        self.inner.notifier.observe_flags_unchanged(owner, handler);
    }

    /// Observe changes of [`ConnectionMode`].
    pub fn observe_connection_mode_changed(
        &self,
        owner: &ObserverOwner,
        handler: impl Fn(ConnectionMode) + Send + Sync + 'static,
    ) {
        self.inner
            .notifier
            .observe_connection_mode_changed(owner, handler);
    }

    /// Observe recoverable errors: connection failures and malformed payloads.
    pub fn observe_error(
        &self,
        owner: &ObserverOwner,
        handler: impl Fn(&crate::Error) + Send + Sync + 'static,
    ) {
        self.inner.notifier.observe_error(owner, handler);
    }

    /// Remove all observers registered by `owner`.
    pub fn unobserve(&self, owner: &ObserverOwner) {
        self.inner.notifier.remove_observers(owner);
    }

    /// Stop background threads.
    ///
    /// Disconnects from the flag service, writes pending cache updates, and delivers queued
    /// notifications, waiting at most the configured shutdown timeout for each. Calling it more
    /// than once is harmless. Dropping the client shuts it down as well.
    ///
    /// # Errors
    ///
    /// - [`Error::ShutdownTimeout`] if pending work did not finish in time.
    /// - [`Error::ThreadPanicked`] if a background thread panicked.
    pub fn shutdown(&self) -> Result<()> {
        log::debug!(target: "flagsync", "shutting down client");
        let data_source = self.data_source.shutdown();
        let cache = self.inner.cache_writer.shutdown(self.shutdown_timeout);
        let notifier = self.inner.notifier.shutdown(self.shutdown_timeout);
        data_source.and(cache).and(notifier)
    }
}

impl Drop for Client<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!(target: "flagsync", "client did not shut down cleanly: {err}");
        }
    }
}

impl ClientInner {
    /// Hand a store write to observers and the cache. Must be called with the pipeline lock held.
    fn publish(&self, update: StoreUpdate) {
        if update.is_unchanged() {
            return;
        }
        self.notifier.notify(&update.prior, &update.current);

        let current = &update.current;
        if current.source().is_live() {
            if let Some(identity) = current.identity() {
                self.cache_writer
                    .store(identity.clone(), current.to_flag_map());
            }
        }
    }

    fn lock_pipeline(&self) -> MutexGuard<'_, ()> {
        self.pipeline
            .lock()
            .expect("thread holding update pipeline lock should not panic")
    }

    fn lock_connection(&self) -> MutexGuard<'_, ConnectionInformation> {
        self.connection
            .lock()
            .expect("thread holding connection information lock should not panic")
    }
}

impl UpdateSink for ClientInner {
    fn apply(&self, identity: &Identity, update: FlagUpdate, source: UpdateSource) {
        let _guard = self.lock_pipeline();
        let update = match update {
            FlagUpdate::Replace(flags) => self.store.replace(identity, flags, source),
            FlagUpdate::Patch { key, flag } => self.store.upsert(identity, key, flag, source),
            FlagUpdate::Delete { key, version } => {
                self.store.delete(identity, key, version, source)
            }
        };
        self.publish(update);
    }

    fn up_to_date(&self, identity: &Identity) {
        let _guard = self.lock_pipeline();
        if self.store.read().identity() == Some(identity) {
            self.notifier.notify_unchanged();
        }
    }

    fn connection_changed(&self, information: &ConnectionInformation, mode_changed: bool) {
        *self.lock_connection() = information.clone();
        if mode_changed {
            log::debug!(target: "flagsync", "connection mode: {}", information.current_connection_mode);
            self.notifier
                .notify_connection_mode_changed(information.current_connection_mode);
        }
    }

    fn error(&self, error: crate::Error) {
        self.notifier.notify_error(error);
    }
}
