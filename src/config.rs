use std::{sync::Arc, time::Duration};

use url::Url;

use crate::{
    backoff::BackoffConfig,
    data_source::{DataSourceConfig, StreamingMode},
    evaluation_logger::NoopEvaluationLogger,
    flag_cache::FlagCache,
    http_transport::HttpTransport,
    storage::{KeyValueStore, MemoryStore},
    transport::Transport,
    Client, Error, EvaluationLogger, Identity, Result,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```no_run
/// # use std::time::Duration;
/// # use flagsync::{ClientConfig, Identity, StreamingMode};
/// let client = ClientConfig::new("mob-key-123")
///     .streaming_mode(StreamingMode::Polling)
///     .poll_interval(Duration::from_secs(60))
///     .evaluation_logger(|event| {
///         println!("{:?}", event);
///     })
///     .to_client(Identity::new("user-42", "mob-key-123"))
///     .expect("client should start");
/// ```
pub struct ClientConfig<'a> {
    pub(crate) environment_key: String,
    pub(crate) base_url: String,
    pub(crate) stream_url: String,
    pub(crate) streaming_mode: StreamingMode,
    pub(crate) start_online: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) poll_jitter: Duration,
    pub(crate) poll_retry_threshold: u32,
    pub(crate) evaluation_reasons: bool,
    pub(crate) backoff: BackoffConfig,
    pub(crate) max_cached_identities: usize,
    pub(crate) cache_debounce: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) storage: Option<Arc<dyn KeyValueStore>>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) evaluation_logger: Box<dyn EvaluationLogger + Send + Sync + 'a>,
}

impl<'a> ClientConfig<'a> {
    /// Default base URL for flag requests.
    pub const DEFAULT_BASE_URL: &'static str = "https://clientsdk.flagsync.dev";
    /// Default URL of the streaming service.
    pub const DEFAULT_STREAM_URL: &'static str = "https://clientstream.flagsync.dev";
    /// Default value for [`ClientConfig::poll_interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);
    /// Default value for [`ClientConfig::poll_jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);
    /// Default value for [`ClientConfig::poll_retry_threshold`].
    pub const DEFAULT_POLL_RETRY_THRESHOLD: u32 = 3;
    /// Default value for [`ClientConfig::cache_debounce`].
    pub const DEFAULT_CACHE_DEBOUNCE: Duration = Duration::from_millis(50);
    /// Default value for [`ClientConfig::shutdown_timeout`].
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

    /// Create a default configuration for the specified environment key.
    ///
    /// ```
    /// # use flagsync::ClientConfig;
    /// ClientConfig::new("mob-key-123");
    /// ```
    pub fn new(environment_key: impl Into<String>) -> Self {
        ClientConfig {
            environment_key: environment_key.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            stream_url: ClientConfig::DEFAULT_STREAM_URL.to_owned(),
            streaming_mode: StreamingMode::default(),
            start_online: true,
            poll_interval: ClientConfig::DEFAULT_POLL_INTERVAL,
            poll_jitter: ClientConfig::DEFAULT_POLL_JITTER,
            poll_retry_threshold: ClientConfig::DEFAULT_POLL_RETRY_THRESHOLD,
            evaluation_reasons: false,
            backoff: BackoffConfig::default(),
            max_cached_identities: FlagCache::DEFAULT_MAX_IDENTITIES,
            cache_debounce: ClientConfig::DEFAULT_CACHE_DEBOUNCE,
            shutdown_timeout: ClientConfig::DEFAULT_SHUTDOWN_TIMEOUT,
            storage: None,
            transport: None,
            evaluation_logger: Box::new(NoopEvaluationLogger),
        }
    }

    /// Override base URL for flag requests. Clients should use the default setting in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override URL of the streaming service.
    pub fn stream_url(mut self, stream_url: impl Into<String>) -> Self {
        self.stream_url = stream_url.into();
        self
    }

    #[allow(missing_docs)]
    pub fn streaming_mode(mut self, streaming_mode: StreamingMode) -> Self {
        self.streaming_mode = streaming_mode;
        self
    }

    /// Whether the client connects right away. Defaults to `true`.
    pub fn start_online(mut self, start_online: bool) -> Self {
        self.start_online = start_online;
        self
    }

    /// Interval between polls when polling.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Random duration subtracted from each poll interval.
    pub fn poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    /// Number of consecutive poll failures tolerated before the client backs off.
    pub fn poll_retry_threshold(mut self, threshold: u32) -> Self {
        self.poll_retry_threshold = threshold;
        self
    }

    /// Ask the flag service to include evaluation reasons with every flag. Reasons are returned by
    /// [`Client::variation_detail`]. Defaults to `false`.
    pub fn evaluation_reasons(mut self, evaluation_reasons: bool) -> Self {
        self.evaluation_reasons = evaluation_reasons;
        self
    }

    /// Reconnect delay policy.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Number of identities whose flags are kept in storage. `0` disables persistence.
    pub fn max_cached_identities(mut self, max: usize) -> Self {
        self.max_cached_identities = max;
        self
    }

    /// How long the cache writer waits to coalesce updates before writing.
    pub fn cache_debounce(mut self, debounce: Duration) -> Self {
        self.cache_debounce = debounce;
        self
    }

    /// Upper bound for the final flush in [`Client::shutdown`].
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Durable storage for cached flags. Defaults to an in-memory store, which only helps
    /// when switching back and forth between identities.
    pub fn storage(mut self, storage: impl KeyValueStore + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Replace the HTTP transport, e.g. to route requests through a proxy of your own.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Set evaluation logger to pass flag evaluations to your analytics pipeline.
    ///
    /// ```
    /// # use flagsync::ClientConfig;
    /// let config = ClientConfig::new("mob-key-123").evaluation_logger(|event| {
    ///   println!("{:?}", event);
    /// });
    /// ```
    pub fn evaluation_logger(
        mut self,
        evaluation_logger: impl EvaluationLogger + Send + Sync + 'a,
    ) -> Self {
        self.evaluation_logger = Box::new(evaluation_logger);
        self
    }

    /// Create a new [`Client`] for `identity` and start its background threads.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`] if either URL is not a valid hierarchical URL.
    /// - [`Error::HttpClient`] if the HTTP client could not be set up.
    /// - [`Error::Io`] if a background thread failed to start.
    pub fn to_client(self, identity: Identity) -> Result<Client<'a>> {
        Client::new(self, identity)
    }

    pub(crate) fn data_source_config(&self) -> Result<DataSourceConfig> {
        Ok(DataSourceConfig {
            base_url: parse_url(&self.base_url)?,
            stream_url: parse_url(&self.stream_url)?,
            environment_key: self.environment_key.clone(),
            streaming_mode: self.streaming_mode,
            poll_interval: self.poll_interval,
            poll_jitter: self.poll_jitter,
            poll_retry_threshold: self.poll_retry_threshold,
            with_reasons: self.evaluation_reasons,
            backoff: self.backoff.clone(),
        })
    }

    pub(crate) fn take_storage(&mut self) -> Arc<dyn KeyValueStore> {
        self.storage
            .take()
            .unwrap_or_else(|| Arc::new(MemoryStore::new()))
    }

    pub(crate) fn take_transport(&mut self) -> Result<Arc<dyn Transport>> {
        match self.transport.take() {
            Some(transport) => Ok(transport),
            None => Ok(Arc::new(HttpTransport::new(
                HttpTransport::DEFAULT_CONNECT_TIMEOUT,
            )?)),
        }
    }
}

fn parse_url(url: &str) -> Result<Url> {
    let url = Url::parse(url).map_err(Error::InvalidBaseUrl)?;
    if url.cannot_be_a_base() {
        return Err(Error::InvalidBaseUrl(
            url::ParseError::RelativeUrlWithCannotBeABaseBase,
        ));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ClientConfig;
    use crate::{Error, StreamingMode};

    #[test]
    fn defaults() {
        let config = ClientConfig::new("env-key");
        let data_source = config.data_source_config().unwrap();

        assert_eq!(data_source.base_url.as_str(), "https://clientsdk.flagsync.dev/");
        assert_eq!(data_source.stream_url.as_str(), "https://clientstream.flagsync.dev/");
        assert_eq!(data_source.streaming_mode, StreamingMode::Streaming);
        assert_eq!(data_source.poll_interval, Duration::from_secs(300));
        assert_eq!(data_source.poll_retry_threshold, 3);
        assert!(!data_source.with_reasons);
        assert_eq!(config.max_cached_identities, 5);
        assert!(config.start_online);
    }

    #[test]
    fn evaluation_reasons_are_passed_to_data_source() {
        let config = ClientConfig::new("env-key").evaluation_reasons(true);

        assert!(config.data_source_config().unwrap().with_reasons);
    }

    #[test]
    fn rejects_invalid_urls() {
        assert!(matches!(
            ClientConfig::new("env-key").base_url("not a url").data_source_config(),
            Err(Error::InvalidBaseUrl(_))
        ));
        assert!(matches!(
            ClientConfig::new("env-key").stream_url("mailto:someone@example.com").data_source_config(),
            Err(Error::InvalidBaseUrl(_))
        ));
    }
}
