//! The data source: connection lifecycle, reconnect policy, and update application.
//!
//! [`DataSource`] is a plain state machine. Every input (control commands, stream events, fetch
//! results, timer expiry) arrives as a [`Message`] or an explicit [`DataSource::on_timer`] call
//! together with the current instant, so transitions can be driven synthetically in tests.
//! [`DataSourceThread`] runs the state machine on a background thread.
use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use url::Url;

use crate::{
    backoff::{jitter, Backoff, BackoffConfig},
    connection::{ConnectionInformation, ConnectionMode},
    flag::{FlagDelete, FlagPatch},
    flag_store::{FlagMap, UpdateSource},
    transport::{FetchResponse, StreamEvent, StreamSink, Transport, TransportRequest},
    Error, FeatureFlag, Identity, Result, TransportError,
};

/// Which channel the data source prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamingMode {
    /// Receive updates over a streaming channel. Falls back to polling if the service reports
    /// that streaming is not available.
    #[default]
    Streaming,
    /// Only poll.
    Polling,
}

/// State of the data source state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataSourceState {
    /// Not connected. The initial state.
    Offline,
    /// Waiting for the streaming handshake.
    Establishing,
    /// Connected over the streaming channel.
    StreamingActive,
    /// Polling at a fixed interval.
    PollingActive,
    /// Waiting before the next connection attempt.
    Backoff {
        /// Failures since the last reset.
        attempt: u32,
        /// When the next attempt starts.
        resume_at: Instant,
    },
}

/// Input of the data source control loop.
#[derive(Debug)]
pub(crate) enum Message {
    SetOnline(bool),
    Reconnect {
        identity: Identity,
    },
    /// An event from the stream opened for `generation`.
    Stream {
        generation: u64,
        event: StreamEvent,
    },
    /// Result of a fetch started for `generation`.
    Fetched {
        generation: u64,
        result: std::result::Result<FetchResponse, TransportError>,
    },
    Shutdown,
}

/// A decoded flag update.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FlagUpdate {
    Replace(FlagMap),
    Patch { key: String, flag: FeatureFlag },
    Delete { key: String, version: i64 },
}

/// Receives everything the data source produces.
pub(crate) trait UpdateSink: Send + Sync {
    /// Apply an update to the flags of `identity`.
    fn apply(&self, identity: &Identity, update: FlagUpdate, source: UpdateSource);

    /// The service confirmed that the flags of `identity` are current.
    fn up_to_date(&self, identity: &Identity);

    /// Connection information changed. `mode_changed` is set if the connection mode differs from
    /// the one reported last.
    fn connection_changed(&self, information: &ConnectionInformation, mode_changed: bool);

    /// A recoverable error occurred.
    fn error(&self, error: Error);
}

/// Settings of the data source.
#[derive(Debug, Clone)]
pub(crate) struct DataSourceConfig {
    pub base_url: Url,
    pub stream_url: Url,
    pub environment_key: String,
    pub streaming_mode: StreamingMode,
    pub poll_interval: Duration,
    pub poll_jitter: Duration,
    /// Consecutive poll failures tolerated before backing off.
    pub poll_retry_threshold: u32,
    /// Request evaluation reasons with every flag.
    pub with_reasons: bool,
    pub backoff: BackoffConfig,
}

/// The data source state machine.
pub(crate) struct DataSource {
    config: DataSourceConfig,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn UpdateSink>,
    sender: Sender<Message>,

    identity: Option<Identity>,
    online: bool,
    state: DataSourceState,
    /// Bumped whenever the current channel is abandoned. Stream events and fetch results tagged
    /// with an older generation are dropped.
    generation: u64,
    /// Set once the service rejected streaming. Lasts for the rest of the session.
    streaming_unavailable: bool,
    backoff: Backoff,
    poll_failures: u32,
    next_poll: Option<Instant>,
    fetch_in_flight: bool,
    etag: Option<String>,
    information: ConnectionInformation,
    reported_mode: ConnectionMode,
}

impl DataSource {
    pub fn new(
        config: DataSourceConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn UpdateSink>,
        sender: Sender<Message>,
        online: bool,
    ) -> DataSource {
        let backoff = Backoff::new(config.backoff.clone());
        DataSource {
            config,
            transport,
            sink,
            sender,
            identity: None,
            online,
            state: DataSourceState::Offline,
            generation: 0,
            streaming_unavailable: false,
            backoff,
            poll_failures: 0,
            next_poll: None,
            fetch_in_flight: false,
            etag: None,
            information: ConnectionInformation::default(),
            reported_mode: ConnectionMode::Offline,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> DataSourceState {
        self.state
    }

    #[cfg(test)]
    pub fn information(&self) -> &ConnectionInformation {
        &self.information
    }

    /// When [`DataSource::on_timer`] must be called next.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DataSourceState::Backoff { resume_at, .. } => Some(resume_at),
            DataSourceState::PollingActive if !self.fetch_in_flight => self.next_poll,
            _ => None,
        }
    }

    /// Process a message. Returns `false` once the data source has shut down.
    pub fn handle(&mut self, message: Message, now: Instant) -> bool {
        match message {
            Message::SetOnline(true) => {
                self.online = true;
                // Going online cancels a pending backoff timer.
                if matches!(
                    self.state,
                    DataSourceState::Offline | DataSourceState::Backoff { .. }
                ) {
                    self.start(now);
                }
            }
            Message::SetOnline(false) => {
                self.online = false;
                self.go_offline();
            }
            Message::Reconnect { identity } => {
                log::debug!(target: "flagsync", identity = &identity; "reconnecting for identity");
                self.identity = Some(identity);
                self.etag = None;
                self.poll_failures = 0;
                self.backoff.reset();
                self.start(now);
            }
            Message::Stream { generation, event } => {
                if generation != self.generation || !self.is_streaming() {
                    log::trace!(target: "flagsync", "dropping event of abandoned stream");
                } else {
                    self.on_stream_event(event, now);
                }
            }
            Message::Fetched { generation, result } => {
                if generation != self.generation {
                    log::trace!(target: "flagsync", "dropping result of abandoned fetch");
                } else {
                    self.fetch_in_flight = false;
                    self.on_fetched(result, now);
                }
            }
            Message::Shutdown => {
                self.go_offline();
                return false;
            }
        }
        true
    }

    /// Fire timers that expired at `now`.
    pub fn on_timer(&mut self, now: Instant) {
        match self.state {
            DataSourceState::Backoff { resume_at, .. } if resume_at <= now => {
                log::debug!(target: "flagsync", "backoff expired");
                self.start(now);
            }
            DataSourceState::PollingActive => {
                if self.next_poll.map_or(false, |at| at <= now) {
                    self.next_poll = None;
                    self.start_fetch();
                }
            }
            _ => {}
        }
    }

    fn is_streaming(&self) -> bool {
        matches!(
            self.state,
            DataSourceState::Establishing | DataSourceState::StreamingActive
        )
    }

    fn uses_streaming(&self) -> bool {
        self.config.streaming_mode == StreamingMode::Streaming && !self.streaming_unavailable
    }

    /// Abandon the current channel and connect anew.
    fn start(&mut self, now: Instant) {
        self.abandon_channel();
        let Some(identity) = self.identity.clone() else {
            self.set_state(DataSourceState::Offline, ConnectionMode::Offline);
            return;
        };
        if !self.online {
            self.set_state(DataSourceState::Offline, ConnectionMode::Offline);
            return;
        }

        if self.uses_streaming() {
            self.set_state(
                DataSourceState::Establishing,
                ConnectionMode::EstablishingStreamingConnection,
            );
            let request = self.stream_request(&identity);
            let sink = StreamSink::new(self.generation, self.sender.clone());
            if let Err(err) = self.transport.open_stream(&request, sink) {
                self.on_failure(err, now);
            }
        } else {
            self.poll_failures = 0;
            self.set_state(DataSourceState::PollingActive, ConnectionMode::Polling);
            self.start_fetch();
        }
    }

    fn go_offline(&mut self) {
        self.abandon_channel();
        self.set_state(DataSourceState::Offline, ConnectionMode::Offline);
    }

    fn abandon_channel(&mut self) {
        if self.is_streaming() {
            self.transport.close_stream();
        }
        self.generation += 1;
        self.fetch_in_flight = false;
        self.next_poll = None;
    }

    fn on_stream_event(&mut self, event: StreamEvent, now: Instant) {
        match event {
            StreamEvent::Open => self.on_stream_open(now),
            StreamEvent::Put(body) => {
                self.on_stream_open(now);
                self.apply(decode_put(&body), UpdateSource::Stream);
            }
            StreamEvent::Patch(body) => {
                self.on_stream_open(now);
                self.apply(decode_patch(&body), UpdateSource::Stream);
            }
            StreamEvent::Delete(body) => {
                self.on_stream_open(now);
                self.apply(decode_delete(&body), UpdateSource::Stream);
            }
            StreamEvent::Ping => {
                self.on_stream_open(now);
                log::debug!(target: "flagsync", "received ping, fetching flags");
                self.start_fetch();
            }
            StreamEvent::Heartbeat => {
                log::trace!(target: "flagsync", "stream heartbeat");
            }
            StreamEvent::Error(err) => self.on_failure(err, now),
            StreamEvent::Closed => {
                self.on_failure(TransportError::Network("stream closed by server".into()), now)
            }
        }
    }

    fn on_stream_open(&mut self, now: Instant) {
        if self.state != DataSourceState::Establishing {
            return;
        }
        log::debug!(target: "flagsync", "stream established");
        self.backoff.mark_connected(now);
        self.information.last_successful_connection = Some(chrono::Utc::now());
        self.set_state(DataSourceState::StreamingActive, ConnectionMode::Streaming);
    }

    fn on_fetched(
        &mut self,
        result: std::result::Result<FetchResponse, TransportError>,
        now: Instant,
    ) {
        let polling = self.state == DataSourceState::PollingActive;
        match result {
            Ok(response) => {
                if polling {
                    self.poll_failures = 0;
                    self.backoff.reset();
                    self.information.last_successful_connection = Some(chrono::Utc::now());
                    self.schedule_poll(now);
                }
                match response {
                    FetchResponse::Flags { body, etag } => {
                        if self.apply(decode_put(&body), UpdateSource::Poll) {
                            self.etag = etag;
                        }
                    }
                    FetchResponse::NotModified => {
                        log::debug!(target: "flagsync", "flags not modified");
                        if let Some(identity) = &self.identity {
                            self.sink.up_to_date(identity);
                        }
                        self.mark_flags_valid();
                    }
                }
            }
            Err(err) if polling && err.is_recoverable() => {
                self.poll_failures += 1;
                log::warn!(target: "flagsync", failures = self.poll_failures; "failed to poll flags: {err}");
                if self.poll_failures > self.config.poll_retry_threshold {
                    self.on_failure(err, now);
                } else {
                    self.record_failure(&err);
                    self.sink.error(err.into());
                    self.schedule_poll(now);
                }
            }
            Err(err) if polling || !err.is_recoverable() => self.on_failure(err, now),
            Err(err) => {
                // A ping-triggered fetch failed. The stream itself is still up.
                log::warn!(target: "flagsync", "failed to fetch flags after ping: {err}");
                self.sink.error(err.into());
            }
        }
    }

    fn on_failure(&mut self, err: TransportError, now: Instant) {
        self.record_failure(&err);
        self.sink.error(err.clone().into());

        if err == TransportError::StreamingUnavailable {
            log::warn!(target: "flagsync", "streaming is not available, falling back to polling");
            self.streaming_unavailable = true;
            self.start(now);
        } else if !err.is_recoverable() {
            log::warn!(target: "flagsync", "unrecoverable error, going offline: {err}");
            self.go_offline();
        } else {
            log::warn!(target: "flagsync", "connection failed: {err}");
            self.abandon_channel();
            let delay = self.backoff.next_delay(now);
            let attempt = self.backoff.attempt();
            log::debug!(target: "flagsync", "backing off for {delay:?} after {attempt} failures");
            let mode = if self.uses_streaming() {
                ConnectionMode::EstablishingStreamingConnection
            } else {
                ConnectionMode::Polling
            };
            self.set_state(
                DataSourceState::Backoff {
                    attempt,
                    resume_at: now + delay,
                },
                mode,
            );
        }
    }

    fn record_failure(&mut self, err: &TransportError) {
        self.information.last_failed_connection = Some(chrono::Utc::now());
        self.information.last_connection_failure_reason = err.into();
        self.report();
    }

    /// Hand a decoded update to the sink. Returns `false` if the payload was malformed.
    fn apply(&mut self, update: Result<FlagUpdate>, source: UpdateSource) -> bool {
        let Some(identity) = &self.identity else {
            return false;
        };
        match update {
            Ok(update) => {
                self.sink.apply(identity, update, source);
                self.mark_flags_valid();
                true
            }
            Err(err) => {
                log::warn!(target: "flagsync", identity; "dropping flag payload: {err}");
                self.sink.error(err);
                false
            }
        }
    }

    fn mark_flags_valid(&mut self) {
        self.information.last_known_flag_validity = Some(chrono::Utc::now());
        self.report();
    }

    fn start_fetch(&mut self) {
        let Some(identity) = &self.identity else {
            return;
        };
        if self.fetch_in_flight {
            return;
        }
        self.fetch_in_flight = true;

        let request = self.poll_request(identity);
        let transport = Arc::clone(&self.transport);
        let sender = self.sender.clone();
        let generation = self.generation;
        let spawned = std::thread::Builder::new()
            .name("flagsync-fetch".to_owned())
            .spawn(move || {
                let result = transport.fetch(&request);
                let _ = sender.send(Message::Fetched { generation, result });
            });
        if let Err(err) = spawned {
            log::warn!(target: "flagsync", "failed to start fetch thread: {err}");
            let _ = self.sender.send(Message::Fetched {
                generation,
                result: Err(TransportError::Network(err.to_string())),
            });
        }
    }

    fn schedule_poll(&mut self, now: Instant) {
        self.next_poll = Some(now + jitter(self.config.poll_interval, self.config.poll_jitter));
    }

    fn set_state(&mut self, state: DataSourceState, mode: ConnectionMode) {
        if self.state != state {
            log::debug!(target: "flagsync", "data source state: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.information.current_connection_mode = mode;
        self.report();
    }

    fn report(&mut self) {
        let mode_changed = self.reported_mode != self.information.current_connection_mode;
        self.reported_mode = self.information.current_connection_mode;
        self.sink.connection_changed(&self.information, mode_changed);
    }

    /// Append path segments to `base`. `base` must be a hierarchical URL, which the client config
    /// checks up front.
    fn endpoint(&self, base: &Url, segments: &[&str]) -> Url {
        let mut url = base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if self.config.with_reasons {
            url.query_pairs_mut().append_pair("withReasons", "true");
        }
        url
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "Authorization".to_owned(),
                format!("api_key {}", self.config.environment_key),
            ),
            (
                "User-Agent".to_owned(),
                format!("flagsync-rust/{}", env!("CARGO_PKG_VERSION")),
            ),
        ]
    }

    fn stream_request(&self, identity: &Identity) -> TransportRequest {
        TransportRequest {
            url: self.endpoint(
                &self.config.stream_url,
                &["meval", &identity.encoded_context()],
            ),
            headers: self.headers(),
            etag: None,
        }
    }

    fn poll_request(&self, identity: &Identity) -> TransportRequest {
        TransportRequest {
            url: self.endpoint(
                &self.config.base_url,
                &["msdk", "evalx", "contexts", &identity.encoded_context()],
            ),
            headers: self.headers(),
            etag: self.etag.clone(),
        }
    }
}


fn malformed(err: serde_json::Error) -> Error {
    Error::MalformedPayload(err.to_string())
}

fn decode_put(body: &str) -> Result<FlagUpdate> {
    let flags: HashMap<String, FeatureFlag> = serde_json::from_str(body).map_err(malformed)?;
    Ok(FlagUpdate::Replace(flags))
}

fn decode_patch(body: &str) -> Result<FlagUpdate> {
    let FlagPatch { key, flag } = serde_json::from_str(body).map_err(malformed)?;
    Ok(FlagUpdate::Patch { key, flag })
}

fn decode_delete(body: &str) -> Result<FlagUpdate> {
    let FlagDelete { key, version } = serde_json::from_str(body).map_err(malformed)?;
    Ok(FlagUpdate::Delete { key, version })
}

/// Runs a [`DataSource`] on a background thread.
pub(crate) struct DataSourceThread {
    sender: Sender<Message>,
    join_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl DataSourceThread {
    /// Start the control loop. The data source stays offline until it receives an identity.
    pub fn start(
        config: DataSourceConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn UpdateSink>,
        online: bool,
    ) -> std::io::Result<DataSourceThread> {
        let (sender, receiver) = mpsc::channel();
        let data_source = DataSource::new(config, transport, sink, sender.clone(), online);

        let join_handle = std::thread::Builder::new()
            .name("flagsync-data-source".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    run(data_source, receiver)
                }));
                if result.is_err() {
                    log::error!(target: "flagsync", "data source thread panicked");
                }
            })?;

        Ok(DataSourceThread {
            sender,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.send(Message::SetOnline(online));
    }

    pub fn reconnect(&self, identity: Identity) {
        self.send(Message::Reconnect { identity });
    }

    /// Stop the control loop and wait for it to exit. Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Message::Shutdown);
        let join_handle = self
            .join_handle
            .lock()
            .expect("thread holding data source lock should not panic")
            .take();
        match join_handle {
            Some(join_handle) => join_handle.join().map_err(|_| Error::ThreadPanicked),
            None => Ok(()),
        }
    }

    fn send(&self, message: Message) {
        // The thread only exits on shutdown, so a send error means we're shut down already.
        if self.sender.send(message).is_err() {
            log::debug!(target: "flagsync", "data source is shut down, dropping command");
        }
    }
}

fn run(mut data_source: DataSource, receiver: Receiver<Message>) {
    log::debug!(target: "flagsync", "data source thread started");
    loop {
        let message = match data_source.deadline() {
            Some(deadline) => {
                match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match receiver.recv() {
                Ok(message) => Some(message),
                Err(_) => break,
            },
        };

        let now = Instant::now();
        match message {
            Some(message) => {
                if !data_source.handle(message, now) {
                    break;
                }
            }
            None => data_source.on_timer(now),
        }
    }
    log::debug!(target: "flagsync", "data source thread stopped");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            mpsc::{self, Receiver},
            Arc, Mutex,
        },
        time::{Duration, Instant},
    };

    use url::Url;

    use super::{
        DataSource, DataSourceConfig, DataSourceState, FlagUpdate, Message, StreamingMode,
        UpdateSink,
    };
    use crate::{
        backoff::BackoffConfig,
        connection::{ConnectionFailureReason, ConnectionInformation, ConnectionMode},
        flag_store::UpdateSource,
        transport::{mock::MockTransport, FetchResponse, StreamEvent},
        Error, FeatureFlag, FlagValue, Identity, TransportError,
    };

    #[derive(Debug, Clone, PartialEq)]
    enum Recorded {
        Apply(Identity, FlagUpdate, UpdateSource),
        UpToDate,
        Mode(ConnectionMode),
        Error(String),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Recorded>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<Recorded> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn modes(&self) -> Vec<ConnectionMode> {
            self.take()
                .into_iter()
                .filter_map(|e| match e {
                    Recorded::Mode(mode) => Some(mode),
                    _ => None,
                })
                .collect()
        }
    }

    impl UpdateSink for RecordingSink {
        fn apply(&self, identity: &Identity, update: FlagUpdate, source: UpdateSource) {
            self.events
                .lock()
                .unwrap()
                .push(Recorded::Apply(identity.clone(), update, source));
        }

        fn up_to_date(&self, _identity: &Identity) {
            self.events.lock().unwrap().push(Recorded::UpToDate);
        }

        fn connection_changed(&self, information: &ConnectionInformation, mode_changed: bool) {
            if mode_changed {
                self.events
                    .lock()
                    .unwrap()
                    .push(Recorded::Mode(information.current_connection_mode));
            }
        }

        fn error(&self, error: Error) {
            self.events.lock().unwrap().push(Recorded::Error(error.to_string()));
        }
    }

    struct Harness {
        data_source: DataSource,
        receiver: Receiver<Message>,
        transport: MockTransport,
        sink: Arc<RecordingSink>,
        now: Instant,
    }

    impl Harness {
        fn new(streaming_mode: StreamingMode) -> Harness {
            Harness::with_reasons(streaming_mode, false)
        }

        fn with_reasons(streaming_mode: StreamingMode, with_reasons: bool) -> Harness {
            let config = DataSourceConfig {
                base_url: Url::parse("https://sdk.example.com").unwrap(),
                stream_url: Url::parse("https://stream.example.com/").unwrap(),
                environment_key: "env-key".into(),
                streaming_mode,
                poll_interval: Duration::from_secs(300),
                poll_jitter: Duration::ZERO,
                poll_retry_threshold: 1,
                with_reasons,
                backoff: BackoffConfig::new().with_jitter_ratio(0.0),
            };
            let (sender, receiver) = mpsc::channel();
            let transport = MockTransport::new();
            let sink = Arc::new(RecordingSink::default());
            let data_source =
                DataSource::new(config, Arc::new(transport.clone()), sink.clone(), sender, true);
            Harness {
                data_source,
                receiver,
                transport,
                sink,
                now: Instant::now(),
            }
        }

        fn handle(&mut self, message: Message) {
            self.data_source.handle(message, self.now);
        }

        fn connect(&mut self, context_key: &str) {
            self.handle(Message::Reconnect {
                identity: Identity::new(context_key, "env-key"),
            });
        }

        /// Emit a stream event and feed it into the state machine.
        fn emit(&mut self, event: StreamEvent) {
            assert!(self.transport.emit(event));
            self.pump_one();
        }

        /// Feed the next queued message (stream event or fetch result) into the state machine.
        fn pump_one(&mut self) {
            let message = self
                .receiver
                .recv_timeout(Duration::from_secs(5))
                .expect("message should arrive");
            self.handle(message);
        }

        fn advance_to_deadline(&mut self) {
            self.now = self.data_source.deadline().expect("timer should be armed");
            self.data_source.on_timer(self.now);
        }
    }

    fn identity(context_key: &str) -> Identity {
        Identity::new(context_key, "env-key")
    }

    #[test]
    fn opens_stream_with_identity_url_and_auth_header() {
        let mut h = Harness::new(StreamingMode::Streaming);
        h.connect("user");

        let request = &h.transport.stream_requests()[0];
        let encoded = identity("user").encoded_context();
        assert_eq!(
            request.url.as_str(),
            format!("https://stream.example.com/meval/{encoded}")
        );
        assert!(request
            .headers
            .contains(&("Authorization".to_owned(), "api_key env-key".to_owned())));
        assert_eq!(h.data_source.state(), DataSourceState::Establishing);
    }

    #[test]
    fn stream_events_are_applied() {
        let mut h = Harness::new(StreamingMode::Streaming);
        h.connect("user");
        h.emit(StreamEvent::Open);
        h.sink.take();

        h.emit(StreamEvent::Put(r#"{"a": {"value": true, "variation": 0, "version": 1}}"#.into()));
        h.emit(StreamEvent::Patch(r#"{"key": "a", "value": false, "variation": 1, "version": 2}"#.into()));
        h.emit(StreamEvent::Delete(r#"{"key": "a", "version": 3}"#.into()));

        let applied: Vec<_> = h
            .sink
            .take()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Apply(id, update, UpdateSource::Stream) => {
                    assert_eq!(id, identity("user"));
                    Some(update)
                }
                _ => None,
            })
            .collect();
        assert_eq!(applied.len(), 3);
        assert!(matches!(&applied[0], FlagUpdate::Replace(flags) if flags["a"].value == FlagValue::Bool(true)));
        assert_eq!(
            applied[1],
            FlagUpdate::Patch {
                key: "a".into(),
                flag: FeatureFlag::new(false).with_variation(1).with_model_version(2)
            }
        );
        assert_eq!(
            applied[2],
            FlagUpdate::Delete {
                key: "a".into(),
                version: 3
            }
        );
        assert_eq!(h.data_source.state(), DataSourceState::StreamingActive);
        assert!(h.data_source.information().last_known_flag_validity.is_some());
    }

    #[test]
    fn reports_mode_transitions() {
        let mut h = Harness::new(StreamingMode::Streaming);
        h.connect("user");
        h.emit(StreamEvent::Open);
        h.handle(Message::SetOnline(false));

        assert_eq!(
            h.sink.modes(),
            vec![
                ConnectionMode::EstablishingStreamingConnection,
                ConnectionMode::Streaming,
                ConnectionMode::Offline
            ]
        );
        assert_eq!(h.transport.streams_closed(), 1);
    }

    #[test]
    fn malformed_payload_is_dropped_without_state_change() {
        let mut h = Harness::new(StreamingMode::Streaming);
        h.connect("user");
        h.emit(StreamEvent::Open);
        h.sink.take();

        h.emit(StreamEvent::Put("{not json".into()));

        let events = h.sink.take();
        assert!(matches!(events.as_slice(), [Recorded::Error(message)] if message.contains("malformed")));
        assert_eq!(h.data_source.state(), DataSourceState::StreamingActive);
    }

    #[test]
    fn stream_failures_back_off_and_resume() {
        let mut h = Harness::new(StreamingMode::Streaming);
        h.connect("user");

        let mut delays = Vec::new();
        for attempt in 1..=3 {
            h.emit(StreamEvent::Error(TransportError::Network("reset".into())));
            let DataSourceState::Backoff { attempt: a, resume_at } = h.data_source.state() else {
                panic!("expected backoff, got {:?}", h.data_source.state());
            };
            assert_eq!(a, attempt);
            delays.push(resume_at - h.now);

            h.advance_to_deadline();
            assert_eq!(h.data_source.state(), DataSourceState::Establishing);
        }

        assert_eq!(
            delays,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert_eq!(h.transport.streams_opened(), 4);
        assert_eq!(
            h.data_source.information().last_connection_failure_reason,
            ConnectionFailureReason::UnknownError("network error: reset".into())
        );
    }

    #[test]
    fn going_online_cancels_backoff() {
        let mut h = Harness::new(StreamingMode::Streaming);
        h.connect("user");
        h.emit(StreamEvent::Closed);
        assert!(matches!(h.data_source.state(), DataSourceState::Backoff { .. }));

        h.handle(Message::SetOnline(true));

        assert_eq!(h.data_source.state(), DataSourceState::Establishing);
        assert_eq!(h.transport.streams_opened(), 2);
    }

    #[test]
    fn events_of_abandoned_streams_are_ignored() {
        let mut h = Harness::new(StreamingMode::Streaming);
        h.connect("first");
        h.connect("second");
        h.sink.take();

        // The first stream was opened for generation 1.
        h.handle(Message::Stream {
            generation: 1,
            event: StreamEvent::Put(r#"{"a": {"value": 1}}"#.into()),
        });

        assert!(h.sink.take().is_empty());
        assert_eq!(h.data_source.state(), DataSourceState::Establishing);
    }

    #[test]
    fn streaming_unavailable_falls_back_to_polling_for_the_session() {
        let mut h = Harness::new(StreamingMode::Streaming);
        h.transport.fail_next_open(TransportError::StreamingUnavailable);
        h.transport.push_fetch_result(Ok(FetchResponse::Flags {
            body: r#"{"a": {"value": "x"}}"#.into(),
            etag: Some("v1".into()),
        }));

        h.connect("user");
        assert_eq!(h.data_source.state(), DataSourceState::PollingActive);
        h.pump_one();

        let request = &h.transport.fetch_requests()[0];
        let encoded = identity("user").encoded_context();
        assert_eq!(
            request.url.as_str(),
            format!("https://sdk.example.com/msdk/evalx/contexts/{encoded}")
        );
        assert!(h
            .sink
            .take()
            .iter()
            .any(|e| matches!(e, Recorded::Apply(_, FlagUpdate::Replace(_), UpdateSource::Poll))));

        h.connect("other");
        assert_eq!(h.transport.streams_opened(), 1);
        assert_eq!(h.data_source.state(), DataSourceState::PollingActive);
    }

    #[test]
    fn polling_sends_etag_and_treats_not_modified_as_up_to_date() {
        let mut h = Harness::new(StreamingMode::Polling);
        h.transport.push_fetch_result(Ok(FetchResponse::Flags {
            body: "{}".into(),
            etag: Some("v1".into()),
        }));
        h.transport.push_fetch_result(Ok(FetchResponse::NotModified));

        h.connect("user");
        h.pump_one();
        h.advance_to_deadline();
        h.pump_one();

        let requests = h.transport.fetch_requests();
        assert_eq!(requests[0].etag, None);
        assert_eq!(requests[1].etag.as_deref(), Some("v1"));
        assert!(h.sink.take().contains(&Recorded::UpToDate));
        assert_eq!(
            h.data_source.deadline(),
            Some(h.now + Duration::from_secs(300))
        );
    }

    #[test]
    fn poll_failures_back_off_after_threshold() {
        let mut h = Harness::new(StreamingMode::Polling);

        h.connect("user");
        h.pump_one();
        assert_eq!(h.data_source.state(), DataSourceState::PollingActive);

        h.advance_to_deadline();
        h.pump_one();
        assert!(matches!(
            h.data_source.state(),
            DataSourceState::Backoff { attempt: 1, .. }
        ));
        assert_eq!(
            h.sink.modes(),
            vec![ConnectionMode::Polling],
            "backoff in a polling session stays in polling mode"
        );
    }

    #[test]
    fn poll_failures_are_tolerated_again_after_backoff() {
        let mut h = Harness::new(StreamingMode::Polling);
        h.connect("user");
        h.pump_one();
        h.advance_to_deadline();
        h.pump_one();
        assert!(matches!(h.data_source.state(), DataSourceState::Backoff { .. }));

        h.advance_to_deadline();
        assert_eq!(h.data_source.state(), DataSourceState::PollingActive);
        h.pump_one();

        assert_eq!(h.data_source.state(), DataSourceState::PollingActive);
        assert_eq!(
            h.data_source.deadline(),
            Some(h.now + Duration::from_secs(300))
        );
    }

    #[test]
    fn requests_evaluation_reasons_when_configured() {
        let mut h = Harness::with_reasons(StreamingMode::Streaming, true);
        h.transport.fail_next_open(TransportError::StreamingUnavailable);

        h.connect("user");
        h.pump_one();

        let encoded = identity("user").encoded_context();
        assert_eq!(
            h.transport.stream_requests()[0].url.as_str(),
            format!("https://stream.example.com/meval/{encoded}?withReasons=true")
        );
        assert_eq!(
            h.transport.fetch_requests()[0].url.as_str(),
            format!("https://sdk.example.com/msdk/evalx/contexts/{encoded}?withReasons=true")
        );
    }

    #[test]
    fn unauthorized_goes_offline_until_online_again() {
        let mut h = Harness::new(StreamingMode::Streaming);
        h.transport.fail_next_open(TransportError::Status(401));

        h.connect("user");

        assert_eq!(h.data_source.state(), DataSourceState::Offline);
        assert_eq!(h.data_source.deadline(), None);
        assert_eq!(
            h.data_source.information().last_connection_failure_reason,
            ConnectionFailureReason::Unauthorized
        );
        assert!(h
            .sink
            .take()
            .contains(&Recorded::Error(Error::Unauthorized.to_string())));

        h.handle(Message::SetOnline(true));
        assert_eq!(h.data_source.state(), DataSourceState::Establishing);
    }

    #[test]
    fn ping_triggers_fetch() {
        let mut h = Harness::new(StreamingMode::Streaming);
        h.transport.push_fetch_result(Ok(FetchResponse::Flags {
            body: r#"{"a": {"value": 2, "version": 7}}"#.into(),
            etag: None,
        }));
        h.connect("user");
        h.emit(StreamEvent::Open);
        h.sink.take();

        h.emit(StreamEvent::Ping);
        h.pump_one();

        assert_eq!(h.transport.fetch_requests().len(), 1);
        assert!(h
            .sink
            .take()
            .iter()
            .any(|e| matches!(e, Recorded::Apply(_, FlagUpdate::Replace(f), UpdateSource::Poll) if f.contains_key("a"))));
        assert_eq!(h.data_source.state(), DataSourceState::StreamingActive);
    }

    #[test]
    fn stays_offline_without_identity_or_when_offline() {
        let mut h = Harness::new(StreamingMode::Streaming);
        h.handle(Message::SetOnline(true));
        assert_eq!(h.data_source.state(), DataSourceState::Offline);

        h.handle(Message::SetOnline(false));
        h.connect("user");
        assert_eq!(h.data_source.state(), DataSourceState::Offline);
        assert_eq!(h.transport.streams_opened(), 0);
    }

    #[test]
    fn shutdown_stops_handling() {
        let mut h = Harness::new(StreamingMode::Streaming);
        h.connect("user");

        assert!(!h.data_source.handle(Message::Shutdown, h.now));
        assert_eq!(h.data_source.state(), DataSourceState::Offline);
    }
}
