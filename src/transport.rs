//! The network capability driven by the data source.
//!
//! The data source owns all reconnect and backoff policy. A [`Transport`] only knows how to open a
//! streaming channel, close it, and perform a single fetch.
use std::sync::mpsc::Sender;

use url::Url;

use crate::{data_source::Message, TransportError};

/// A request to the flag service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    #[allow(missing_docs)]
    pub url: Url,
    #[allow(missing_docs)]
    pub headers: Vec<(String, String)>,
    /// ETag of the last successful fetch, sent as `If-None-Match`.
    pub etag: Option<String>,
}

/// A successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResponse {
    /// The full flag payload for the identity.
    Flags {
        /// Raw JSON body.
        body: String,
        /// ETag header, if the server sent one.
        etag: Option<String>,
    },
    /// The server confirmed that the flags have not changed since `etag`.
    NotModified,
}

/// An event received on the streaming channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The channel handshake completed.
    Open,
    /// Full flag payload.
    Put(String),
    /// A single-flag update.
    Patch(String),
    /// A single-flag deletion.
    Delete(String),
    /// Flags changed, fetch them with a regular request.
    Ping,
    /// Keep-alive.
    Heartbeat,
    /// The channel failed.
    Error(TransportError),
    /// The server closed the channel.
    Closed,
}

/// Where a transport delivers streaming events.
///
/// Each sink is bound to one connection attempt. Events sent after the data source moved on (went
/// offline, switched identity, or reconnected) are silently discarded.
#[derive(Debug, Clone)]
pub struct StreamSink {
    generation: u64,
    sender: Sender<Message>,
}

impl StreamSink {
    pub(crate) fn new(generation: u64, sender: Sender<Message>) -> StreamSink {
        StreamSink { generation, sender }
    }

    /// Deliver an event to the data source.
    ///
    /// Returns `false` if the data source has shut down, in which case the transport should stop
    /// reading from the channel.
    pub fn send(&self, event: StreamEvent) -> bool {
        self.sender
            .send(Message::Stream {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Network capability used by the data source.
///
/// Implementations must not retry on their own: every failure is reported back and the data
/// source decides when to try again.
pub trait Transport: Send + Sync {
    /// Open the streaming channel and deliver its events to `sink`.
    ///
    /// This must not block waiting for events. Implementations usually spawn a reader thread.
    /// Returning an error is equivalent to sending [`StreamEvent::Error`].
    fn open_stream(&self, request: &TransportRequest, sink: StreamSink) -> Result<(), TransportError>;

    /// Close the streaming channel opened last. Closing an already closed channel is a no-op.
    fn close_stream(&self);

    /// Perform a single blocking fetch.
    fn fetch(&self, request: &TransportRequest) -> Result<FetchResponse, TransportError>;
}
