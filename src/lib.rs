//! A client-side feature flag runtime: keeps the flags of one identity in memory, synchronized
//! with the flag service, and cached on durable storage.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that serves already-evaluated flag values for an
//! [`Identity`] (a context key within an environment). The client:
//! - answers flag reads from an in-memory store without ever blocking on the network,
//! - keeps the store current over a streaming connection, falling back to polling,
//! - reconnects with exponential backoff after failures,
//! - notifies observers about changed flags, unchanged updates, connection mode changes, and
//!   errors,
//! - persists flags of the most recently used identities so the next start can serve them right
//!   away.
//!
//! An [`EvaluationLogger`] may be provided to hand flag evaluations to your analytics pipeline.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Flag reads never fail. Network failures, malformed payloads, and storage failures are handled
//! in the background and reported to error observers (see [`Client::observe_error`]).
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, with the `flagsync` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into client operations.
//!
//! # Threads
//!
//! A client runs a few named background threads:
//! - `flagsync-data-source` drives the connection;
//! - short-lived `flagsync-fetch` threads perform requests;
//! - one `flagsync-stream` thread per connection reads the streaming channel;
//! - `flagsync-notifier` invokes observers;
//! - `flagsync-cache` writes the persistent cache.
//!
//! They are stopped by [`Client::shutdown`] or when the client is dropped.
//!
//! # Examples
//!
//! A runnable example can be found in the `demos/simple` directory of the repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod backoff;
pub mod change_notifier;
pub mod connection;
pub mod flag_cache;
pub mod flag_store;
pub mod http_transport;
pub mod storage;
pub mod transport;

mod client;
mod config;
mod data_source;
mod error;
mod evaluation_logger;
mod flag;
mod identity;

pub use backoff::BackoffConfig;
pub use change_notifier::{ChangedFlag, ChangedFlags, ObserverOwner};
pub use client::Client;
pub use config::ClientConfig;
pub use connection::{ConnectionFailureReason, ConnectionInformation, ConnectionMode};
pub use data_source::StreamingMode;
pub use error::{Error, Result, TransportError};
pub use evaluation_logger::{EvaluationDetail, EvaluationEvent, EvaluationLogger};
pub use flag::{FeatureFlag, FlagValue, Timestamp};
pub use identity::Identity;
pub use storage::{FileStore, KeyValueStore, MemoryStore};
