//! Connection status reported to the embedding application.
use std::fmt;

use serde::Serialize;

use crate::{flag::Timestamp, TransportError};

/// How the client is currently connected to the flag service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionMode {
    /// Not connected and not trying to connect.
    Offline,
    /// Opening (or re-opening after a failure) the streaming channel.
    EstablishingStreamingConnection,
    /// Receiving updates over the streaming channel.
    Streaming,
    /// Receiving updates by periodic polling.
    Polling,
}

impl ConnectionMode {
    /// Returns `true` for every mode other than [`ConnectionMode::Offline`].
    pub fn is_online(self) -> bool {
        self != ConnectionMode::Offline
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionMode::Offline => "offline",
            ConnectionMode::EstablishingStreamingConnection => "establishing streaming connection",
            ConnectionMode::Streaming => "streaming",
            ConnectionMode::Polling => "polling",
        })
    }
}

/// Why the last connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "payload")]
pub enum ConnectionFailureReason {
    /// No failure has been observed yet.
    #[default]
    None,
    /// The environment key was rejected.
    Unauthorized,
    /// The service responded with a non-successful HTTP status.
    HttpError(u16),
    /// Any other failure.
    UnknownError(String),
}

impl From<&TransportError> for ConnectionFailureReason {
    fn from(error: &TransportError) -> Self {
        match error {
            err if err.is_unauthorized() => ConnectionFailureReason::Unauthorized,
            TransportError::Status(code) => ConnectionFailureReason::HttpError(*code),
            err => ConnectionFailureReason::UnknownError(err.to_string()),
        }
    }
}

/// Snapshot of the client's connection status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInformation {
    /// Current connection mode.
    pub current_connection_mode: ConnectionMode,
    /// Reason of the most recent failure.
    pub last_connection_failure_reason: ConnectionFailureReason,
    /// When the data source last confirmed connectivity.
    pub last_successful_connection: Option<Timestamp>,
    /// When the data source last failed to connect or lost its connection.
    pub last_failed_connection: Option<Timestamp>,
    /// When flags were last known to be up to date with the service.
    pub last_known_flag_validity: Option<Timestamp>,
}

impl Default for ConnectionInformation {
    fn default() -> ConnectionInformation {
        ConnectionInformation {
            current_connection_mode: ConnectionMode::Offline,
            last_connection_failure_reason: ConnectionFailureReason::None,
            last_successful_connection: None,
            last_failed_connection: None,
            last_known_flag_validity: None,
        }
    }
}

impl fmt::Display for ConnectionInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn time(t: &Option<Timestamp>) -> String {
            t.map_or_else(
                || "NONE".to_owned(),
                |t| t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            )
        }

        let reason = match &self.last_connection_failure_reason {
            ConnectionFailureReason::None => "none".to_owned(),
            ConnectionFailureReason::Unauthorized => "unauthorized".to_owned(),
            ConnectionFailureReason::HttpError(code) => code.to_string(),
            ConnectionFailureReason::UnknownError(message) => message.clone(),
        };
        write!(
            f,
            "Current Connection Mode: {} | Last Connection Failure Reason: {} | \
             Last Successful Connection: {} | Last Failed Connection: {}",
            self.current_connection_mode,
            reason,
            time(&self.last_successful_connection),
            time(&self.last_failed_connection),
        )
    }
}
