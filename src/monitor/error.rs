//! Error types for the monitoring engine

use super::record::ProgressRecord;
use std::time::Duration;
use thiserror::Error;

/// The remote call could not be issued
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Session is not connected")]
    NotConnected,

    #[error("Invalid task spec: {0}")]
    InvalidSpec(String),

    #[error("Call rejected by session: {0}")]
    Rejected(String),
}

/// Opening a push channel failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("Session is not connected")]
    NotConnected,

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Subscriptions are not supported by this session")]
    Unsupported,
}

/// A one-shot poll read failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("Session is not connected")]
    NotConnected,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Failed to decode resource content: {0}")]
    Decode(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Waiting on the progress store did not produce a newer record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("No change within {0:?}")]
    Timeout(Duration),

    #[error("Progress store is closed")]
    Closed,
}

/// Outcome of a monitoring session that did not end in a terminal record
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Timed out after {elapsed:?} (last known: {last})")]
    Timeout {
        elapsed: Duration,
        last: ProgressRecord,
    },

    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    #[error("Progress observation unavailable: {0}")]
    ObservationUnavailable(String),
}

impl MonitorError {
    /// Short machine-readable tag for the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dispatch(_) => "dispatch",
            Self::Timeout { .. } => "timeout",
            Self::ProtocolAnomaly(_) => "protocol_anomaly",
            Self::ObservationUnavailable(_) => "observation_unavailable",
        }
    }
}
