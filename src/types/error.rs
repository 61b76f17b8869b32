//! Error types for backhaul

use std::fmt;

/// Main error type for backhaul operations
#[derive(Debug, thiserror::Error)]
pub enum BackhaulError {
    /// The multiplexed session refused or failed an operation.
    #[error("session error: {0}")]
    Session(String),

    /// Dial, read, or write failure on the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The remote handler answered the call with an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// An RPC exceeded its deadline.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Every peer answered, but none holds a session to the worker.
    ///
    /// Distinct from transport failures so callers can decide between
    /// "no route to worker" and a generic retriable error.
    #[error("no peer server has a connection to the node")]
    NoNodeConn,

    /// Locator fan-out failed against every peer that could have answered.
    #[error(transparent)]
    Fanout(#[from] FanoutErrors),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Per-peer failures accumulated during a locator fan-out.
///
/// Only surfaced when no peer reported a connection; a single successful
/// response supersedes any number of these.
#[derive(Debug)]
pub struct FanoutErrors {
    pub errors: Vec<String>,
}

impl std::error::Error for FanoutErrors {}

impl fmt::Display for FanoutErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} peer query failure(s): ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl From<std::io::Error> for BackhaulError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<yamux::ConnectionError> for BackhaulError {
    fn from(err: yamux::ConnectionError) -> Self {
        Self::Session(err.to_string())
    }
}

/// Result type alias for backhaul operations
pub type Result<T> = std::result::Result<T, BackhaulError>;
