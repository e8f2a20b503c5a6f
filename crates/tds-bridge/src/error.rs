//! Bridge error types.

use std::net::SocketAddr;

use tds_frame::ProtocolError;
use thiserror::Error;

/// Errors that can occur while relaying a connection.
///
/// Inside a directional loop every variant is fatal for that direction: it is
/// reported once to the observer and the direction then closes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// Header bytes could not be decoded.
    #[error("malformed frame header: {0}")]
    MalformedHeader(#[from] ProtocolError),

    /// I/O failure distinct from an orderly close.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Connecting to the backend failed.
    #[error("failed to connect to backend {addr}: {source}")]
    Connect {
        /// Backend address.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Connecting to the backend did not finish in time.
    #[error("backend connection to {0} timed out")]
    ConnectTimeout(SocketAddr),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An observer callback panicked.
    #[error("observer panicked in {callback}: {message}")]
    ObserverPanicked {
        /// The callback that panicked.
        callback: &'static str,
        /// Panic payload, if it was a string.
        message: String,
    },
}

impl BridgeError {
    /// Whether the error came from the transport rather than from framing.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Connect { .. } | Self::ConnectTimeout(_)
        )
    }
}

impl BridgeError {
    pub(crate) fn observer_panicked(
        callback: &'static str,
        payload: &(dyn std::any::Any + Send),
    ) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::ObserverPanicked { callback, message }
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Why a directional loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The source returned a zero-length read on a frame boundary.
    EndOfStream,
    /// The source closed part-way through a frame.
    ///
    /// Treated as a clean termination. The partial bytes were still
    /// forwarded.
    UnexpectedClose {
        /// Bytes of the incomplete frame that had been read.
        buffered: usize,
    },
    /// A read, decode or write failed; the error was reported first.
    Error,
    /// The loop was cancelled from outside.
    Cancelled,
}

impl CloseReason {
    /// Whether the direction ended without an error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::Error)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndOfStream => f.write_str("end of stream"),
            Self::UnexpectedClose { buffered } => {
                write!(f, "closed mid-frame after {buffered} bytes")
            }
            Self::Error => f.write_str("error"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}
