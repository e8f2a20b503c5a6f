//! Frame decoding errors.

use thiserror::Error;

/// Errors produced while decoding a frame header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Fewer bytes were available than a full header needs.
    #[error("incomplete frame header: expected {expected} bytes, got {actual}")]
    IncompleteHeader {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The declared frame length is shorter than the header itself.
    #[error("invalid frame length {length}: shorter than the {minimum}-byte header")]
    InvalidLength {
        /// Declared total length.
        length: u16,
        /// Smallest valid length.
        minimum: usize,
    },
}
