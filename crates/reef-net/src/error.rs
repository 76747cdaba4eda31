//! Error types for network operations.

use reef_types::NodeId;

/// Errors that can occur during network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The remote node is unknown or unreachable.
    #[error("node unreachable: {0}")]
    Unreachable(NodeId),

    /// The remote node did not answer in time.
    #[error("request to {0} timed out")]
    Timeout(NodeId),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A frame announced a payload larger than the protocol allows.
    #[error("message too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Announced payload length.
        len: usize,
        /// Protocol maximum.
        max: usize,
    },

    /// A frame ended before its announced length.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Announced length including the prefix.
        expected: usize,
        /// Bytes actually present.
        actual: usize,
    },

    /// An I/O error on a stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
