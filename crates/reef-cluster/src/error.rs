//! Error types for the cluster crate.

use reef_types::NodeId;

/// Errors produced by the cluster state.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The requested node was not found in the cluster state.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
}
