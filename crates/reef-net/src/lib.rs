//! Repair wire protocol and transport abstraction.
//!
//! This crate provides:
//!
//! - [`RepairMessage`]: the wire protocol (postcard-serialized, sent as
//!   length-prefixed frames, see [`frame`]).
//! - [`Transport`]: request/response delivery to a peer.
//! - [`MessageHandler`]: the receiving side, implemented by the repair service.
//! - [`LocalNetwork`]/[`LocalTransport`]: an in-process network that still
//!   encodes every message to a frame and back, with fault injection.

mod error;
pub mod frame;
mod local;
mod message;

pub use error::NetError;
pub use local::{LocalNetwork, LocalTransport};
pub use message::{RemoteErrorKind, RepairMessage, RowDigest, SessionHeader};

use reef_types::NodeId;

/// Trait abstracting request/response delivery to a remote node.
///
/// This allows substituting an in-process or mock transport in tests.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send `msg` to `to` and wait for its response.
    async fn request(&self, to: NodeId, msg: RepairMessage) -> Result<RepairMessage, NetError>;

    /// The node this transport sends from.
    fn local_node(&self) -> NodeId;
}

/// The receiving side of the protocol.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one request from `from` and produce the response.
    ///
    /// Failures are reported in-band as [`RepairMessage::Error`].
    async fn handle(&self, from: NodeId, msg: RepairMessage) -> RepairMessage;
}
