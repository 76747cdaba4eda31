//! Cluster membership view consumed by the repair engine.
//!
//! This crate provides:
//!
//! - [`ClusterState`]: current members, their gossiped application state
//!   and the token ring.
//! - [`EndpointEvent`]: join/change/alive/dead/remove notifications, fanned
//!   out over a broadcast channel.
//!
//! The gossip dissemination protocol itself lives outside reef; whatever
//! runs it feeds its observations into [`ClusterState`].

mod error;
mod state;

pub use error::ClusterError;
pub use state::{ClusterState, EndpointEvent};
