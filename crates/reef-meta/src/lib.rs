//! Durable node-local state wrapping Fjall.
//!
//! [`MetaStore`] provides typed accessors over two Fjall keyspaces:
//!
//! - `repair_history`: (table, range) → [`HistoryRecord`], the ranges a
//!   repair or node operation finished and when
//! - `peers`: [`NodeId`](reef_types::NodeId) → [`PeerInfo`], the last known
//!   datacenter, rack and preferred address of every peer
//!
//! Both survive restarts: history lets an interrupted node operation resume,
//! peer info lets the snitch place endpoints before gossip has caught up.

mod error;
mod store;

pub use error::MetaError;
pub use store::{HistoryRecord, MetaStore, PeerInfo};
