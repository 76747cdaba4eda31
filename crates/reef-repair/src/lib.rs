//! Row-level anti-entropy repair for reef.
//!
//! A repair of one (table, token range) runs as a master session on the
//! initiating node and a follower session on each neighbor. The two sides
//! page through the range in key order, exchange row hashes (or full rows),
//! and stream only the rows that differ. Every buffered row holds memory
//! from its shard's [`MemoryPool`], so concurrent sessions stay inside
//! `max_repair_memory`.
//!
//! [`RepairService`] ties it together:
//!
//! - per-shard session registries ([`RegistryHandle`]),
//! - repair jobs started with [`RepairService::do_repair_start`],
//! - node operations (bootstrap, decommission, removenode, rebuild,
//!   replace) that move data through the same sessions,
//! - the follower side of the protocol, as a
//!   [`MessageHandler`](reef_net::MessageHandler),
//! - [`RepairHistory`] and [`NodeOpsMetrics`].

pub mod diff;
pub mod error;
mod follower;
pub mod history;
pub mod memory;
pub mod meta;
pub mod metrics;
mod node_ops;
pub mod options;
pub mod registry;
pub mod row;
pub mod service;
pub mod session;
pub mod throttle;
pub mod tracker;

pub use diff::{DiffPlan, plan_from_digests, plan_from_rows};
pub use error::RepairError;
pub use history::RepairHistory;
pub use memory::{MemoryPool, RowBuffer, RowPermit, RowWriter};
pub use meta::{RepairMeta, RepairMetaParams, RepairState, SessionStats};
pub use metrics::NodeOpsMetrics;
pub use options::RepairOptions;
pub use registry::RegistryHandle;
pub use row::{RepairRow, RowHasher};
pub use service::RepairService;
pub use session::{MasterSession, SessionOutcome};
pub use throttle::Throttle;
pub use tracker::Tracker;
