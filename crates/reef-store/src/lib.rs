//! Row storage trait and backend implementations.
//!
//! This crate defines the [`RowStore`] trait through which the repair
//! engine reads and writes table rows, along with one concrete backend:
//!
//! - [`MemoryRowStore`]: in-memory tables backed by a `RwLock<BTreeMap>`.
//!
//! The on-disk storage engine of a real node plugs in behind the same trait.

mod error;
mod memory_store;
mod traits;

pub use error::StoreError;
pub use memory_store::MemoryRowStore;
pub use traits::{ReadPage, RowStore, TableSchema};
