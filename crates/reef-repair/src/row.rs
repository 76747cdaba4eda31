//! Rows as seen by a repair session: entry plus session-seeded hash.

use reef_net::RowDigest;
use reef_types::{Mutation, RowEntry, RowKey};

/// Computes row hashes for one session.
///
/// Hashes mix in the session seed, so they are only comparable between
/// the two sides of the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowHasher {
    seed: u64,
}

impl RowHasher {
    /// Create a hasher for the given session seed.
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// `blake3(seed ‖ key ‖ mutation)` truncated to 64 bits.
    pub fn hash(&self, key: &RowKey, mutation: &Mutation) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seed.to_le_bytes());
        hasher.update(&key.token.0.to_le_bytes());
        hasher.update(&(key.key.len() as u64).to_le_bytes());
        hasher.update(&key.key);
        hasher.update(&mutation.timestamp.to_le_bytes());
        match &mutation.value {
            Some(value) => {
                hasher.update(&[1]);
                hasher.update(value);
            }
            None => {
                hasher.update(&[0]);
            }
        }
        let bytes: [u8; 8] = hasher.finalize().as_bytes()[..8]
            .try_into()
            .unwrap_or([0; 8]);
        u64::from_le_bytes(bytes)
    }

    /// Wrap a stored row with its hash.
    pub fn row(&self, entry: RowEntry) -> RepairRow {
        let hash = self.hash(&entry.key, &entry.mutation);
        RepairRow { entry, hash }
    }
}

/// A row buffered by a repair session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRow {
    /// Key and content.
    pub entry: RowEntry,
    /// Session-seeded content hash.
    pub hash: u64,
}

impl RepairRow {
    /// Primary key.
    pub fn key(&self) -> &RowKey {
        &self.entry.key
    }

    /// Size of the memory permit this row holds while buffered.
    pub fn estimated_size(&self) -> u64 {
        self.entry.estimated_size()
    }

    /// The digest sent to the master by the `HashOnly` variant.
    pub fn digest(&self) -> RowDigest {
        RowDigest {
            key: self.entry.key.clone(),
            hash: self.hash,
            timestamp: self.entry.mutation.timestamp,
        }
    }
}
