//! [`MetaStore`] implementation wrapping Fjall keyspaces.

use std::path::Path;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use reef_types::{NodeId, RepairUuid, TableId, Token, TokenRange};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// One finished (table, range) entry of the repair history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// The table.
    pub table_id: TableId,
    /// The finished range.
    pub range: TokenRange,
    /// The repair job or node operation that finished it.
    pub repair_id: RepairUuid,
    /// Completion time, unix millis.
    pub finished_at: u64,
}

/// What is remembered about a peer between restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Datacenter, once known.
    pub dc: Option<String>,
    /// Rack, once known.
    pub rack: Option<String>,
    /// Address to prefer when talking to the peer.
    pub preferred_ip: Option<String>,
}

/// Node-local durable store backed by Fjall.
pub struct MetaStore {
    /// The underlying Fjall database handle.
    #[allow(dead_code)]
    db: Database,
    /// table_id ++ range start ++ range end → serialized HistoryRecord.
    repair_history: Keyspace,
    /// NodeId → serialized PeerInfo.
    peers: Keyspace,
    /// Backing directory of a temporary store, removed on drop.
    _tmp: Option<tempfile::TempDir>,
}

impl MetaStore {
    /// Open a persistent MetaStore at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db, None)
    }

    /// Open a temporary MetaStore that is cleaned up on drop.
    ///
    /// Useful for tests and simulations.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db, Some(tmp))
    }

    fn init_keyspaces(db: Database, tmp: Option<tempfile::TempDir>) -> Result<Self> {
        let repair_history = db.keyspace("repair_history", KeyspaceCreateOptions::default)?;
        let peers = db.keyspace("peers", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            repair_history,
            peers,
            _tmp: tmp,
        })
    }

    // ----- Repair history -----

    /// Record that `record.range` of `record.table_id` finished.
    ///
    /// A later record for the same (table, range) replaces the earlier one.
    pub fn put_history(&self, record: &HistoryRecord) -> Result<()> {
        let key = history_key(&record.table_id, &record.range);
        let value = postcard::to_allocvec(record)?;
        self.repair_history.insert(key.as_slice(), value.as_slice())?;
        debug!(
            table_id = %record.table_id,
            range = %record.range,
            repair_id = %record.repair_id,
            "stored repair history record"
        );
        Ok(())
    }

    /// Look up the record of one (table, range).
    pub fn get_history(&self, table_id: &TableId, range: &TokenRange) -> Result<Option<HistoryRecord>> {
        match self.repair_history.get(history_key(table_id, range))? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All records of a table, in range order.
    pub fn list_history(&self, table_id: &TableId) -> Result<Vec<HistoryRecord>> {
        let mut records = Vec::new();
        for guard in self.repair_history.prefix(table_id.as_uuid().as_bytes()) {
            let v = guard.value()?;
            records.push(postcard::from_bytes(&v)?);
        }
        Ok(records)
    }

    /// Every record in the store.
    pub fn list_all_history(&self) -> Result<Vec<HistoryRecord>> {
        let mut records = Vec::new();
        for guard in self.repair_history.iter() {
            let v = guard.value()?;
            records.push(postcard::from_bytes(&v)?);
        }
        Ok(records)
    }

    /// Drop every record of a table.
    pub fn remove_table_history(&self, table_id: &TableId) -> Result<usize> {
        let mut keys = Vec::new();
        for guard in self.repair_history.prefix(table_id.as_uuid().as_bytes()) {
            keys.push(guard.key()?);
        }
        for key in &keys {
            self.repair_history.remove(key.as_ref())?;
        }
        debug!(%table_id, removed = keys.len(), "removed table repair history");
        Ok(keys.len())
    }

    // ----- Peers -----

    /// Remember where a peer lives.
    pub fn put_peer_location(&self, node_id: &NodeId, dc: &str, rack: &str) -> Result<()> {
        let mut info = self.get_peer(node_id)?.unwrap_or_default();
        info.dc = Some(dc.to_string());
        info.rack = Some(rack.to_string());
        self.put_peer(node_id, &info)
    }

    /// Remember the preferred address of a peer.
    pub fn put_preferred_ip(&self, node_id: &NodeId, ip: &str) -> Result<()> {
        let mut info = self.get_peer(node_id)?.unwrap_or_default();
        info.preferred_ip = Some(ip.to_string());
        self.put_peer(node_id, &info)
    }

    fn put_peer(&self, node_id: &NodeId, info: &PeerInfo) -> Result<()> {
        let value = postcard::to_allocvec(info)?;
        self.peers.insert(node_id.as_bytes(), value.as_slice())?;
        debug!(%node_id, "stored peer info");
        Ok(())
    }

    /// Retrieve what is known about a peer.
    pub fn get_peer(&self, node_id: &NodeId) -> Result<Option<PeerInfo>> {
        match self.peers.get(node_id.as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All known peers.
    pub fn list_peers(&self) -> Result<Vec<(NodeId, PeerInfo)>> {
        let mut peers = Vec::new();
        for guard in self.peers.iter() {
            let (k, v) = guard.into_inner()?;
            let arr = <[u8; 32]>::try_from(k.as_ref()).map_err(|_| MetaError::CorruptKey {
                keyspace: "peers",
                len: k.len(),
            })?;
            peers.push((NodeId::from(arr), postcard::from_bytes(&v)?));
        }
        Ok(peers)
    }

    /// Forget a peer.
    pub fn remove_peer(&self, node_id: &NodeId) -> Result<()> {
        self.peers.remove(node_id.as_bytes())?;
        debug!(%node_id, "removed peer info");
        Ok(())
    }
}

/// Build the history key: `table_id (16 bytes) ++ start (8) ++ end (8)`.
///
/// Tokens are stored big-endian with the sign bit flipped so that
/// lexicographic order matches token order.
fn history_key(table_id: &TableId, range: &TokenRange) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(table_id.as_uuid().as_bytes());
    key.extend_from_slice(&sortable(range.start));
    key.extend_from_slice(&sortable(range.end));
    key
}

fn sortable(token: Token) -> [u8; 8] {
    ((token.0 as u64) ^ (1 << 63)).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(table_id: TableId, start: i64, end: i64) -> HistoryRecord {
        HistoryRecord {
            table_id,
            range: TokenRange::new(Token(start), Token(end)),
            repair_id: RepairUuid::new_random(),
            finished_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_history_put_get_roundtrip() {
        let store = MetaStore::open_temporary().unwrap();
        let rec = record(TableId::new_random(), 0, 100);

        store.put_history(&rec).unwrap();
        assert_eq!(store.get_history(&rec.table_id, &rec.range).unwrap(), Some(rec));
    }

    #[test]
    fn test_history_get_nonexistent() {
        let store = MetaStore::open_temporary().unwrap();
        let result = store
            .get_history(&TableId::new_random(), &TokenRange::full())
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_history_list_in_token_order() {
        let store = MetaStore::open_temporary().unwrap();
        let table = TableId::new_random();

        store.put_history(&record(table, 100, 200)).unwrap();
        store.put_history(&record(table, -500, -100)).unwrap();
        store.put_history(&record(table, i64::MIN, -500)).unwrap();

        let starts: Vec<i64> = store
            .list_history(&table)
            .unwrap()
            .iter()
            .map(|r| r.range.start.0)
            .collect();
        assert_eq!(starts, vec![i64::MIN, -500, 100]);
    }

    #[test]
    fn test_history_no_cross_table_leakage() {
        let store = MetaStore::open_temporary().unwrap();
        let t1 = TableId::new_random();
        let t2 = TableId::new_random();

        store.put_history(&record(t1, 0, 10)).unwrap();
        store.put_history(&record(t2, 0, 10)).unwrap();
        store.put_history(&record(t2, 10, 20)).unwrap();

        assert_eq!(store.list_history(&t1).unwrap().len(), 1);
        assert_eq!(store.list_history(&t2).unwrap().len(), 2);
        assert_eq!(store.list_all_history().unwrap().len(), 3);

        assert_eq!(store.remove_table_history(&t2).unwrap(), 2);
        assert!(store.list_history(&t2).unwrap().is_empty());
        assert_eq!(store.list_history(&t1).unwrap().len(), 1);
    }

    #[test]
    fn test_history_overwrite() {
        let store = MetaStore::open_temporary().unwrap();
        let table = TableId::new_random();
        let first = record(table, 0, 10);
        let mut second = first.clone();
        second.repair_id = RepairUuid::new_random();
        second.finished_at += 5;

        store.put_history(&first).unwrap();
        store.put_history(&second).unwrap();

        assert_eq!(store.list_history(&table).unwrap(), vec![second]);
    }

    #[test]
    fn test_history_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record(TableId::new_random(), 5, 6);
        {
            let store = MetaStore::open(dir.path()).unwrap();
            store.put_history(&rec).unwrap();
        }
        let store = MetaStore::open(dir.path()).unwrap();
        assert_eq!(store.list_all_history().unwrap(), vec![rec]);
    }

    #[test]
    fn test_peer_location_and_ip() {
        let store = MetaStore::open_temporary().unwrap();
        let id = NodeId::from_data(b"node-1");

        store.put_peer_location(&id, "dc1", "r1").unwrap();
        store.put_preferred_ip(&id, "10.0.0.1").unwrap();

        let info = store.get_peer(&id).unwrap().unwrap();
        assert_eq!(info.dc.as_deref(), Some("dc1"));
        assert_eq!(info.rack.as_deref(), Some("r1"));
        assert_eq!(info.preferred_ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_peer_list_and_remove() {
        let store = MetaStore::open_temporary().unwrap();
        let a = NodeId::from_data(b"a");
        let b = NodeId::from_data(b"b");
        store.put_peer_location(&a, "dc1", "r1").unwrap();
        store.put_preferred_ip(&b, "10.0.0.2").unwrap();

        let mut ids: Vec<NodeId> = store.list_peers().unwrap().into_iter().map(|(id, _)| id).collect();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);

        store.remove_peer(&a).unwrap();
        assert!(store.get_peer(&a).unwrap().is_none());
    }
}
