//! Per-shard session registry.
//!
//! Each shard runs one actor task that owns the shard's sessions. All
//! access goes through its command channel; the actor answers on a oneshot.
//! Shard 0's actor also hands out session ids.

use std::collections::HashMap;
use std::sync::Arc;

use reef_types::{NodeId, RepairRole, TableId, TokenRange};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RepairError;
use crate::meta::RepairMeta;

const COMMAND_QUEUE_CAPACITY: usize = 256;

type SessionKey = (NodeId, u32);

enum RegistryCommand {
    Insert {
        meta: Arc<RepairMeta>,
        reply: oneshot::Sender<Result<(), RepairError>>,
    },
    Get {
        peer: NodeId,
        id: u32,
        role: RepairRole,
        reply: oneshot::Sender<Option<Arc<RepairMeta>>>,
    },
    Remove {
        peer: NodeId,
        id: u32,
        role: RepairRole,
        descriptor: Option<(TableId, TokenRange)>,
        reply: oneshot::Sender<bool>,
    },
    RemoveForPeer {
        peer: NodeId,
        reply: oneshot::Sender<usize>,
    },
    RemoveAll {
        reply: oneshot::Sender<usize>,
    },
    NextId {
        reply: oneshot::Sender<u32>,
    },
    List {
        reply: oneshot::Sender<Vec<Arc<RepairMeta>>>,
    },
}

/// Handle to one shard's registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    shard: u32,
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Spawn the registry actor of `shard`. It runs until `cancel` fires.
    pub fn spawn(shard: u32, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let registry = Registry {
            shard,
            followers: HashMap::new(),
            masters: HashMap::new(),
            next_id: 0,
        };
        tokio::spawn(registry.run(rx, cancel));
        Self { shard, tx }
    }

    /// The shard this registry serves.
    pub fn shard(&self) -> u32 {
        self.shard
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RepairError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RepairError::ShuttingDown)?;
        rx.await.map_err(|_| RepairError::ShuttingDown)
    }

    /// Register a session.
    pub async fn insert(&self, meta: Arc<RepairMeta>) -> Result<(), RepairError> {
        self.call(|reply| RegistryCommand::Insert { meta, reply }).await?
    }

    /// Look up a session by its identity and role.
    pub async fn get(
        &self,
        peer: NodeId,
        id: u32,
        role: RepairRole,
    ) -> Result<Option<Arc<RepairMeta>>, RepairError> {
        self.call(|reply| RegistryCommand::Get {
            peer,
            id,
            role,
            reply,
        })
        .await
    }

    /// Remove and cancel a session. With a descriptor, only a session
    /// covering that (table, range) is removed.
    pub async fn remove(
        &self,
        peer: NodeId,
        id: u32,
        role: RepairRole,
        descriptor: Option<(TableId, TokenRange)>,
    ) -> Result<bool, RepairError> {
        self.call(|reply| RegistryCommand::Remove {
            peer,
            id,
            role,
            descriptor,
            reply,
        })
        .await
    }

    /// Remove and cancel every session with `peer`.
    pub async fn remove_for_peer(&self, peer: NodeId) -> Result<usize, RepairError> {
        self.call(|reply| RegistryCommand::RemoveForPeer { peer, reply })
            .await
    }

    /// Remove and cancel every session.
    pub async fn remove_all(&self) -> Result<usize, RepairError> {
        self.call(|reply| RegistryCommand::RemoveAll { reply }).await
    }

    /// Allocate a session id. Only meaningful on shard 0.
    pub async fn next_id(&self) -> Result<u32, RepairError> {
        self.call(|reply| RegistryCommand::NextId { reply }).await
    }

    /// Every registered session.
    pub async fn list(&self) -> Result<Vec<Arc<RepairMeta>>, RepairError> {
        self.call(|reply| RegistryCommand::List { reply }).await
    }
}

impl std::fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("shard", &self.shard)
            .finish()
    }
}

struct Registry {
    shard: u32,
    /// Sessions opened by a peer's `RowLevelStart`, keyed by that peer's id.
    followers: HashMap<SessionKey, Arc<RepairMeta>>,
    /// Sessions this node drives, keyed by the id it allocated.
    masters: HashMap<SessionKey, Arc<RepairMeta>>,
    next_id: u32,
}

impl Registry {
    async fn run(mut self, mut rx: mpsc::Receiver<RegistryCommand>, cancel: CancellationToken) {
        debug!(shard = self.shard, "repair registry started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(shard = self.shard, "repair registry shutting down");
                    break;
                }
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }
        self.remove_all();
    }

    fn handle(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Insert { meta, reply } => {
                let _ = reply.send(self.insert(meta));
            }
            RegistryCommand::Get {
                peer,
                id,
                role,
                reply,
            } => {
                let _ = reply.send(self.map(role).get(&(peer, id)).cloned());
            }
            RegistryCommand::Remove {
                peer,
                id,
                role,
                descriptor,
                reply,
            } => {
                let _ = reply.send(self.remove(peer, id, role, descriptor));
            }
            RegistryCommand::RemoveForPeer { peer, reply } => {
                let removed = Self::drain(&mut self.followers, |k| k.0 == peer)
                    + Self::drain(&mut self.masters, |k| k.0 == peer);
                if removed > 0 {
                    info!(shard = self.shard, %peer, removed, "removed repair sessions of peer");
                }
                let _ = reply.send(removed);
            }
            RegistryCommand::RemoveAll { reply } => {
                let _ = reply.send(self.remove_all());
            }
            RegistryCommand::NextId { reply } => {
                self.next_id = self.next_id.wrapping_add(1).max(1);
                let _ = reply.send(self.next_id);
            }
            RegistryCommand::List { reply } => {
                let all = self
                    .followers
                    .values()
                    .chain(self.masters.values())
                    .cloned()
                    .collect();
                let _ = reply.send(all);
            }
        }
    }

    fn map(&self, role: RepairRole) -> &HashMap<SessionKey, Arc<RepairMeta>> {
        match role {
            RepairRole::Master => &self.masters,
            RepairRole::Follower => &self.followers,
        }
    }

    fn insert(&mut self, meta: Arc<RepairMeta>) -> Result<(), RepairError> {
        let key = (meta.peer(), meta.id());
        if self.map(meta.role()).contains_key(&key) {
            return Err(RepairError::DuplicateRepairMeta {
                peer: meta.peer(),
                id: meta.id(),
            });
        }
        let busy = self.followers.values().chain(self.masters.values()).any(|m| {
            m.peer() == meta.peer() && m.range() == meta.range() && m.table_id() == meta.table_id()
        });
        if busy {
            return Err(RepairError::RangeBusy {
                peer: meta.peer(),
                table_id: meta.table_id(),
                range: meta.range(),
            });
        }
        debug!(
            shard = self.shard,
            peer = %meta.peer().fmt_short(),
            id = meta.id(),
            role = ?meta.role(),
            range = %meta.range(),
            "registered repair session"
        );
        match meta.role() {
            RepairRole::Master => self.masters.insert(key, meta),
            RepairRole::Follower => self.followers.insert(key, meta),
        };
        Ok(())
    }

    fn remove(
        &mut self,
        peer: NodeId,
        id: u32,
        role: RepairRole,
        descriptor: Option<(TableId, TokenRange)>,
    ) -> bool {
        let map = match role {
            RepairRole::Master => &mut self.masters,
            RepairRole::Follower => &mut self.followers,
        };
        let matches = map.get(&(peer, id)).is_some_and(|m| {
            descriptor.is_none_or(|(table_id, range)| m.table_id() == table_id && m.range() == range)
        });
        if !matches {
            return false;
        }
        if let Some(meta) = map.remove(&(peer, id)) {
            meta.cancel_token().cancel();
            debug!(shard = self.shard, peer = %peer.fmt_short(), id, "removed repair session");
        }
        true
    }

    fn remove_all(&mut self) -> usize {
        Self::drain(&mut self.followers, |_| true) + Self::drain(&mut self.masters, |_| true)
    }

    fn drain(
        map: &mut HashMap<SessionKey, Arc<RepairMeta>>,
        pred: impl Fn(&SessionKey) -> bool,
    ) -> usize {
        let keys: Vec<SessionKey> = map.keys().filter(|k| pred(k)).copied().collect();
        for key in &keys {
            if let Some(meta) = map.remove(key) {
                meta.cancel_token().cancel();
            }
        }
        keys.len()
    }
}
