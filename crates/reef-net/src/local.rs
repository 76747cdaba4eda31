//! In-process network used by tests and the daemon's simulation mode.
//!
//! Every request and response still goes through [`frame::encode`] and
//! [`frame::decode`], so the wire format is exercised end to end.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use reef_types::NodeId;
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::NetError;
use crate::frame;
use crate::message::RepairMessage;
use crate::{MessageHandler, Transport};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A set of nodes that can reach each other in-process.
pub struct LocalNetwork {
    handlers: RwLock<HashMap<NodeId, Weak<dyn MessageHandler>>>,
    down_nodes: RwLock<HashSet<NodeId>>,
    failing_verbs: RwLock<HashSet<&'static str>>,
    sent: Mutex<HashMap<&'static str, u64>>,
    request_timeout: Duration,
}

impl LocalNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create an empty network whose requests time out after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            down_nodes: RwLock::new(HashSet::new()),
            failing_verbs: RwLock::new(HashSet::new()),
            sent: Mutex::new(HashMap::new()),
            request_timeout: timeout,
        })
    }

    /// Attach the handler that receives requests addressed to `node`.
    pub async fn register(&self, node: NodeId, handler: Weak<dyn MessageHandler>) {
        self.handlers.write().await.insert(node, handler);
    }

    /// A transport sending from `node`.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> LocalTransport {
        LocalTransport {
            local: node,
            network: self.clone(),
        }
    }

    /// Make `node` unreachable (or reachable again).
    pub async fn set_down(&self, node: NodeId, down: bool) {
        let mut nodes = self.down_nodes.write().await;
        if down {
            nodes.insert(node);
        } else {
            nodes.remove(&node);
        }
    }

    /// Make every request with the given verb fail (or succeed again).
    pub async fn set_failing(&self, verb: &'static str, failing: bool) {
        let mut verbs = self.failing_verbs.write().await;
        if failing {
            verbs.insert(verb);
        } else {
            verbs.remove(verb);
        }
    }

    /// How many requests with `verb` were delivered.
    pub fn sent(&self, verb: &str) -> u64 {
        let sent = self.sent.lock().expect("lock poisoned");
        sent.get(verb).copied().unwrap_or(0)
    }

    /// Reset all delivery counters.
    pub fn reset_counters(&self) {
        self.sent.lock().expect("lock poisoned").clear();
    }

    async fn deliver(
        &self,
        from: NodeId,
        to: NodeId,
        msg: RepairMessage,
    ) -> Result<RepairMessage, NetError> {
        {
            let down = self.down_nodes.read().await;
            if down.contains(&to) || down.contains(&from) {
                return Err(NetError::Unreachable(to));
            }
        }
        if self.failing_verbs.read().await.contains(msg.verb()) {
            return Err(NetError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                format!("{} dropped", msg.verb()),
            )));
        }
        let handler = self
            .handlers
            .read()
            .await
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or(NetError::Unreachable(to))?;

        let verb = msg.verb();
        let request = frame::decode(&frame::encode(&msg)?)?;
        *self
            .sent
            .lock()
            .expect("lock poisoned")
            .entry(verb)
            .or_default() += 1;
        trace!(from = %from.fmt_short(), to = %to.fmt_short(), verb, "delivering request");

        let response = tokio::time::timeout(self.request_timeout, handler.handle(from, request))
            .await
            .map_err(|_| NetError::Timeout(to))?;
        frame::decode(&frame::encode(&response)?)
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Sending side of a [`LocalNetwork`] for one node.
#[derive(Clone)]
pub struct LocalTransport {
    local: NodeId,
    network: Arc<LocalNetwork>,
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn request(&self, to: NodeId, msg: RepairMessage) -> Result<RepairMessage, NetError> {
        self.network.deliver(self.local, to, msg).await
    }

    fn local_node(&self) -> NodeId {
        self.local
    }
}
