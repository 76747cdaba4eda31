//! Cluster state: members, gossiped application state, token ring.
//!
//! [`ClusterState`] is the shared, read-mostly structure that the repair
//! service and the snitch use to find out who is in the cluster, where
//! they live and which tokens they own.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use reef_topology::{ApplicationState, EndpointStateLookup, Ring};
use reef_types::{Member, MemberState, NodeId};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use crate::error::ClusterError;

/// A change in the cluster as observed through gossip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// A node joined the cluster.
    Joined(NodeId),
    /// A node published a new application state value.
    Changed {
        /// The node whose state changed.
        node: NodeId,
        /// Which state key changed.
        state: ApplicationState,
        /// The new value.
        value: String,
    },
    /// A node became reachable again.
    Alive(NodeId),
    /// A node was declared unreachable.
    Dead(NodeId),
    /// A node was removed from the cluster for good.
    Removed(NodeId),
}

impl EndpointEvent {
    /// The node the event is about.
    pub fn node(&self) -> NodeId {
        match self {
            EndpointEvent::Joined(n)
            | EndpointEvent::Alive(n)
            | EndpointEvent::Dead(n)
            | EndpointEvent::Removed(n) => *n,
            EndpointEvent::Changed { node, .. } => *node,
        }
    }
}

type AppStates = HashMap<NodeId, HashMap<ApplicationState, String>>;

/// Shared cluster state fed by the membership service.
///
/// Holds the current set of members, their application state, the token
/// ring, and a broadcast channel through which other components can
/// subscribe to [`EndpointEvent`]s.
pub struct ClusterState {
    /// Current cluster members, keyed by node ID.
    members: RwLock<HashMap<NodeId, Member>>,
    /// Gossiped application state. Read synchronously by the snitch.
    app_states: StdRwLock<AppStates>,
    /// Token ring.
    ring: RwLock<Ring>,
    /// This node's identifier.
    local_node_id: NodeId,
    /// Broadcast channel for endpoint events.
    event_tx: broadcast::Sender<EndpointEvent>,
}

impl ClusterState {
    /// Create a new cluster state for the given local node.
    pub fn new(local_node_id: NodeId) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            members: RwLock::new(HashMap::new()),
            app_states: StdRwLock::new(HashMap::new()),
            ring: RwLock::new(Ring::new()),
            local_node_id,
            event_tx,
        })
    }

    /// Subscribe to endpoint events.
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.event_tx.subscribe()
    }

    /// Return this node's ID.
    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// Add or update a member and broadcast [`EndpointEvent::Joined`].
    pub async fn add_member(&self, member: Member) {
        let node_id = member.node_id;
        self.members.write().await.insert(node_id, member);
        info!(%node_id, "member joined cluster");
        let _ = self.event_tx.send(EndpointEvent::Joined(node_id));
    }

    /// Record an application state value published by `node`.
    pub async fn set_application_state(
        &self,
        node: NodeId,
        state: ApplicationState,
        value: &str,
    ) -> Result<(), ClusterError> {
        if !self.members.read().await.contains_key(&node) {
            return Err(ClusterError::NodeNotFound(node));
        }
        {
            let mut states = self.app_states.write().unwrap_or_else(|e| e.into_inner());
            states
                .entry(node)
                .or_default()
                .insert(state, value.to_string());
        }
        debug!(%node, ?state, value, "application state changed");
        let _ = self.event_tx.send(EndpointEvent::Changed {
            node,
            state,
            value: value.to_string(),
        });
        Ok(())
    }

    /// Mark a member as reachable and broadcast [`EndpointEvent::Alive`].
    pub async fn mark_alive(&self, node_id: &NodeId) -> Result<(), ClusterError> {
        self.set_state(node_id, MemberState::Alive).await?;
        info!(%node_id, "member is alive");
        let _ = self.event_tx.send(EndpointEvent::Alive(*node_id));
        Ok(())
    }

    /// Mark a member as dead and broadcast [`EndpointEvent::Dead`].
    ///
    /// The node keeps its tokens; only removal takes it off the ring.
    pub async fn mark_dead(&self, node_id: &NodeId) -> Result<(), ClusterError> {
        self.set_state(node_id, MemberState::Dead).await?;
        info!(%node_id, "member declared dead");
        let _ = self.event_tx.send(EndpointEvent::Dead(*node_id));
        Ok(())
    }

    /// Remove a member, its application state and its tokens, and broadcast
    /// [`EndpointEvent::Removed`].
    pub async fn remove_member(&self, node_id: &NodeId) {
        self.members.write().await.remove(node_id);
        self.app_states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node_id);
        self.ring.write().await.remove_node(node_id);

        info!(%node_id, "member removed from cluster");
        let _ = self.event_tx.send(EndpointEvent::Removed(*node_id));
    }

    async fn set_state(&self, node_id: &NodeId, state: MemberState) -> Result<(), ClusterError> {
        let mut members = self.members.write().await;
        let member = members
            .get_mut(node_id)
            .ok_or(ClusterError::NodeNotFound(*node_id))?;
        member.state = state;
        Ok(())
    }

    /// Return a snapshot of all current members.
    pub async fn members(&self) -> Vec<Member> {
        self.members.read().await.values().cloned().collect()
    }

    /// Return a specific member by node ID.
    pub async fn get_member(&self, node_id: &NodeId) -> Option<Member> {
        self.members.read().await.get(node_id).cloned()
    }

    /// Whether `node_id` is a member currently considered alive.
    pub async fn is_alive(&self, node_id: &NodeId) -> bool {
        self.members
            .read()
            .await
            .get(node_id)
            .is_some_and(|m| m.state == MemberState::Alive)
    }

    /// Return the number of members in the cluster.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Return the number of alive members in the cluster.
    pub async fn alive_count(&self) -> usize {
        self.members
            .read()
            .await
            .values()
            .filter(|m| m.state == MemberState::Alive)
            .count()
    }

    /// Return a clone of the current token ring.
    pub async fn ring(&self) -> Ring {
        self.ring.read().await.clone()
    }

    /// Replace the token ring.
    pub async fn set_ring(&self, ring: Ring) {
        *self.ring.write().await = ring;
    }

    /// The internal address gossiped by `node`, if any.
    pub fn internal_ip(&self, node: &NodeId) -> Option<String> {
        self.application_state(node, ApplicationState::InternalIp)
    }
}

impl EndpointStateLookup for ClusterState {
    fn application_state(&self, node: &NodeId, state: ApplicationState) -> Option<String> {
        let states = self.app_states.read().unwrap_or_else(|e| e.into_inner());
        states.get(node).and_then(|s| s.get(&state)).cloned()
    }
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field("local_node_id", &self.local_node_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> NodeId {
        NodeId::from([n; 32])
    }

    fn member(n: u8) -> Member {
        Member {
            node_id: node(n),
            state: MemberState::Alive,
            generation: 1,
        }
    }

    #[tokio::test]
    async fn test_join_then_dead_then_alive() {
        let state = ClusterState::new(node(1));
        let mut rx = state.subscribe();

        state.add_member(member(2)).await;
        assert_eq!(rx.recv().await.unwrap(), EndpointEvent::Joined(node(2)));
        assert!(state.is_alive(&node(2)).await);

        state.mark_dead(&node(2)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), EndpointEvent::Dead(node(2)));
        assert!(!state.is_alive(&node(2)).await);
        assert_eq!(state.alive_count().await, 0);

        state.mark_alive(&node(2)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), EndpointEvent::Alive(node(2)));
        assert_eq!(state.alive_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_node_errors() {
        let state = ClusterState::new(node(1));
        assert!(matches!(
            state.mark_dead(&node(7)).await,
            Err(ClusterError::NodeNotFound(n)) if n == node(7)
        ));
        assert!(
            state
                .set_application_state(node(7), ApplicationState::Dc, "dc1")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_application_state_lookup() {
        let state = ClusterState::new(node(1));
        state.add_member(member(2)).await;
        state
            .set_application_state(node(2), ApplicationState::Dc, "east")
            .await
            .unwrap();
        state
            .set_application_state(node(2), ApplicationState::InternalIp, "10.0.0.2")
            .await
            .unwrap();

        assert_eq!(
            state.application_state(&node(2), ApplicationState::Dc).as_deref(),
            Some("east")
        );
        assert_eq!(state.application_state(&node(2), ApplicationState::Rack), None);
        assert_eq!(state.internal_ip(&node(2)).as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_remove_member_clears_everything() {
        let state = ClusterState::new(node(1));
        state.add_member(member(2)).await;
        state
            .set_application_state(node(2), ApplicationState::Rack, "r1")
            .await
            .unwrap();
        let mut ring = Ring::new();
        ring.add_node(node(2), "dc1", "r1", 4);
        state.set_ring(ring).await;

        let mut rx = state.subscribe();
        state.remove_member(&node(2)).await;

        assert_eq!(rx.recv().await.unwrap(), EndpointEvent::Removed(node(2)));
        assert_eq!(state.member_count().await, 0);
        assert_eq!(state.application_state(&node(2), ApplicationState::Rack), None);
        assert!(!state.ring().await.contains(&node(2)));
    }

    #[test]
    fn test_event_node() {
        let ev = EndpointEvent::Changed {
            node: node(3),
            state: ApplicationState::Dc,
            value: "x".into(),
        };
        assert_eq!(ev.node(), node(3));
        assert_eq!(EndpointEvent::Removed(node(4)).node(), node(4));
    }
}
