//! Token ring: ownership, replica sets and per-node ranges.

use std::collections::{BTreeMap, HashMap};

use reef_types::{NodeId, Token, TokenRange};
use tracing::debug;

/// Metadata about a node on the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Datacenter the node lives in.
    pub dc: String,
    /// Rack the node lives in.
    pub rack: String,
    /// Tokens the node owns, sorted.
    pub tokens: Vec<Token>,
}

/// Token ring for deterministic data placement.
///
/// Each node owns a set of tokens. The range `(previous token, token]`
/// belongs primarily to the token's node; its replicas are found by walking
/// clockwise from the token until enough distinct physical nodes are found.
/// The range that crosses the ring origin is split at [`Token::MIN`], so
/// every range handed out is non-wrapping.
#[derive(Debug, Clone, Default)]
pub struct Ring {
    /// Token positions: token -> owning node.
    tokens: BTreeMap<Token, NodeId>,
    /// Per-node metadata.
    nodes: HashMap<NodeId, NodeInfo>,
}

impl Ring {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with `vnodes` deterministic tokens derived from its id.
    pub fn add_node(&mut self, node_id: NodeId, dc: &str, rack: &str, vnodes: u16) {
        self.add_node_with_tokens(node_id, dc, rack, vnode_tokens(&node_id, vnodes));
    }

    /// Add a node owning exactly `tokens`.
    ///
    /// Tokens already owned by another node are taken over. A node that is
    /// already present is re-added with the new token set.
    pub fn add_node_with_tokens(&mut self, node_id: NodeId, dc: &str, rack: &str, tokens: Vec<Token>) {
        self.remove_node(&node_id);

        let mut tokens: Vec<Token> = tokens.into_iter().filter(|t| *t != Token::MIN).collect();
        tokens.sort();
        tokens.dedup();

        for token in &tokens {
            if let Some(prev) = self.tokens.insert(*token, node_id)
                && let Some(info) = self.nodes.get_mut(&prev)
            {
                info.tokens.retain(|t| t != token);
            }
        }

        debug!(%node_id, dc, rack, tokens = tokens.len(), "added node to ring");
        self.nodes.insert(
            node_id,
            NodeInfo {
                dc: dc.to_string(),
                rack: rack.to_string(),
                tokens,
            },
        );
    }

    /// Remove a node and all its tokens.
    pub fn remove_node(&mut self, node_id: &NodeId) -> Option<NodeInfo> {
        let info = self.nodes.remove(node_id)?;
        for token in &info.tokens {
            self.tokens.remove(token);
        }
        debug!(%node_id, "removed node from ring");
        Some(info)
    }

    /// Give every token of `old` to `new`, which takes `old`'s place.
    ///
    /// Returns `false` when `old` is not on the ring.
    pub fn replace_node(&mut self, old: &NodeId, new: NodeId, dc: &str, rack: &str) -> bool {
        let Some(info) = self.remove_node(old) else {
            return false;
        };
        self.add_node_with_tokens(new, dc, rack, info.tokens);
        true
    }

    /// Return the number of physical nodes in the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Return the total number of tokens in the ring.
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Whether `node_id` owns any token.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Return info about a specific node, if present.
    pub fn node_info(&self, node_id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.get(node_id)
    }

    /// Return all node IDs in the ring, sorted.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Datacenter of `node_id`, if the node is on the ring.
    pub fn datacenter(&self, node_id: &NodeId) -> Option<&str> {
        self.nodes.get(node_id).map(|i| i.dc.as_str())
    }

    /// All ranges of the ring in token order. Empty for an empty ring.
    pub fn ranges(&self) -> Vec<TokenRange> {
        let mut tokens = self.tokens.keys().copied();
        let Some(first) = tokens.next() else {
            return Vec::new();
        };

        let mut ranges = Vec::with_capacity(self.tokens.len() + 1);
        let mut prev = first;
        for token in tokens {
            ranges.push(TokenRange::new(prev, token));
            prev = token;
        }

        // The range ending at the first token wraps around the origin.
        let wrap = TokenRange::new(prev, first).split_wrapping();
        let mut out = Vec::with_capacity(ranges.len() + wrap.len());
        out.extend(wrap.iter().filter(|r| r.start == Token::MIN).copied());
        out.extend(ranges);
        out.extend(wrap.iter().filter(|r| r.start != Token::MIN).copied());
        out
    }

    /// Nodes replicating `token`, primary owner first.
    ///
    /// Walks clockwise from `token` (inclusive), collecting
    /// `replication_factor` distinct physical nodes. If fewer distinct nodes
    /// exist, returns all of them.
    pub fn owners(&self, token: Token, replication_factor: usize) -> Vec<NodeId> {
        if self.tokens.is_empty() {
            return Vec::new();
        }

        let max_distinct = replication_factor.min(self.nodes.len());
        let mut owners = Vec::with_capacity(max_distinct);

        let after = self.tokens.range(token..);
        let before = self.tokens.range(..token);

        for (_, node_id) in after.chain(before) {
            if !owners.contains(node_id) {
                owners.push(*node_id);
                if owners.len() == max_distinct {
                    break;
                }
            }
        }

        owners
    }

    /// Nodes replicating every token of a ring range.
    pub fn replicas(&self, range: &TokenRange, replication_factor: usize) -> Vec<NodeId> {
        self.owners(range.end, replication_factor)
    }

    /// Ranges `node_id` replicates.
    pub fn ranges_for(&self, node_id: &NodeId, replication_factor: usize) -> Vec<TokenRange> {
        self.ranges()
            .into_iter()
            .filter(|r| self.replicas(r, replication_factor).contains(node_id))
            .collect()
    }

    /// Ranges whose primary owner is `node_id`.
    pub fn primary_ranges(&self, node_id: &NodeId) -> Vec<TokenRange> {
        self.ranges_for(node_id, 1)
    }
}

/// Deterministic vnode tokens for a node: `blake3(node_id ++ index)`.
pub fn vnode_tokens(node_id: &NodeId, vnodes: u16) -> Vec<Token> {
    (0..vnodes)
        .map(|i| {
            let mut input = Vec::with_capacity(34);
            input.extend_from_slice(node_id.as_ref());
            input.extend_from_slice(&i.to_le_bytes());
            Token::of(&input)
        })
        .collect()
}
