//! Endpoint snitches: datacenter and rack resolution.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use reef_types::NodeId;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::properties::{DC_KEY, RACK_KEY, SnitchProperties};

/// Datacenter reported when nothing is known about an endpoint.
pub const DEFAULT_DC: &str = "UNKNOWN_DC";
/// Rack reported when nothing is known about an endpoint.
pub const DEFAULT_RACK: &str = "UNKNOWN_RACK";

/// Application state keys published by every node through gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationState {
    /// Datacenter name.
    Dc,
    /// Rack name.
    Rack,
    /// Address to use from within the same datacenter.
    InternalIp,
}

/// Read access to gossiped application state.
pub trait EndpointStateLookup: Send + Sync {
    /// Current value of `state` for `node`, if gossip has one.
    fn application_state(&self, node: &NodeId, state: ApplicationState) -> Option<String>;
}

/// Resolves the datacenter and rack of any endpoint.
pub trait EndpointSnitch: Send + Sync {
    /// Snitch name for logs.
    fn name(&self) -> &'static str;

    /// Datacenter of `node`.
    fn get_datacenter(&self, node: &NodeId) -> String;

    /// Rack of `node`.
    fn get_rack(&self, node: &NodeId) -> String;

    /// Whether same-datacenter peers should be reached on their internal address.
    fn prefer_local(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// SimpleSnitch
// ---------------------------------------------------------------------------

/// Puts every endpoint in the same datacenter and rack.
#[derive(Debug, Clone, Default)]
pub struct SimpleSnitch;

impl EndpointSnitch for SimpleSnitch {
    fn name(&self) -> &'static str {
        "SimpleSnitch"
    }

    fn get_datacenter(&self, _node: &NodeId) -> String {
        "datacenter1".to_string()
    }

    fn get_rack(&self, _node: &NodeId) -> String {
        "rack1".to_string()
    }
}

// ---------------------------------------------------------------------------
// PropertyFileSnitch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct DcRack {
    dc: String,
    rack: String,
}

/// Snitch whose local location comes from a properties file.
///
/// Remote endpoints are resolved from gossip first, then from peer locations
/// saved by a previous run, then fall back to [`DEFAULT_DC`]/[`DEFAULT_RACK`].
pub struct PropertyFileSnitch {
    local_node: NodeId,
    local: DcRack,
    prefer_local: bool,
    gossip: Option<Arc<dyn EndpointStateLookup>>,
    saved: RwLock<HashMap<NodeId, DcRack>>,
}

impl PropertyFileSnitch {
    /// Build a snitch from already parsed properties.
    ///
    /// Both `dc` and `rack` are required. `dc_suffix`, when present, is
    /// appended to the datacenter name.
    pub fn from_properties(
        local_node: NodeId,
        props: &SnitchProperties,
    ) -> Result<Self, ConfigError> {
        let dc = props.dc().ok_or_else(|| incomplete(DC_KEY))?;
        let rack = props.rack().ok_or_else(|| incomplete(RACK_KEY))?;
        let dc = match props.dc_suffix() {
            Some(suffix) => format!("{dc}{suffix}"),
            None => dc.to_string(),
        };

        let mut snitch = Self {
            local_node,
            local: DcRack {
                dc: DEFAULT_DC.to_string(),
                rack: DEFAULT_RACK.to_string(),
            },
            prefer_local: props.prefer_local(),
            gossip: None,
            saved: RwLock::new(HashMap::new()),
        };
        snitch.set_local_dc_rack(&dc, rack);
        info!(
            snitch = snitch.name(),
            dc = %snitch.local.dc,
            rack = %snitch.local.rack,
            prefer_local = snitch.prefer_local,
            "snitch configured"
        );
        Ok(snitch)
    }

    /// Load the properties file at `path` and build a snitch from it.
    pub fn load(local_node: NodeId, path: &Path) -> Result<Self, ConfigError> {
        let props = SnitchProperties::load(path)?;
        Self::from_properties(local_node, &props)
    }

    /// Attach a gossip view used to resolve remote endpoints.
    pub fn with_gossip(mut self, gossip: Arc<dyn EndpointStateLookup>) -> Self {
        self.gossip = Some(gossip);
        self
    }

    /// Remember the location of a peer, as loaded from durable peer info.
    pub fn save_endpoint(&self, node: NodeId, dc: &str, rack: &str) {
        let mut saved = self.saved.write().unwrap_or_else(|e| e.into_inner());
        saved.insert(
            node,
            DcRack {
                dc: dc.to_string(),
                rack: rack.to_string(),
            },
        );
    }

    /// The local datacenter.
    pub fn local_dc(&self) -> &str {
        &self.local.dc
    }

    /// The local rack.
    pub fn local_rack(&self) -> &str {
        &self.local.rack
    }

    /// Set the local location. Empty values keep the defaults.
    fn set_local_dc_rack(&mut self, dc: &str, rack: &str) {
        if dc.is_empty() {
            warn!(
                snitch = self.name(),
                fallback = DEFAULT_DC,
                "snitch attempted to set DC to an empty string"
            );
        } else {
            self.local.dc = dc.to_string();
        }
        if rack.is_empty() {
            warn!(
                snitch = self.name(),
                fallback = DEFAULT_RACK,
                "snitch attempted to set rack to an empty string"
            );
        } else {
            self.local.rack = rack.to_string();
        }
    }

    fn endpoint_info(
        &self,
        node: &NodeId,
        state: ApplicationState,
        pick: fn(&DcRack) -> &str,
        default: &str,
    ) -> String {
        if *node == self.local_node {
            return pick(&self.local).to_string();
        }
        if let Some(gossip) = &self.gossip
            && let Some(value) = gossip.application_state(node, state)
        {
            return value;
        }
        let saved = self.saved.read().unwrap_or_else(|e| e.into_inner());
        match saved.get(node) {
            Some(info) => pick(info).to_string(),
            None => default.to_string(),
        }
    }
}

impl EndpointSnitch for PropertyFileSnitch {
    fn name(&self) -> &'static str {
        "PropertyFileSnitch"
    }

    fn get_datacenter(&self, node: &NodeId) -> String {
        self.endpoint_info(node, ApplicationState::Dc, |i| &i.dc, DEFAULT_DC)
    }

    fn get_rack(&self, node: &NodeId) -> String {
        self.endpoint_info(node, ApplicationState::Rack, |i| &i.rack, DEFAULT_RACK)
    }

    fn prefer_local(&self) -> bool {
        self.prefer_local
    }
}

fn incomplete(key: &'static str) -> ConfigError {
    tracing::error!(key, "properties file is incomplete");
    ConfigError::Incomplete { key }
}
