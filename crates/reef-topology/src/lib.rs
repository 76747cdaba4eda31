//! Topology collaborators for reef.
//!
//! - [`SnitchProperties`]: the flat `key=value` properties file describing
//!   the local node's datacenter and rack.
//! - [`EndpointSnitch`]: resolves datacenter/rack for any endpoint, with a
//!   [`PropertyFileSnitch`] and a trivial [`SimpleSnitch`].
//! - [`Ring`]: token ownership, replica sets and the ranges each node holds.
//!
//! The snitch is always passed explicitly to the components that need it;
//! there is no process-wide "current snitch".

mod error;
mod properties;
mod ring;
mod snitch;

pub use error::ConfigError;
pub use properties::{
    ALLOWED_KEYS, DC_KEY, DC_SUFFIX_KEY, PREFER_LOCAL_KEY, RACK_KEY, SnitchProperties,
};
pub use ring::{NodeInfo, Ring, vnode_tokens};
pub use snitch::{
    ApplicationState, DEFAULT_DC, DEFAULT_RACK, EndpointSnitch, EndpointStateLookup,
    PropertyFileSnitch, SimpleSnitch,
};
