//! TOML configuration for the reef daemon.
//!
//! Every section and field is optional; missing values fall back to
//! [`RepairConfig::default`] and the defaults below.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use reef_meta::MetaStore;
use reef_topology::{EndpointSnitch, PropertyFileSnitch, SimpleSnitch};
use reef_types::{DiffAlgorithm, NodeId, RepairConfig};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node identity and data location.
    pub node: NodeSection,
    /// Repair service tuning.
    pub repair: RepairSection,
    /// Endpoint snitch selection.
    pub snitch: SnitchSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for persistent data (the meta store lives in `meta/`).
    pub data_dir: PathBuf,
    /// Name the node id is derived from. Defaults to the host name.
    pub name: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".reef"))
            .unwrap_or_else(|| PathBuf::from(".reef"));
        Self {
            data_dir,
            name: None,
        }
    }
}

/// `[repair]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RepairSection {
    /// Number of shards.
    pub shard_count: Option<u32>,
    /// Memory budget per shard (e.g. `"64MB"`).
    pub max_repair_memory: Option<String>,
    /// Per-session page budget (e.g. `"1MB"`).
    pub max_row_buf_size: Option<String>,
    /// `"hash_only"` or `"full_row"`.
    pub algorithm: Option<String>,
    /// Ranges repaired concurrently within a job.
    pub range_parallelism: Option<usize>,
    /// Bandwidth limit for streamed rows (e.g. `"100MB/s"`). `"0"` disables it.
    pub max_bandwidth: Option<String>,
    /// Replicas per token range.
    pub replication_factor: Option<usize>,
}

/// `[snitch]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SnitchSection {
    /// `"simple"` or `"property_file"`.
    pub kind: String,
    /// Properties file read by the property-file snitch.
    pub properties_file: Option<PathBuf>,
}

impl Default for SnitchSection {
    fn default() -> Self {
        Self {
            kind: "simple".to_string(),
            properties_file: None,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read {}", p.display()))?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Id of this node, derived from its configured name.
    pub fn node_id(&self) -> NodeId {
        let name = self.node.name.clone().unwrap_or_else(|| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "reef".to_string())
        });
        NodeId::from_data(name.as_bytes())
    }

    /// Directory of the durable meta store.
    pub fn meta_dir(&self) -> PathBuf {
        self.node.data_dir.join("meta")
    }

    /// Effective repair service configuration.
    pub fn repair_config(&self) -> anyhow::Result<RepairConfig> {
        let mut config = RepairConfig::default();
        let section = &self.repair;
        if let Some(n) = section.shard_count {
            if n == 0 {
                bail!("repair.shard_count must be at least 1");
            }
            config.shard_count = n;
        }
        if let Some(size) = &section.max_repair_memory {
            config.max_repair_memory = parse_size(size).context("repair.max_repair_memory")?;
        }
        if let Some(size) = &section.max_row_buf_size {
            config.max_row_buf_size = parse_size(size).context("repair.max_row_buf_size")?;
        }
        if let Some(name) = &section.algorithm {
            config.algorithm = DiffAlgorithm::parse(name)
                .with_context(|| format!("repair.algorithm: unknown algorithm '{name}'"))?;
        }
        if let Some(n) = section.range_parallelism {
            if n == 0 {
                bail!("repair.range_parallelism must be at least 1");
            }
            config.range_parallelism = n;
        }
        if let Some(rate) = &section.max_bandwidth {
            config.max_bandwidth = parse_size(rate).context("repair.max_bandwidth")?;
        }
        if let Some(rf) = section.replication_factor {
            if rf == 0 {
                bail!("repair.replication_factor must be at least 1");
            }
            config.replication_factor = rf;
        }
        if config.max_row_buf_size > config.max_repair_memory {
            bail!("repair.max_row_buf_size exceeds repair.max_repair_memory");
        }
        Ok(config)
    }
}

impl CliConfig {
    /// Build the configured snitch.
    ///
    /// The property-file snitch also learns every peer location saved in
    /// `meta`, so endpoints resolve before gossip has caught up.
    pub fn snitch(&self, meta: Option<&MetaStore>) -> anyhow::Result<Arc<dyn EndpointSnitch>> {
        match self.snitch.kind.as_str() {
            "simple" => Ok(Arc::new(SimpleSnitch)),
            "property_file" => {
                let path = self
                    .snitch
                    .properties_file
                    .as_deref()
                    .context("snitch.properties_file is required for the property_file snitch")?;
                let snitch = PropertyFileSnitch::load(self.node_id(), path)
                    .with_context(|| format!("invalid snitch properties in {}", path.display()))?;
                if let Some(meta) = meta {
                    for (node, info) in meta.list_peers()? {
                        if let (Some(dc), Some(rack)) = (&info.dc, &info.rack) {
                            snitch.save_endpoint(node, dc, rack);
                        }
                    }
                }
                Ok(Arc::new(snitch))
            }
            other => bail!("snitch.kind: unknown snitch '{other}'"),
        }
    }
}

/// Parse a human-readable size or rate into bytes.
///
/// Supports: `"32MB"`, `"1GB"`, `"512KB"`, `"100MB/s"`, `"1048576"`.
pub fn parse_size(s: &str) -> anyhow::Result<u64> {
    let s = s.trim().trim_end_matches("/s");
    let (num, unit) = if let Some(num) = s.strip_suffix("GB") {
        (num, 1_073_741_824)
    } else if let Some(num) = s.strip_suffix("MB") {
        (num, 1_048_576)
    } else if let Some(num) = s.strip_suffix("KB") {
        (num, 1_024)
    } else if let Some(num) = s.strip_suffix('B') {
        (num, 1)
    } else {
        (s, 1)
    };
    let value: u64 = num
        .trim()
        .parse()
        .with_context(|| format!("'{s}' is not a size"))?;
    value
        .checked_mul(unit)
        .with_context(|| format!("'{s}' is too large"))
}
