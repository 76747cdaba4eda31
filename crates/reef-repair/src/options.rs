//! Parsing of the string options accepted by `do_repair_start`.

use std::collections::HashMap;

use reef_types::{DiffAlgorithm, NodeId, Token, TokenRange};

use crate::error::RepairError;

/// Validated options of one repair job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairOptions {
    /// Explicit ranges to repair; wrapping ranges are already split.
    pub ranges: Option<Vec<TokenRange>>,
    /// Restrict to ranges the local node is primary owner of.
    pub primary_range: bool,
    /// Only repair with neighbors in these datacenters.
    pub data_centers: Vec<String>,
    /// Only repair with these neighbors.
    pub hosts: Vec<NodeId>,
    /// Only repair these tables.
    pub column_families: Vec<String>,
    /// Comparison strategy; the service default when unset.
    pub algorithm: Option<DiffAlgorithm>,
    /// Ranges in flight; the service default when unset.
    pub parallelism: Option<usize>,
    /// Ask neighbors to flush hints and batchlog first.
    pub flush_hints: bool,
}

impl RepairOptions {
    /// Validate an option map. Unknown keys and malformed values fail.
    pub fn parse(options: &HashMap<String, String>) -> Result<Self, RepairError> {
        let mut parsed = RepairOptions::default();
        for (key, value) in options {
            let value = value.trim();
            match key.as_str() {
                "ranges" => parsed.ranges = Some(parse_ranges(value)?),
                "primaryRange" => parsed.primary_range = parse_bool(key, value)?,
                "dataCenters" => {
                    parsed.data_centers = list(value).map(str::to_string).collect();
                }
                "hosts" => {
                    parsed.hosts = list(value)
                        .map(|h| {
                            h.parse::<NodeId>()
                                .map_err(|e| invalid(format!("hosts: {e}")))
                        })
                        .collect::<Result<_, _>>()?;
                }
                "columnFamilies" => {
                    parsed.column_families = list(value).map(str::to_string).collect();
                }
                "algorithm" => {
                    parsed.algorithm = Some(
                        DiffAlgorithm::parse(value)
                            .ok_or_else(|| invalid(format!("unknown algorithm '{value}'")))?,
                    );
                }
                "parallelism" => {
                    let n: usize = value
                        .parse()
                        .map_err(|_| invalid(format!("parallelism: '{value}' is not a number")))?;
                    if n == 0 {
                        return Err(invalid("parallelism must be at least 1".into()));
                    }
                    parsed.parallelism = Some(n);
                }
                "flush_hints" => parsed.flush_hints = parse_bool(key, value)?,
                other => return Err(invalid(format!("unknown option '{other}'"))),
            }
        }
        if parsed.primary_range && parsed.ranges.is_some() {
            return Err(invalid("primaryRange cannot be combined with ranges".into()));
        }
        Ok(parsed)
    }
}

fn invalid(msg: String) -> RepairError {
    RepairError::InvalidOptions(msg)
}

fn list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, RepairError> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(invalid(format!("{key}: '{value}' is not a boolean")))
    }
}

fn parse_ranges(value: &str) -> Result<Vec<TokenRange>, RepairError> {
    let mut ranges = Vec::new();
    for item in list(value) {
        let (start, end) = item
            .split_once(':')
            .ok_or_else(|| invalid(format!("range '{item}' is not start:end")))?;
        let start: i64 = start
            .trim()
            .parse()
            .map_err(|_| invalid(format!("range '{item}': bad start token")))?;
        let end: i64 = end
            .trim()
            .parse()
            .map_err(|_| invalid(format!("range '{item}': bad end token")))?;
        ranges.extend(TokenRange::new(Token(start), Token(end)).split_wrapping());
    }
    Ok(ranges)
}
