//! Flat `key=value` snitch properties file.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::error;

use crate::error::ConfigError;

/// Datacenter of the local node.
pub const DC_KEY: &str = "dc";
/// Rack of the local node.
pub const RACK_KEY: &str = "rack";
/// Whether peers in the same datacenter should be reached on their internal address.
pub const PREFER_LOCAL_KEY: &str = "prefer_local";
/// Suffix appended to the datacenter name.
pub const DC_SUFFIX_KEY: &str = "dc_suffix";

/// Every key the properties file may contain.
pub const ALLOWED_KEYS: [&str; 4] = [DC_KEY, RACK_KEY, PREFER_LOCAL_KEY, DC_SUFFIX_KEY];

/// Parsed contents of a snitch properties file.
///
/// Keys are kept sorted so that [`SnitchProperties::serialize`] is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnitchProperties {
    values: BTreeMap<String, String>,
}

impl SnitchProperties {
    /// Parse the text of a properties file.
    ///
    /// Lines are trimmed; blank lines and lines starting with `#` are skipped.
    /// Every other line must be exactly one `key=value` pair with a known key
    /// and a non-empty value, and no key may appear twice. The first
    /// violation aborts the parse and nothing is returned.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut values = BTreeMap::new();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split('=').collect();
            if parts.len() != 2 {
                error!(line, "bad format in properties file");
                return Err(ConfigError::BadFormat {
                    line: line.to_string(),
                });
            }

            let key = parts[0].trim();
            let value = parts[1].trim();
            if value.is_empty() || !ALLOWED_KEYS.contains(&key) {
                error!(line, "bad format in properties file");
                return Err(ConfigError::BadFormat {
                    line: line.to_string(),
                });
            }

            if values.contains_key(key) {
                error!(key, "double declaration in properties file");
                return Err(ConfigError::DoubleDeclaration {
                    key: key.to_string(),
                });
            }

            values.insert(key.to_string(), value.to_string());
        }

        Ok(Self { values })
    }

    /// Read and parse a properties file from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Render the canonical file form, one `key=value` per line.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.values {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Set a value. Returns `BadFormat` for unknown keys or empty values.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        if value.is_empty() || !ALLOWED_KEYS.contains(&key) {
            return Err(ConfigError::BadFormat {
                line: format!("{key}={value}"),
            });
        }
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Look up a raw value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Iterate over all key/value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The `dc` value, if set.
    pub fn dc(&self) -> Option<&str> {
        self.get(DC_KEY)
    }

    /// The `rack` value, if set.
    pub fn rack(&self) -> Option<&str> {
        self.get(RACK_KEY)
    }

    /// The `dc_suffix` value, if set.
    pub fn dc_suffix(&self) -> Option<&str> {
        self.get(DC_SUFFIX_KEY)
    }

    /// `prefer_local`, interpreted as a boolean. Anything but `true` is false.
    pub fn prefer_local(&self) -> bool {
        self.get(PREFER_LOCAL_KEY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Number of keys present.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no key is present.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_keys() {
        let text = "\
# local topology
dc = dc1
rack=rack7

prefer_local=true
dc_suffix=_east
";
        let props = SnitchProperties::parse(text).unwrap();
        assert_eq!(props.dc(), Some("dc1"));
        assert_eq!(props.rack(), Some("rack7"));
        assert!(props.prefer_local());
        assert_eq!(props.dc_suffix(), Some("_east"));
        assert_eq!(props.len(), 4);
    }

    #[test]
    fn test_round_trip_every_key_subset() {
        // All 16 subsets of the allowed keys.
        for mask in 0u8..16 {
            let mut props = SnitchProperties::default();
            for (i, key) in ALLOWED_KEYS.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    props.set(key, &format!("value{i}")).unwrap();
                }
            }
            let parsed = SnitchProperties::parse(&props.serialize()).unwrap();
            assert_eq!(parsed, props, "mask {mask:#06b}");
        }
    }

    #[test]
    fn test_duplicate_key_fails() {
        let err = SnitchProperties::parse("dc=a\nrack=r\ndc=b\n").unwrap_err();
        assert!(matches!(err, ConfigError::DoubleDeclaration { key } if key == "dc"));
    }

    #[test]
    fn test_unknown_key_fails() {
        let err = SnitchProperties::parse("dc=a\nzone=z\n").unwrap_err();
        assert!(matches!(err, ConfigError::BadFormat { line } if line == "zone=z"));
    }

    #[test]
    fn test_missing_equals_fails() {
        let err = SnitchProperties::parse("dc=a\nrack\n").unwrap_err();
        assert!(matches!(err, ConfigError::BadFormat { .. }));
    }

    #[test]
    fn test_two_equals_fails() {
        let err = SnitchProperties::parse("dc=a=b\n").unwrap_err();
        assert!(matches!(err, ConfigError::BadFormat { .. }));
    }

    #[test]
    fn test_empty_value_fails() {
        let err = SnitchProperties::parse("dc=\n").unwrap_err();
        assert!(matches!(err, ConfigError::BadFormat { .. }));
        let err = SnitchProperties::parse("rack=   \n").unwrap_err();
        assert!(matches!(err, ConfigError::BadFormat { .. }));
    }

    #[test]
    fn test_comments_and_blank_lines_only() {
        let props = SnitchProperties::parse("\n   \n# dc=ignored\n").unwrap();
        assert!(props.is_empty());
    }

    #[test]
    fn test_prefer_local_defaults_false() {
        let props = SnitchProperties::parse("prefer_local=no\n").unwrap();
        assert!(!props.prefer_local());
        assert!(!SnitchProperties::default().prefer_local());
    }

    #[test]
    fn test_set_rejects_unknown_key() {
        let mut props = SnitchProperties::default();
        assert!(props.set("zone", "z").is_err());
        assert!(props.set(DC_KEY, "").is_err());
        assert!(props.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snitch.properties");
        std::fs::write(&path, "dc=dc2\nrack=r1\n").unwrap();
        let props = SnitchProperties::load(&path).unwrap();
        assert_eq!(props.dc(), Some("dc2"));

        let missing = SnitchProperties::load(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
