//! Error types for topology configuration.

use std::path::PathBuf;

/// Errors raised while loading snitch configuration. All of them are fatal
/// for the snitch that owns the file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A line is not exactly one `key=value` pair, has an empty value, or
    /// names an unknown key.
    #[error("bad format in properties file: {line:?}")]
    BadFormat {
        /// The offending line, trimmed.
        line: String,
    },

    /// A key appears twice.
    #[error("double \"{key}\" declaration in properties file")]
    DoubleDeclaration {
        /// The repeated key.
        key: String,
    },

    /// An obligatory key is missing.
    #[error("properties file is incomplete: missing \"{key}\"")]
    Incomplete {
        /// The missing key.
        key: &'static str,
    },

    /// The file could not be read.
    #[error("failed to read properties file {path}: {source}")]
    Io {
        /// Path of the properties file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
