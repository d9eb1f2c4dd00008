// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Errors that abort the hammer before any worker starts.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A shard bound of a log could not be parsed as an RFC 3339 timestamp.
    #[error("log {prefix}: failed to parse {field} {value:?}: {source}")]
    InvalidTimestamp {
        /// Prefix of the offending log.
        prefix: String,
        /// Name of the offending field.
        field: &'static str,
        /// The raw value from the configuration.
        value: String,
        /// The parse error.
        source: chrono::ParseError,
    },

    /// The computed notAfter of a log cannot be represented.
    #[error("log {prefix}: notAfter is out of the representable range")]
    TimestampOutOfRange {
        /// Prefix of the offending log.
        prefix: String,
    },

    /// The leaf notAfter override could not be parsed.
    #[error("failed to parse leaf notAfter override {value:?}: {source}")]
    InvalidNotAfterOverride {
        /// The raw value from the command line.
        value: String,
        /// The parse error.
        source: chrono::ParseError,
    },

    /// All operation weights are zero.
    #[error("at least one operation bias must be greater than 0")]
    EmptyBias,

    /// The get-entries size bounds are unusable.
    #[error("get-entries bounds must satisfy 1 <= min ({min}) <= max ({max})")]
    InvalidGetEntriesRange {
        /// Configured minimum request size.
        min: u64,
        /// Configured maximum request size.
        max: u64,
    },

    /// The server list is empty.
    #[error("no CT HTTP servers configured")]
    NoServers,

    /// A file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file that was read.
        path: PathBuf,
        /// The I/O error.
        source: std::io::Error,
    },

    /// The log configuration could not be parsed.
    #[error("failed to parse log config {path}: {source}")]
    ParseLogConfig {
        /// The log configuration file.
        path: PathBuf,
        /// The parse error.
        source: serde_yaml::Error,
    },

    /// The log configuration does not list any log.
    #[error("log config {0} does not contain any logs")]
    NoLogs(PathBuf),

    /// A chain file does not hold usable certificates.
    #[error("chain file {path}: {reason}")]
    InvalidChain {
        /// The chain file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// The issuer key used to sign leaves cannot be loaded.
    #[error("signer key {path}: {reason}")]
    InvalidSigner {
        /// The key file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },
}
