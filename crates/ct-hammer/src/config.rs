// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Log targets and the immutable run configuration.

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    bias::BiasWeights,
    error::ConfigError,
    op_generator::GetEntriesConfig,
    retry::ErrorPolicy,
};

/// One CT log under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTarget {
    /// The URL path prefix identifying the log.
    pub prefix: String,
    /// The log's public key, base64-encoded DER.
    #[serde(default)]
    pub public_key: String,
    /// The merge delay the log aims for; overrides the default MMD when set and non-zero.
    #[serde(default)]
    pub expected_merge_delay_sec: Option<u64>,
    /// Inclusive start of the notAfter range accepted by the log, RFC 3339.
    #[serde(default)]
    pub not_after_start: Option<String>,
    /// Exclusive limit of the notAfter range accepted by the log, RFC 3339.
    #[serde(default)]
    pub not_after_limit: Option<String>,
}

/// The parsed temporal shard bounds of a log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardBounds {
    /// Parsed [`LogTarget::not_after_start`].
    pub start: Option<DateTime<Utc>>,
    /// Parsed [`LogTarget::not_after_limit`].
    pub limit: Option<DateTime<Utc>>,
}

impl LogTarget {
    /// Creates a target without shard bounds or merge delay.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            public_key: String::new(),
            expected_merge_delay_sec: None,
            not_after_start: None,
            not_after_limit: None,
        }
    }

    /// Parses the shard bounds of the log.
    pub fn shard_bounds(&self) -> Result<ShardBounds, ConfigError> {
        Ok(ShardBounds {
            start: self.parse_bound("not_after_start", self.not_after_start.as_deref())?,
            limit: self.parse_bound("not_after_limit", self.not_after_limit.as_deref())?,
        })
    }

    /// Returns the merge delay to assume for this log.
    pub fn merge_delay(&self, default_mmd: Duration) -> Duration {
        match self.expected_merge_delay_sec {
            Some(seconds) if seconds > 0 => Duration::from_secs(seconds),
            _ => default_mmd,
        }
    }

    fn parse_bound(
        &self,
        field: &'static str,
        value: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>, ConfigError> {
        value
            .map(|value| {
                parse_timestamp(value).map_err(|source| ConfigError::InvalidTimestamp {
                    prefix: self.prefix.clone(),
                    field,
                    value: value.to_owned(),
                    source,
                })
            })
            .transpose()
    }
}

/// Parses an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value.trim()).map(|time| time.with_timezone(&Utc))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LogConfigFile {
    Wrapped { logs: Vec<LogTarget> },
    List(Vec<LogTarget>),
}

/// Loads the log targets from a YAML or JSON file.
pub fn load_log_targets(path: impl AsRef<Path>) -> Result<Vec<LogTarget>, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    let targets = parse_log_targets(&contents).map_err(|source| ConfigError::ParseLogConfig {
        path: path.to_owned(),
        source,
    })?;
    if targets.is_empty() {
        return Err(ConfigError::NoLogs(path.to_owned()));
    }
    tracing::debug!(?path, n_logs = targets.len(), "loaded log config");
    Ok(targets)
}

fn parse_log_targets(contents: &str) -> Result<Vec<LogTarget>, serde_yaml::Error> {
    Ok(match serde_yaml::from_str::<LogConfigFile>(contents)? {
        LogConfigFile::Wrapped { logs } | LogConfigFile::List(logs) => logs,
    })
}

/// The immutable configuration of a hammer run, built once at startup.
#[derive(Debug, Clone)]
pub struct HammerConfig {
    /// File holding the log targets.
    pub log_config: PathBuf,
    /// Comma-separated list of interchangeable servers.
    pub servers: String,
    /// Directory with chain material for add-[pre-]chain.
    pub testdata_dir: Option<PathBuf>,
    /// notAfter used for every log instead of the computed one.
    pub leaf_not_after: Option<DateTime<Utc>>,
    /// Address on which to serve metrics.
    pub metrics_endpoint: Option<SocketAddr>,
    /// Seed for the random number generators.
    pub seed: Option<u64>,
    /// Default merge delay for logs.
    pub mmd: Duration,
    /// Number of rounds per log, unbounded if absent.
    pub operations: Option<NonZeroU64>,
    /// Bounds of get-entries requests.
    pub get_entries: GetEntriesConfig,
    /// Cap on concurrent chain submissions per log.
    pub max_parallel_chains: NonZeroUsize,
    /// Requests per second per log, unlimited if absent.
    pub rate_limit: Option<NonZeroU32>,
    /// What a worker does when a round fails.
    pub error_policy: ErrorPolicy,
    /// Timeout of a single HTTP request.
    pub request_timeout: Duration,
    /// Operation weights.
    pub bias: BiasWeights,
    /// The N in 1-in-N invalid requests, 0 for never.
    pub invalid_chance: u32,
}
