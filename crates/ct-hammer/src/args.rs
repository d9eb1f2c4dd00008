// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Command line arguments.

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::PathBuf,
    time::Duration,
};

use clap::{Args, Parser};

use crate::{
    bias::BiasWeights,
    config::{HammerConfig, parse_timestamp},
    error::ConfigError,
    op_generator::GetEntriesConfig,
    retry::ErrorPolicy,
};

/// Stress tests a fleet of Certificate Transparency logs.
#[derive(Parser, Debug, Clone)]
#[clap(rename_all = "kebab-case")]
#[command(author, version, about = "CT log hammer", long_about = None)]
pub struct HammerArgs {
    /// File with the logs to hammer, YAML or JSON.
    #[clap(long)]
    pub log_config: PathBuf,
    /// Comma-separated list of interchangeable servers hosting the logs.
    #[clap(long, default_value = "localhost:8092")]
    pub ct_http_servers: String,
    /// Directory holding leaf01.chain and int-ca.privkey.pem. An empty value disables
    /// add-chain and add-pre-chain.
    #[clap(long, default_value = "testdata")]
    pub testdata_dir: String,
    /// notAfter for submitted certificates, RFC 3339. Overrides the per-log shard window.
    #[clap(long)]
    pub leaf_not_after: Option<String>,
    /// Address on which to serve prometheus metrics.
    #[clap(long)]
    pub metrics_endpoint: Option<SocketAddr>,
    /// Seed for the random number generators; derived from the clock when absent.
    #[clap(long)]
    pub seed: Option<u64>,
    /// Default maximum merge delay of the logs.
    #[clap(long, default_value = "2m", value_parser = humantime::parse_duration)]
    pub mmd: Duration,
    /// Number of rounds to run against each log; unbounded when absent.
    #[clap(long)]
    pub operations: Option<NonZeroU64>,
    /// Minimum number of entries per get-entries request.
    #[clap(long, default_value = "1")]
    pub min_get_entries: u64,
    /// Maximum number of entries per get-entries request.
    #[clap(long, default_value = "500")]
    pub max_get_entries: u64,
    /// Allow get-entries requests reaching past the tree size.
    #[clap(long)]
    pub oversized_get_entries: bool,
    /// Maximum number of concurrent chain submissions in one round.
    #[clap(long, default_value = "2")]
    pub max_parallel_chains: NonZeroUsize,
    /// Requests per second per log; 0 disables rate limiting.
    #[clap(long, default_value = "0")]
    pub rate_limit: u32,
    /// Retry failing rounds instead of failing the log.
    #[clap(long)]
    pub ignore_errors: bool,
    /// How long a failing round is retried when errors are ignored.
    #[clap(long, default_value = "60s", value_parser = humantime::parse_duration)]
    pub max_retry: Duration,
    /// Timeout of a single HTTP request.
    #[clap(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,
    /// The N in "1 in N requests is deliberately invalid"; 0 disables invalid requests.
    #[clap(long, default_value = "10")]
    pub invalid_chance: u32,
    #[clap(flatten)]
    #[allow(missing_docs)]
    pub bias: BiasArgs,
}

/// Relative weights of the entrypoints.
#[derive(Args, Debug, Clone)]
#[clap(rename_all = "kebab-case")]
pub struct BiasArgs {
    /// Weight of add-chain.
    #[clap(long, default_value = "20")]
    pub add_chain: u32,
    /// Weight of add-pre-chain.
    #[clap(long, default_value = "20")]
    pub add_pre_chain: u32,
    /// Weight of get-sth.
    #[clap(long, default_value = "2")]
    pub get_sth: u32,
    /// Weight of get-sth-consistency.
    #[clap(long, default_value = "2")]
    pub get_sth_consistency: u32,
    /// Weight of get-proof-by-hash.
    #[clap(long, default_value = "2")]
    pub get_proof_by_hash: u32,
    /// Weight of get-entries.
    #[clap(long, default_value = "2")]
    pub get_entries: u32,
    /// Weight of get-roots.
    #[clap(long, default_value = "1")]
    pub get_roots: u32,
    /// Weight of get-entry-and-proof.
    #[clap(long, default_value = "0")]
    pub get_entry_and_proof: u32,
}

impl From<BiasArgs> for BiasWeights {
    fn from(args: BiasArgs) -> Self {
        BiasWeights {
            add_chain: args.add_chain,
            add_pre_chain: args.add_pre_chain,
            get_sth: args.get_sth,
            get_sth_consistency: args.get_sth_consistency,
            get_proof_by_hash: args.get_proof_by_hash,
            get_entries: args.get_entries,
            get_roots: args.get_roots,
            get_entry_and_proof: args.get_entry_and_proof,
        }
    }
}

impl HammerArgs {
    /// Validates the arguments and converts them into the run configuration.
    pub fn into_config(self) -> Result<HammerConfig, ConfigError> {
        let leaf_not_after = self
            .leaf_not_after
            .map(|value| {
                parse_timestamp(&value)
                    .map_err(|source| ConfigError::InvalidNotAfterOverride { value, source })
            })
            .transpose()?;
        let get_entries = GetEntriesConfig::new(
            self.min_get_entries,
            self.max_get_entries,
            self.oversized_get_entries,
        )?;
        let error_policy = if self.ignore_errors {
            ErrorPolicy::retry_for(self.max_retry)
        } else {
            ErrorPolicy::fail_fast()
        };

        Ok(HammerConfig {
            log_config: self.log_config,
            servers: self.ct_http_servers,
            testdata_dir: (!self.testdata_dir.is_empty())
                .then(|| PathBuf::from(self.testdata_dir)),
            leaf_not_after,
            metrics_endpoint: self.metrics_endpoint,
            seed: self.seed,
            mmd: self.mmd,
            operations: self.operations,
            get_entries,
            max_parallel_chains: self.max_parallel_chains,
            rate_limit: NonZeroU32::new(self.rate_limit),
            error_policy,
            request_timeout: self.request_timeout,
            bias: self.bias.into(),
            invalid_chance: self.invalid_chance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> HammerArgs {
        HammerArgs::try_parse_from(
            ["ct-hammer", "--log-config", "logs.yaml"]
                .iter()
                .chain(extra)
                .copied(),
        )
        .unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).into_config().unwrap();
        assert_eq!(config.servers, "localhost:8092");
        assert_eq!(config.testdata_dir, Some(PathBuf::from("testdata")));
        assert_eq!(config.mmd, Duration::from_secs(120));
        assert_eq!(config.operations, None);
        assert_eq!(config.get_entries, GetEntriesConfig::default());
        assert_eq!(config.max_parallel_chains.get(), 2);
        assert_eq!(config.rate_limit, None);
        assert_eq!(config.error_policy, ErrorPolicy::fail_fast());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.bias, BiasWeights::default());
        assert_eq!(config.invalid_chance, 10);
    }

    #[test]
    fn parses_overrides() {
        let config = parse(&[
            "--ignore-errors",
            "--max-retry",
            "5s",
            "--rate-limit",
            "50",
            "--operations",
            "1000",
            "--leaf-not-after",
            "2025-06-01T00:00:00Z",
            "--get-roots",
            "0",
            "--get-entry-and-proof",
            "3",
        ])
        .into_config()
        .unwrap();
        assert_eq!(
            config.error_policy,
            ErrorPolicy::retry_for(Duration::from_secs(5))
        );
        assert_eq!(config.rate_limit.map(NonZeroU32::get), Some(50));
        assert_eq!(config.operations.map(NonZeroU64::get), Some(1000));
        assert_eq!(
            config.leaf_not_after,
            Some(parse_timestamp("2025-06-01T00:00:00Z").unwrap())
        );
        assert_eq!(config.bias.get_roots, 0);
        assert_eq!(config.bias.get_entry_and_proof, 3);
    }

    #[test]
    fn empty_testdata_dir_disables_chain_material() {
        let config = parse(&["--testdata-dir", ""]).into_config().unwrap();
        assert_eq!(config.testdata_dir, None);
        let config = parse(&["--testdata-dir", "/srv/ct"]).into_config().unwrap();
        assert_eq!(config.testdata_dir, Some(PathBuf::from("/srv/ct")));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            parse(&["--leaf-not-after", "soon"]).into_config(),
            Err(ConfigError::InvalidNotAfterOverride { .. })
        ));
        assert!(matches!(
            parse(&["--min-get-entries", "10", "--max-get-entries", "5"]).into_config(),
            Err(ConfigError::InvalidGetEntriesRange { min: 10, max: 5 })
        ));
        assert!(
            HammerArgs::try_parse_from(["ct-hammer", "--log-config", "x", "--operations", "0"])
                .is_err()
        );
        assert!(HammerArgs::try_parse_from(["ct-hammer"]).is_err());
    }
}
