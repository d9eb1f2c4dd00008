// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Generates the randomized rounds issued by a worker.

use std::{num::NonZeroUsize, sync::Arc};

use rand::Rng;

use crate::{
    bias::{Entrypoint, HammerBias},
    error::ConfigError,
};

/// Bounds of the synthetic get-entries request sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetEntriesConfig {
    min: u64,
    max: u64,
    allow_oversized: bool,
}

impl GetEntriesConfig {
    /// Creates the configuration, requiring `1 <= min <= max`.
    pub fn new(min: u64, max: u64, allow_oversized: bool) -> Result<Self, ConfigError> {
        if min == 0 || min > max {
            return Err(ConfigError::InvalidGetEntriesRange { min, max });
        }
        Ok(Self {
            min,
            max,
            allow_oversized,
        })
    }

    /// Smallest request size.
    pub fn min(&self) -> u64 {
        self.min
    }

    /// Largest request size.
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Whether requests may reach past the current tree size.
    pub fn allow_oversized(&self) -> bool {
        self.allow_oversized
    }
}

impl Default for GetEntriesConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 500,
            allow_oversized: false,
        }
    }
}

/// A single request against a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    /// Submit a certificate chain.
    AddChain,
    /// Submit a precertificate chain.
    AddPreChain,
    /// Fetch the latest signed tree head.
    GetSth,
    /// Fetch a consistency proof between two tree sizes.
    GetSthConsistency,
    /// Fetch an inclusion proof for a known leaf hash.
    GetProofByHash,
    /// Fetch a range of entries.
    GetEntries {
        /// Number of entries to request.
        count: u64,
        /// Whether the range may extend past the tree size.
        allow_oversized: bool,
    },
    /// Fetch the accepted roots.
    GetRoots,
    /// Fetch an entry together with its inclusion proof.
    GetEntryAndProof,
}

impl LogOp {
    /// The entrypoint this operation calls.
    pub fn entrypoint(&self) -> Entrypoint {
        match self {
            LogOp::AddChain => Entrypoint::AddChain,
            LogOp::AddPreChain => Entrypoint::AddPreChain,
            LogOp::GetSth => Entrypoint::GetSth,
            LogOp::GetSthConsistency => Entrypoint::GetSthConsistency,
            LogOp::GetProofByHash => Entrypoint::GetProofByHash,
            LogOp::GetEntries { .. } => Entrypoint::GetEntries,
            LogOp::GetRoots => Entrypoint::GetRoots,
            LogOp::GetEntryAndProof => Entrypoint::GetEntryAndProof,
        }
    }
}

/// One drawn round: the entrypoint, whether it is deliberately invalid and the requests to
/// issue. Only chain submissions carry more than one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    /// The drawn entrypoint.
    pub entrypoint: Entrypoint,
    /// Whether the requests must be malformed.
    pub invalid: bool,
    /// The requests issued in this round.
    pub ops: Vec<LogOp>,
}

/// Draws rounds from the bias table.
#[derive(Debug, Clone)]
pub struct OperationGenerator {
    bias: Arc<HammerBias>,
    get_entries: GetEntriesConfig,
    max_parallel_chains: NonZeroUsize,
}

impl OperationGenerator {
    /// Creates a new generator.
    pub fn new(
        bias: Arc<HammerBias>,
        get_entries: GetEntriesConfig,
        max_parallel_chains: NonZeroUsize,
    ) -> Self {
        Self {
            bias,
            get_entries,
            max_parallel_chains,
        }
    }

    /// Draws the next round.
    pub fn generate_round<R: Rng>(&self, rng: &mut R) -> Round {
        let entrypoint = self.bias.choose(rng);
        let invalid = self.bias.invalid(entrypoint, rng);
        let ops = match entrypoint {
            Entrypoint::AddChain => self.generate_chain_ops(LogOp::AddChain, rng),
            Entrypoint::AddPreChain => self.generate_chain_ops(LogOp::AddPreChain, rng),
            Entrypoint::GetSth => vec![LogOp::GetSth],
            Entrypoint::GetSthConsistency => vec![LogOp::GetSthConsistency],
            Entrypoint::GetProofByHash => vec![LogOp::GetProofByHash],
            Entrypoint::GetEntries => vec![self.generate_get_entries_op(rng)],
            Entrypoint::GetRoots => vec![LogOp::GetRoots],
            Entrypoint::GetEntryAndProof => vec![LogOp::GetEntryAndProof],
        };
        Round {
            entrypoint,
            invalid,
            ops,
        }
    }

    fn generate_chain_ops<R: Rng>(&self, op: LogOp, rng: &mut R) -> Vec<LogOp> {
        let count = rng.gen_range(1..=self.max_parallel_chains.get());
        vec![op; count]
    }

    fn generate_get_entries_op<R: Rng>(&self, rng: &mut R) -> LogOp {
        LogOp::GetEntries {
            count: rng.gen_range(self.get_entries.min..=self.get_entries.max),
            allow_oversized: self.get_entries.allow_oversized,
        }
    }
}
