// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Operation kinds and the bias table that decides how often each kind is issued.

use std::{collections::BTreeMap, fmt};

use rand::{
    Rng,
    distributions::{Distribution, WeightedIndex},
};

use crate::error::ConfigError;

/// The CT log entrypoints the hammer exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Entrypoint {
    /// `add-chain`
    AddChain,
    /// `add-pre-chain`
    AddPreChain,
    /// `get-sth`
    GetSth,
    /// `get-sth-consistency`
    GetSthConsistency,
    /// `get-proof-by-hash`
    GetProofByHash,
    /// `get-entries`
    GetEntries,
    /// `get-roots`
    GetRoots,
    /// `get-entry-and-proof`
    GetEntryAndProof,
}

impl Entrypoint {
    /// All entrypoints, in a fixed order.
    pub const ALL: [Entrypoint; 8] = [
        Entrypoint::AddChain,
        Entrypoint::AddPreChain,
        Entrypoint::GetSth,
        Entrypoint::GetSthConsistency,
        Entrypoint::GetProofByHash,
        Entrypoint::GetEntries,
        Entrypoint::GetRoots,
        Entrypoint::GetEntryAndProof,
    ];

    /// The entrypoint name as used in the URL path.
    pub fn name(self) -> &'static str {
        match self {
            Entrypoint::AddChain => "add-chain",
            Entrypoint::AddPreChain => "add-pre-chain",
            Entrypoint::GetSth => "get-sth",
            Entrypoint::GetSthConsistency => "get-sth-consistency",
            Entrypoint::GetProofByHash => "get-proof-by-hash",
            Entrypoint::GetEntries => "get-entries",
            Entrypoint::GetRoots => "get-roots",
            Entrypoint::GetEntryAndProof => "get-entry-and-proof",
        }
    }

    /// Whether the hammer never builds a malformed request for this entrypoint.
    pub fn never_invalid(self) -> bool {
        matches!(
            self,
            Entrypoint::GetSth | Entrypoint::GetRoots | Entrypoint::GetEntryAndProof
        )
    }

    /// Whether this entrypoint submits a chain.
    pub fn is_chain_submission(self) -> bool {
        matches!(self, Entrypoint::AddChain | Entrypoint::AddPreChain)
    }
}

impl fmt::Display for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl AsRef<str> for Entrypoint {
    fn as_ref(&self) -> &str {
        self.name()
    }
}

/// Relative weights of the entrypoints.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct BiasWeights {
    pub add_chain: u32,
    pub add_pre_chain: u32,
    pub get_sth: u32,
    pub get_sth_consistency: u32,
    pub get_proof_by_hash: u32,
    pub get_entries: u32,
    pub get_roots: u32,
    pub get_entry_and_proof: u32,
}

impl Default for BiasWeights {
    fn default() -> Self {
        Self {
            add_chain: 20,
            add_pre_chain: 20,
            get_sth: 2,
            get_sth_consistency: 2,
            get_proof_by_hash: 2,
            get_entries: 2,
            get_roots: 1,
            get_entry_and_proof: 0,
        }
    }
}

impl BiasWeights {
    /// Returns the weight of an entrypoint.
    pub fn weight(&self, entrypoint: Entrypoint) -> u32 {
        *self.field(entrypoint)
    }

    /// Sets the weight of an entrypoint.
    pub fn set_weight(&mut self, entrypoint: Entrypoint, weight: u32) {
        *self.field_mut(entrypoint) = weight;
    }

    /// Returns the weights keyed by entrypoint.
    pub fn to_map(&self) -> BTreeMap<Entrypoint, u32> {
        Entrypoint::ALL
            .into_iter()
            .map(|entrypoint| (entrypoint, self.weight(entrypoint)))
            .collect()
    }

    fn field(&self, entrypoint: Entrypoint) -> &u32 {
        match entrypoint {
            Entrypoint::AddChain => &self.add_chain,
            Entrypoint::AddPreChain => &self.add_pre_chain,
            Entrypoint::GetSth => &self.get_sth,
            Entrypoint::GetSthConsistency => &self.get_sth_consistency,
            Entrypoint::GetProofByHash => &self.get_proof_by_hash,
            Entrypoint::GetEntries => &self.get_entries,
            Entrypoint::GetRoots => &self.get_roots,
            Entrypoint::GetEntryAndProof => &self.get_entry_and_proof,
        }
    }

    fn field_mut(&mut self, entrypoint: Entrypoint) -> &mut u32 {
        match entrypoint {
            Entrypoint::AddChain => &mut self.add_chain,
            Entrypoint::AddPreChain => &mut self.add_pre_chain,
            Entrypoint::GetSth => &mut self.get_sth,
            Entrypoint::GetSthConsistency => &mut self.get_sth_consistency,
            Entrypoint::GetProofByHash => &mut self.get_proof_by_hash,
            Entrypoint::GetEntries => &mut self.get_entries,
            Entrypoint::GetRoots => &mut self.get_roots,
            Entrypoint::GetEntryAndProof => &mut self.get_entry_and_proof,
        }
    }
}

/// The bias table shared read-only by all workers.
///
/// Holds, per entrypoint, the selection weight and the N of the 1-in-N chance of issuing a
/// deliberately invalid request (0 disables invalid requests). Every entrypoint has an entry in
/// both maps; entrypoints missing from the input are stored with 0.
#[derive(Debug, Clone)]
pub struct HammerBias {
    bias: BTreeMap<Entrypoint, u32>,
    invalid_chance: BTreeMap<Entrypoint, u32>,
    distribution: WeightedIndex<u64>,
}

impl HammerBias {
    /// Builds the bias table from the flag weights and the global invalid chance.
    ///
    /// Entrypoints that are never invalid get an invalid chance of 0 regardless of
    /// `invalid_chance`.
    pub fn new(weights: &BiasWeights, invalid_chance: u32) -> Result<Self, ConfigError> {
        let invalid_chance = Entrypoint::ALL
            .into_iter()
            .map(|entrypoint| {
                let chance = if entrypoint.never_invalid() {
                    0
                } else {
                    invalid_chance
                };
                (entrypoint, chance)
            })
            .collect();
        Self::from_maps(weights.to_map(), invalid_chance)
    }

    /// Builds the bias table from explicit maps. Absent entrypoints count as 0.
    pub fn from_maps(
        bias: BTreeMap<Entrypoint, u32>,
        invalid_chance: BTreeMap<Entrypoint, u32>,
    ) -> Result<Self, ConfigError> {
        let complete = |map: &BTreeMap<Entrypoint, u32>| -> BTreeMap<Entrypoint, u32> {
            Entrypoint::ALL
                .into_iter()
                .map(|entrypoint| (entrypoint, map.get(&entrypoint).copied().unwrap_or(0)))
                .collect()
        };
        let bias = complete(&bias);
        let invalid_chance = complete(&invalid_chance);

        let total: u64 = bias.values().map(|weight| u64::from(*weight)).sum();
        if total == 0 {
            return Err(ConfigError::EmptyBias);
        }
        // Cumulative weights of several u32::MAX entries exceed u32.
        let distribution = WeightedIndex::new(
            Entrypoint::ALL
                .iter()
                .map(|entrypoint| u64::from(bias[entrypoint])),
        )
        .map_err(|_| ConfigError::EmptyBias)?;

        Ok(Self {
            bias,
            invalid_chance,
            distribution,
        })
    }

    /// Returns the weight of an entrypoint.
    pub fn weight(&self, entrypoint: Entrypoint) -> u32 {
        self.bias[&entrypoint]
    }

    /// Returns the invalid chance of an entrypoint.
    pub fn invalid_chance(&self, entrypoint: Entrypoint) -> u32 {
        self.invalid_chance[&entrypoint]
    }

    /// Sum of all weights.
    pub fn total_weight(&self) -> u64 {
        self.bias.values().map(|weight| u64::from(*weight)).sum()
    }

    /// Expected share of rounds issuing `entrypoint`.
    pub fn ratio(&self, entrypoint: Entrypoint) -> f64 {
        f64::from(self.weight(entrypoint)) / self.total_weight() as f64
    }

    /// Draws an entrypoint according to the weights.
    pub fn choose<R: Rng>(&self, rng: &mut R) -> Entrypoint {
        Entrypoint::ALL[self.distribution.sample(rng)]
    }

    /// Decides whether a round of `entrypoint` should be deliberately invalid.
    pub fn invalid<R: Rng>(&self, entrypoint: Entrypoint, rng: &mut R) -> bool {
        match self.invalid_chance(entrypoint) {
            0 => false,
            chance => rng.gen_ratio(1, chance),
        }
    }
}
