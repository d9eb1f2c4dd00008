// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Runs one worker per log and folds their results into a single verdict.

use std::{any::Any, collections::HashMap, sync::Arc};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    bias::HammerBias,
    config::{HammerConfig, LogTarget},
    error::ConfigError,
    hammer::{CampaignOutcome, CampaignParameters, CampaignResult, LogHammer, LogOperator},
    metrics::HammerMetricsSink,
};

/// The seed of the worker at `index` in the log configuration.
pub fn worker_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_add(index as u64)
}

/// Builds the campaign parameters of every log, in configuration order.
///
/// Fails on the first log whose notAfter cannot be determined.
pub fn plan_campaigns(
    config: &HammerConfig,
    targets: Vec<LogTarget>,
    bias: Arc<HammerBias>,
    seed: u64,
    now: DateTime<Utc>,
) -> Result<Vec<CampaignParameters>, ConfigError> {
    targets
        .into_iter()
        .enumerate()
        .map(|(index, target)| {
            CampaignParameters::for_target(
                config,
                target,
                bias.clone(),
                worker_seed(seed, index),
                now,
            )
        })
        .collect()
}

/// A log campaign ready to be launched.
#[derive(Debug)]
pub struct LogCampaign {
    /// The parameters of the worker.
    pub params: CampaignParameters,
    /// The operator issuing the requests.
    pub operator: Arc<dyn LogOperator>,
}

/// Launches the workers of all logs and waits for every one of them.
#[derive(Debug, Clone)]
pub struct FleetOrchestrator {
    metrics: Arc<dyn HammerMetricsSink>,
    cancel: CancellationToken,
}

impl FleetOrchestrator {
    /// Creates an orchestrator whose workers stop when `cancel` fires.
    pub fn new(metrics: Arc<dyn HammerMetricsSink>, cancel: CancellationToken) -> Self {
        Self { metrics, cancel }
    }

    /// Runs all campaigns concurrently.
    ///
    /// Returns once every worker reported. A failing worker does not stop its siblings, and a
    /// panicking worker is reported as a failure of its own log.
    pub async fn run(&self, campaigns: Vec<LogCampaign>) -> FleetVerdict {
        let mut tasks = JoinSet::new();
        let mut slots = HashMap::new();
        let mut prefixes = Vec::with_capacity(campaigns.len());

        for (index, LogCampaign { params, operator }) in campaigns.into_iter().enumerate() {
            prefixes.push(params.target.prefix.clone());
            let hammer = LogHammer::new(params, operator, self.metrics.clone());
            let handle = tasks.spawn(hammer.run(self.cancel.child_token()));
            slots.insert(handle.id(), index);
        }
        tracing::info!(logs = prefixes.len(), "launched all workers");

        let mut results: Vec<Option<CampaignResult>> =
            std::iter::repeat_with(|| None).take(prefixes.len()).collect();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(error) => {
                    let id = error.id();
                    let Some(&index) = slots.get(&id) else {
                        tracing::error!(%id, "unknown worker task finished");
                        continue;
                    };
                    let prefix = prefixes[index].clone();
                    let outcome = if error.is_panic() {
                        let message = panic_message(error.into_panic());
                        tracing::error!(prefix, message, "worker panicked");
                        CampaignOutcome::Failed(anyhow!("worker panicked: {message}"))
                    } else {
                        CampaignOutcome::Cancelled
                    };
                    self.metrics.observe_worker_finished(&prefix, outcome.state());
                    let result = CampaignResult {
                        prefix,
                        operations: 0,
                        outcome,
                    };
                    (id, result)
                }
            };
            if let Some(&index) = slots.get(&id) {
                results[index] = Some(result);
            }
        }

        FleetVerdict {
            results: results.into_iter().flatten().collect(),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// The aggregated results of all workers, in configuration order.
#[derive(Debug)]
pub struct FleetVerdict {
    results: Vec<CampaignResult>,
}

impl FleetVerdict {
    /// Whether no worker failed.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(CampaignResult::is_success)
    }

    /// The results of all workers.
    pub fn results(&self) -> &[CampaignResult] {
        &self.results
    }

    /// Prefixes of the failed logs.
    pub fn failed_prefixes(&self) -> Vec<&str> {
        self.failures().map(|(prefix, _)| prefix).collect()
    }

    /// The failed logs with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &anyhow::Error)> {
        self.results
            .iter()
            .filter_map(|result| Some((result.prefix.as_str(), result.error()?)))
    }

    /// Logs one line per worker.
    pub fn log_summary(&self) {
        for result in &self.results {
            match result.error() {
                Some(error) => tracing::error!(
                    prefix = result.prefix,
                    operations = result.operations,
                    error = ?error,
                    "log failed"
                ),
                None => tracing::info!(
                    prefix = result.prefix,
                    operations = result.operations,
                    state = result.outcome.state(),
                    "log passed"
                ),
            }
        }
    }
}
