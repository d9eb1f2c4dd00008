// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! The per-log worker running a randomized campaign against one log.

use std::{
    collections::BTreeMap,
    fmt,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio_util::sync::CancellationToken;

use crate::{
    bias::{Entrypoint, HammerBias},
    config::{HammerConfig, LogTarget},
    error::ConfigError,
    limiter::RateLimiter,
    metrics::{HammerMetricsSink, OperationOutcome},
    not_after::resolve_not_after,
    op_generator::{GetEntriesConfig, LogOp, OperationGenerator, Round},
    retry::{ErrorPolicy, RoundError},
};

/// Number of rounds between two progress reports of a worker.
const PROGRESS_INTERVAL: u64 = 1000;

/// Executes single requests against one log.
///
/// Implementations hold the protocol logic: building the request, checking the response and
/// tracking whatever view of the log they need. When `invalid` is set the request must be
/// malformed and the log is expected to reject it.
#[async_trait]
pub trait LogOperator: Send + Sync + fmt::Debug {
    /// Issues `op` against the log.
    async fn execute(&self, op: &LogOp, invalid: bool) -> anyhow::Result<()>;
}

/// Everything a worker needs to know about its campaign.
#[derive(Debug, Clone)]
pub struct CampaignParameters {
    /// The log under test.
    pub target: LogTarget,
    /// The shared bias table.
    pub bias: Arc<HammerBias>,
    /// The merge delay assumed for the log.
    pub mmd: Duration,
    /// notAfter stamped on submitted certificates.
    pub not_after: DateTime<Utc>,
    /// Number of rounds to run, unbounded if absent.
    pub operations: Option<NonZeroU64>,
    /// Bounds of get-entries requests.
    pub get_entries: GetEntriesConfig,
    /// Cap on concurrent chain submissions.
    pub max_parallel_chains: NonZeroUsize,
    /// Requests per second, unlimited if absent.
    pub rate_limit: Option<NonZeroU32>,
    /// What to do with failing rounds.
    pub error_policy: ErrorPolicy,
    /// Seed of the worker's random number generator.
    pub seed: u64,
}

impl CampaignParameters {
    /// Assembles the parameters for `target` from the run configuration.
    pub fn for_target(
        config: &HammerConfig,
        target: LogTarget,
        bias: Arc<HammerBias>,
        seed: u64,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let not_after = resolve_not_after(config.leaf_not_after, &target, now)?;
        Ok(Self {
            mmd: target.merge_delay(config.mmd),
            target,
            bias,
            not_after,
            operations: config.operations,
            get_entries: config.get_entries,
            max_parallel_chains: config.max_parallel_chains,
            rate_limit: config.rate_limit,
            error_policy: config.error_policy,
            seed,
        })
    }

    /// Parameters with defaults for everything but the target and bias table.
    pub fn with_defaults(target: LogTarget, bias: Arc<HammerBias>, now: DateTime<Utc>) -> Self {
        Self {
            target,
            bias,
            mmd: Duration::from_secs(120),
            not_after: now + crate::not_after::DEFAULT_VALIDITY,
            operations: None,
            get_entries: GetEntriesConfig::default(),
            max_parallel_chains: NonZeroUsize::MIN.saturating_add(1),
            rate_limit: None,
            error_policy: ErrorPolicy::fail_fast(),
            seed: 0,
        }
    }
}

/// Terminal state of a worker.
#[derive(Debug)]
pub enum CampaignOutcome {
    /// The operation budget was exhausted.
    Completed,
    /// A round failed fatally.
    Failed(anyhow::Error),
    /// The worker was cancelled.
    Cancelled,
}

impl CampaignOutcome {
    /// Name of the terminal state.
    pub fn state(&self) -> &'static str {
        match self {
            CampaignOutcome::Completed => "completed",
            CampaignOutcome::Failed(_) => "failed",
            CampaignOutcome::Cancelled => "cancelled",
        }
    }
}

/// The result reported by a worker, exactly once.
#[derive(Debug)]
pub struct CampaignResult {
    /// Prefix of the log.
    pub prefix: String,
    /// Number of completed rounds.
    pub operations: u64,
    /// How the worker terminated.
    pub outcome: CampaignOutcome,
}

impl CampaignResult {
    /// The error of a failed campaign.
    pub fn error(&self) -> Option<&anyhow::Error> {
        match &self.outcome {
            CampaignOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Whether the campaign did not fail.
    pub fn is_success(&self) -> bool {
        self.error().is_none()
    }
}

#[derive(Debug, Default)]
struct CampaignStats {
    rounds: BTreeMap<Entrypoint, u64>,
    invalid_rounds: u64,
}

impl CampaignStats {
    fn record(&mut self, round: &Round) {
        *self.rounds.entry(round.entrypoint).or_default() += 1;
        if round.invalid {
            self.invalid_rounds += 1;
        }
    }

    fn summary(&self) -> String {
        self.rounds
            .iter()
            .map(|(entrypoint, count)| format!("{entrypoint}={count}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs the campaign of a single log.
#[derive(Debug)]
pub struct LogHammer {
    params: CampaignParameters,
    operator: Arc<dyn LogOperator>,
    metrics: Arc<dyn HammerMetricsSink>,
}

impl LogHammer {
    /// Creates a new worker.
    pub fn new(
        params: CampaignParameters,
        operator: Arc<dyn LogOperator>,
        metrics: Arc<dyn HammerMetricsSink>,
    ) -> Self {
        Self {
            params,
            operator,
            metrics,
        }
    }

    /// Prefix of the log under test.
    pub fn prefix(&self) -> &str {
        &self.params.target.prefix
    }

    /// Runs rounds until the budget is exhausted, a round fails fatally or `cancel` fires.
    #[tracing::instrument(name = "hammer", skip_all, fields(prefix = %self.params.target.prefix))]
    pub async fn run(self, cancel: CancellationToken) -> CampaignResult {
        let params = &self.params;
        tracing::info!(
            not_after = %params.not_after,
            mmd = ?params.mmd,
            operations = ?params.operations,
            rate_limit = ?params.rate_limit,
            "starting campaign"
        );
        self.metrics.observe_worker_started(self.prefix());

        let mut rng = StdRng::seed_from_u64(params.seed);
        let generator = OperationGenerator::new(
            params.bias.clone(),
            params.get_entries,
            params.max_parallel_chains,
        );
        let limiter = params.rate_limit.map(RateLimiter::new);
        let mut stats = CampaignStats::default();
        let mut completed = 0u64;

        let outcome = loop {
            if params
                .operations
                .is_some_and(|operations| completed >= operations.get())
            {
                break CampaignOutcome::Completed;
            }
            if cancel.is_cancelled() {
                break CampaignOutcome::Cancelled;
            }

            let round = generator.generate_round(&mut rng);
            let backoff_seed = rng.r#gen();
            match self
                .execute_round(&round, limiter.as_ref(), backoff_seed, &cancel)
                .await
            {
                Ok(()) => {
                    completed += 1;
                    stats.record(&round);
                    if completed % PROGRESS_INTERVAL == 0 {
                        tracing::info!(completed, rounds = %stats.summary(), "progress");
                    }
                }
                Err(RoundError::Cancelled) => break CampaignOutcome::Cancelled,
                Err(RoundError::Failed(error)) => {
                    break CampaignOutcome::Failed(error.context(format!(
                        "{} round {} failed",
                        round.entrypoint,
                        completed + 1
                    )));
                }
            }
        };

        match &outcome {
            CampaignOutcome::Failed(error) => {
                tracing::error!(completed, error = ?error, "campaign failed")
            }
            _ => tracing::info!(
                completed,
                invalid_rounds = stats.invalid_rounds,
                rounds = %stats.summary(),
                state = outcome.state(),
                "campaign finished"
            ),
        }
        self.metrics
            .observe_worker_finished(self.prefix(), outcome.state());

        CampaignResult {
            prefix: params.target.prefix.clone(),
            operations: completed,
            outcome,
        }
    }

    async fn execute_round(
        &self,
        round: &Round,
        limiter: Option<&RateLimiter>,
        backoff_seed: u64,
        cancel: &CancellationToken,
    ) -> Result<(), RoundError> {
        self.params
            .error_policy
            .run(
                backoff_seed,
                cancel,
                || self.attempt_round(round, limiter),
                |error, delay| {
                    tracing::warn!(
                        entrypoint = %round.entrypoint,
                        invalid = round.invalid,
                        ?delay,
                        error = ?error,
                        "round failed, retrying"
                    );
                    self.metrics
                        .observe_retry(self.prefix(), round.entrypoint);
                },
            )
            .await
    }

    /// Issues the requests of one round; chain submissions go out concurrently.
    async fn attempt_round(
        &self,
        round: &Round,
        limiter: Option<&RateLimiter>,
    ) -> anyhow::Result<()> {
        if let Some(limiter) = limiter {
            for _ in &round.ops {
                limiter.acquire().await;
            }
        }

        let results = join_all(
            round
                .ops
                .iter()
                .map(|op| self.operator.execute(op, round.invalid)),
        )
        .await;

        let outcome = if results.iter().all(Result::is_ok) {
            OperationOutcome::Success
        } else {
            OperationOutcome::Failure
        };
        self.metrics
            .observe_operation(self.prefix(), round.entrypoint, round.invalid, outcome);

        results.into_iter().collect::<anyhow::Result<Vec<()>>>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    };

    use super::*;
    use crate::{bias::BiasWeights, metrics::NoopMetrics};

    #[derive(Debug, Default)]
    struct RecordingOperator {
        calls: Mutex<Vec<(LogOp, bool)>>,
        fail_after: Option<u64>,
        executed: AtomicU64,
    }

    #[async_trait]
    impl LogOperator for RecordingOperator {
        async fn execute(&self, op: &LogOp, invalid: bool) -> anyhow::Result<()> {
            let executed = self.executed.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push((*op, invalid));
            if self.fail_after.is_some_and(|limit| executed >= limit) {
                anyhow::bail!("log rejected {}", op.entrypoint());
            }
            Ok(())
        }
    }

    fn params(operations: u64) -> CampaignParameters {
        let bias = Arc::new(HammerBias::new(&BiasWeights::default(), 10).unwrap());
        let mut params =
            CampaignParameters::with_defaults(LogTarget::new("athos"), bias, Utc::now());
        params.operations = NonZeroU64::new(operations);
        params.seed = 42;
        params
    }

    #[tokio::test]
    async fn completes_the_operation_budget() {
        let operator = Arc::new(RecordingOperator::default());
        let result = LogHammer::new(params(100), operator.clone(), Arc::new(NoopMetrics))
            .run(CancellationToken::new())
            .await;

        assert!(matches!(result.outcome, CampaignOutcome::Completed));
        assert_eq!(result.operations, 100);
        assert!(result.is_success());
        // Chain rounds may issue more than one request.
        assert!(operator.calls.lock().unwrap().len() >= 100);
    }

    #[tokio::test]
    async fn same_seed_issues_same_requests() {
        let run = || async {
            let operator = Arc::new(RecordingOperator::default());
            LogHammer::new(params(500), operator.clone(), Arc::new(NoopMetrics))
                .run(CancellationToken::new())
                .await;
            let calls = operator.calls.lock().unwrap().clone();
            calls
        };
        assert_eq!(run().await, run().await);
    }

    #[tokio::test]
    async fn first_failure_is_fatal_without_ignore_errors() {
        let operator = Arc::new(RecordingOperator {
            fail_after: Some(0),
            ..Default::default()
        });
        let mut params = params(100);
        params.max_parallel_chains = NonZeroUsize::new(1).unwrap();
        let result = LogHammer::new(params, operator.clone(), Arc::new(NoopMetrics))
            .run(CancellationToken::new())
            .await;

        assert_eq!(result.operations, 0);
        let error = result.error().expect("campaign must fail");
        assert!(format!("{error:#}").contains("round 1 failed"));
        assert_eq!(operator.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_reports_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = LogHammer::new(
            params(0),
            Arc::new(RecordingOperator::default()),
            Arc::new(NoopMetrics),
        )
        .run(cancel)
        .await;
        assert!(matches!(result.outcome, CampaignOutcome::Cancelled));
        assert!(result.is_success());
    }
}
