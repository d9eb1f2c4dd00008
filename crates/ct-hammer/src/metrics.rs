// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Metrics reported by the hammer workers.

use std::{fmt, net::SocketAddr};

use anyhow::Context as _;
use axum::{Router, extract::State, http::StatusCode, routing::get};
use ct_hammer_utils::{metrics::Registry, with_label};
use prometheus::{IntCounterVec, IntGauge};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bias::Entrypoint;

/// Outcome of a single attempt of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationOutcome {
    /// The log answered as expected.
    Success,
    /// The request failed or the log answered unexpectedly.
    Failure,
}

impl OperationOutcome {
    fn as_str(self) -> &'static str {
        match self {
            OperationOutcome::Success => "success",
            OperationOutcome::Failure => "failure",
        }
    }
}

/// Sink for the events of hammer workers.
///
/// Implementations must be safe to call concurrently from all workers.
pub trait HammerMetricsSink: Send + Sync + fmt::Debug {
    /// Records the outcome of one attempt of a round.
    fn observe_operation(
        &self,
        prefix: &str,
        entrypoint: Entrypoint,
        invalid: bool,
        outcome: OperationOutcome,
    );

    /// Records that a failed round is retried.
    fn observe_retry(&self, prefix: &str, entrypoint: Entrypoint);

    /// Records that a worker started.
    fn observe_worker_started(&self, prefix: &str);

    /// Records that a worker reached the given terminal state.
    fn observe_worker_finished(&self, prefix: &str, state: &str);
}

ct_hammer_utils::define_metric_set! {
    #[namespace = "ct_hammer"]
    /// Prometheus metrics of the hammer.
    pub struct HammerMetrics {
        #[help = "The number of attempted requests by log, entrypoint, validity and outcome"]
        operations_total: IntCounterVec["log", "entrypoint", "invalid", "outcome"],
        #[help = "The number of retried rounds by log and entrypoint"]
        retries_total: IntCounterVec["log", "entrypoint"],
        #[help = "The number of finished campaigns by log and terminal state"]
        campaigns_total: IntCounterVec["log", "state"],
        #[help = "The number of workers currently running"]
        active_workers: IntGauge[],
    }
}

impl HammerMetricsSink for HammerMetrics {
    fn observe_operation(
        &self,
        prefix: &str,
        entrypoint: Entrypoint,
        invalid: bool,
        outcome: OperationOutcome,
    ) {
        let invalid = if invalid { "true" } else { "false" };
        with_label!(
            self.operations_total,
            prefix,
            entrypoint,
            invalid,
            outcome.as_str()
        )
        .inc();
    }

    fn observe_retry(&self, prefix: &str, entrypoint: Entrypoint) {
        with_label!(self.retries_total, prefix, entrypoint).inc();
    }

    fn observe_worker_started(&self, _prefix: &str) {
        self.active_workers.inc();
    }

    fn observe_worker_finished(&self, prefix: &str, state: &str) {
        self.active_workers.dec();
        with_label!(self.campaigns_total, prefix, state).inc();
    }
}

/// A sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl HammerMetricsSink for NoopMetrics {
    fn observe_operation(&self, _: &str, _: Entrypoint, _: bool, _: OperationOutcome) {}

    fn observe_retry(&self, _: &str, _: Entrypoint) {}

    fn observe_worker_started(&self, _: &str) {}

    fn observe_worker_finished(&self, _: &str, _: &str) {}
}

/// Serves `GET /metrics` from `registry` until `cancel` fires.
///
/// The listener is bound before returning, so an unusable address is reported to the caller.
/// Errors of the running server are only logged: the hammer does not depend on it.
pub async fn start_metrics_server(
    address: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind metrics endpoint {address}"))?;
    let app = Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(registry);

    tracing::info!(%address, "serving metrics");
    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;
        if let Err(error) = result {
            tracing::warn!(?error, "metrics server exited");
        }
    }))
}

async fn serve_metrics(State(registry): State<Registry>) -> Result<String, (StatusCode, String)> {
    registry
        .encode_text()
        .map_err(|error| (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_operations_by_label() {
        let registry = Registry::default();
        let metrics = HammerMetrics::new(&registry);

        metrics.observe_worker_started("athos");
        metrics.observe_operation(
            "athos",
            Entrypoint::GetSth,
            false,
            OperationOutcome::Success,
        );
        metrics.observe_operation(
            "athos",
            Entrypoint::AddChain,
            true,
            OperationOutcome::Failure,
        );
        metrics.observe_retry("athos", Entrypoint::AddChain);
        assert_eq!(metrics.active_workers.get(), 1);
        metrics.observe_worker_finished("athos", "completed");

        assert_eq!(metrics.active_workers.get(), 0);
        assert_eq!(
            with_label!(metrics.retries_total, "athos", "add-chain").get(),
            1
        );
        let text = registry.encode_text().unwrap();
        assert!(text.contains(
            "ct_hammer_operations_total{entrypoint=\"add-chain\",invalid=\"true\",\
             log=\"athos\",outcome=\"failure\"} 1"
        ));
        assert!(text.contains("ct_hammer_campaigns_total{log=\"athos\",state=\"completed\"} 1"));
    }

    #[test]
    fn metric_sets_on_one_registry_are_shared() {
        let registry = Registry::default();
        let first = HammerMetrics::new(&registry);
        let second = HammerMetrics::new(&registry);
        first.observe_retry("athos", Entrypoint::GetEntries);
        second.observe_retry("athos", Entrypoint::GetEntries);
        assert_eq!(
            with_label!(first.retries_total, "athos", "get-entries").get(),
            2
        );
    }

    #[tokio::test]
    async fn serves_metrics_text() {
        let registry = Registry::default();
        let metrics = HammerMetrics::new(&registry);
        metrics.observe_retry("porthos", Entrypoint::GetRoots);

        let body = serve_metrics(State(registry)).await.unwrap();
        assert!(body.contains("ct_hammer_retries_total"));
    }
}
