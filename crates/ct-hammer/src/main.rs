// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Hammers a fleet of Certificate Transparency logs with randomized requests.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::Utc;
use clap::Parser;
use ct_hammer::{
    args::HammerArgs,
    bias::{Entrypoint, HammerBias},
    chain::{ChainGenerator, ChainMaterial, SyntheticChainGenerator, restrict_to_chain_material},
    client::{HttpLogOperator, ServerPool, build_http_client},
    config::load_log_targets,
    fleet::{FleetOrchestrator, LogCampaign, plan_campaigns},
    hammer::LogOperator,
    metrics::{HammerMetrics, HammerMetricsSink, NoopMetrics, start_metrics_server},
};
use ct_hammer_utils::metrics::Registry;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = HammerArgs::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let config = args.into_config()?;

    let seed = config.seed.unwrap_or_else(clock_seed);
    tracing::info!(
        "Today's test has been brought to you by the letters C and T and the number {seed:#x}"
    );

    let targets = load_log_targets(&config.log_config)?;
    let material = config
        .testdata_dir
        .as_deref()
        .map(ChainMaterial::load)
        .transpose()?;
    let mut weights = config.bias.clone();
    restrict_to_chain_material(&mut weights, material.as_ref());
    let bias = Arc::new(HammerBias::new(&weights, config.invalid_chance)?);
    for entrypoint in Entrypoint::ALL {
        tracing::debug!(
            %entrypoint,
            weight = bias.weight(entrypoint),
            invalid_chance = bias.invalid_chance(entrypoint),
            "bias"
        );
    }

    let cancel = CancellationToken::new();
    let metrics: Arc<dyn HammerMetricsSink> = match config.metrics_endpoint {
        Some(address) => {
            let registry = Registry::default();
            let metrics = HammerMetrics::new(&registry);
            let _server = start_metrics_server(address, registry, cancel.child_token()).await?;
            Arc::new(metrics)
        }
        None => Arc::new(NoopMetrics),
    };

    let pool = Arc::new(ServerPool::parse(&config.servers)?);
    let http = build_http_client(config.request_timeout)?;
    let chains = material.map(|material| {
        Arc::new(SyntheticChainGenerator::new(material)) as Arc<dyn ChainGenerator>
    });
    let campaigns = plan_campaigns(&config, targets, bias, seed, Utc::now())?
        .into_iter()
        .map(|params| {
            let operator: Arc<dyn LogOperator> = Arc::new(HttpLogOperator::new(
                &params,
                pool.clone(),
                http.clone(),
                chains.clone(),
            ));
            LogCampaign { params, operator }
        })
        .collect();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping all workers");
                cancel.cancel();
            }
        }
    });

    let verdict = FleetOrchestrator::new(metrics, cancel.clone())
        .run(campaigns)
        .await;
    cancel.cancel();
    verdict.log_summary();

    if !verdict.is_success() {
        anyhow::bail!(
            "hammering failed for logs: {}",
            verdict.failed_prefixes().join(", ")
        );
    }
    Ok(())
}

/// A seed from the wall clock, kept to 32 bits so it is easy to pass back via `--seed`.
fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|elapsed| u64::try_from(elapsed.as_nanos() & 0xFFFF_FFFF).ok())
        .unwrap_or_default()
}
