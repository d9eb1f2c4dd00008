// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Scripted log operators and helpers shared by the integration tests.

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use ct_hammer::{
    bias::{BiasWeights, Entrypoint, HammerBias},
    config::LogTarget,
    hammer::{CampaignParameters, LogOperator},
    metrics::{HammerMetricsSink, OperationOutcome},
    op_generator::LogOp,
};

/// How a scripted operator answers.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Every request succeeds.
    Succeed,
    /// Every request fails.
    Fail,
    /// The first `n` requests fail, the rest succeed.
    FailFirst(u64),
    /// The first request panics.
    Panic,
}

#[derive(Debug)]
pub struct ScriptedOperator {
    script: Script,
    calls: AtomicU64,
    requests: Mutex<Vec<(LogOp, bool)>>,
}

impl ScriptedOperator {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(LogOp, bool)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogOperator for ScriptedOperator {
    async fn execute(&self, op: &LogOp, invalid: bool) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push((*op, invalid));
        match self.script {
            Script::Succeed => Ok(()),
            Script::Fail => anyhow::bail!("log returned 503 Service Unavailable"),
            Script::FailFirst(n) if call < n => anyhow::bail!("transient failure {call}"),
            Script::FailFirst(_) => Ok(()),
            Script::Panic => panic!("operator exploded"),
        }
    }
}

/// Counts the events reported by the workers.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    pub operations: Mutex<BTreeMap<(String, OperationOutcome), u64>>,
    pub retries: AtomicU64,
    pub finished: Mutex<Vec<(String, String)>>,
}

impl HammerMetricsSink for CountingMetrics {
    fn observe_operation(
        &self,
        prefix: &str,
        _entrypoint: Entrypoint,
        _invalid: bool,
        outcome: OperationOutcome,
    ) {
        *self
            .operations
            .lock()
            .unwrap()
            .entry((prefix.to_owned(), outcome))
            .or_default() += 1;
    }

    fn observe_retry(&self, _prefix: &str, _entrypoint: Entrypoint) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn observe_worker_started(&self, _prefix: &str) {}

    fn observe_worker_finished(&self, prefix: &str, state: &str) {
        self.finished
            .lock()
            .unwrap()
            .push((prefix.to_owned(), state.to_owned()));
    }
}

/// A bias table issuing only get-sth, one request per round.
pub fn get_sth_only() -> Arc<HammerBias> {
    Arc::new(
        HammerBias::from_maps(BTreeMap::from([(Entrypoint::GetSth, 1)]), BTreeMap::new())
            .unwrap(),
    )
}

/// The default bias table.
pub fn default_bias() -> Arc<HammerBias> {
    Arc::new(HammerBias::new(&BiasWeights::default(), 10).unwrap())
}

pub fn params(prefix: &str, bias: Arc<HammerBias>) -> CampaignParameters {
    CampaignParameters::with_defaults(LogTarget::new(prefix), bias, Utc::now())
}
