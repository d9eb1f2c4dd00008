// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Stress testing for fleets of Certificate Transparency logs.
//!
//! Every configured log gets its own worker drawing weighted random rounds of CT API calls,
//! optionally rate limited and retried, until its operation budget is spent. The
//! [`fleet::FleetOrchestrator`] runs all workers concurrently and folds their results into a
//! single [`fleet::FleetVerdict`].
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use ct_hammer::{
//!     bias::{BiasWeights, HammerBias},
//!     client::{HttpLogOperator, ServerPool, build_http_client},
//!     config::LogTarget,
//!     fleet::{FleetOrchestrator, LogCampaign},
//!     hammer::CampaignParameters,
//!     metrics::NoopMetrics,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut weights = BiasWeights::default();
//!     weights.add_chain = 0;
//!     weights.add_pre_chain = 0;
//!     let bias = Arc::new(HammerBias::new(&weights, 10)?);
//!
//!     let params =
//!         CampaignParameters::with_defaults(LogTarget::new("athos"), bias, Utc::now());
//!     let operator = HttpLogOperator::new(
//!         &params,
//!         Arc::new(ServerPool::parse("localhost:8092")?),
//!         build_http_client(std::time::Duration::from_secs(30))?,
//!         None,
//!     );
//!
//!     let verdict = FleetOrchestrator::new(Arc::new(NoopMetrics), CancellationToken::new())
//!         .run(vec![LogCampaign {
//!             params,
//!             operator: Arc::new(operator),
//!         }])
//!         .await;
//!     verdict.log_summary();
//!     Ok(())
//! }
//! ```

pub mod args;
pub mod bias;
pub mod chain;
pub mod client;
pub mod config;
pub mod error;
pub mod fleet;
pub mod hammer;
pub mod limiter;
pub mod metrics;
pub mod not_after;
pub mod op_generator;
pub mod retry;
