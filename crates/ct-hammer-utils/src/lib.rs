// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Utilities shared by the CT hammer crates.

#[cfg(feature = "backoff")]
pub mod backoff;

#[cfg(feature = "metrics")]
pub mod metrics;
