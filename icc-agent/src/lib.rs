// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Sidecar agent for multi-worker application runtimes.
//!
//! The agent sits beside the runtime and drives four control loops against
//! an Infrastructure Control Center: a vertical autoscaler fed by
//! event-loop-utilization samples, a health-signals batcher for the remote
//! scaler, a profiling controller that turns alerts into uploaded
//! flamegraphs, and a persistent control channel for configuration updates
//! and profile triggers.

pub mod agent;
pub mod alerts;
pub mod channel;
pub mod config;
pub mod health;
pub mod icc;
pub mod profiling;
pub mod runtime;
pub mod scaler;

pub use agent::Agent;
pub use config::Config;
