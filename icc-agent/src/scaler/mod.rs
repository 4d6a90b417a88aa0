// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Vertical autoscaler: a rolling per-worker ELU window, a pure
//! recommendation algorithm over it, and a controller that serializes
//! applies against the runtime.

mod algorithm;
mod controller;
mod window;

pub use algorithm::{recommend, AppInfo, Direction, ScaleRecommendation};
pub use controller::ScalingController;
pub use window::EluWindow;
