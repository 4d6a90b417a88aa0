// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{recommend, EluWindow};
use crate::config::ScalerSettings;
use crate::runtime::{HealthSample, ResourceUpdate, RuntimeAdapter};
use icc_common::{unix_timestamp_ms, MutexExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Applies scaling decisions to the runtime, one at a time.
///
/// Two gates protect the runtime from churn: `is_scaling` collapses
/// concurrent attempts while a decision is in flight, and a cooldown
/// suppresses applies for a while after the previous one, whether or not it
/// succeeded.
pub struct ScalingController {
    runtime: Arc<dyn RuntimeAdapter>,
    settings: ScalerSettings,
    window: Mutex<EluWindow>,
    is_scaling: AtomicBool,
    last_scaling: Mutex<Option<Instant>>,
}

impl ScalingController {
    pub fn new(runtime: Arc<dyn RuntimeAdapter>, settings: ScalerSettings) -> Self {
        let window = EluWindow::new(settings.time_window);
        Self {
            runtime,
            settings,
            window: Mutex::new(window),
            is_scaling: AtomicBool::new(false),
            last_scaling: Mutex::new(None),
        }
    }

    pub fn record(&self, sample: &HealthSample) {
        self.window.lock_or_panic().record(sample);
    }

    pub async fn check_for_scaling(&self) {
        if self.is_scaling.swap(true, Ordering::AcqRel) {
            return;
        }
        self.run_check().await;
        self.is_scaling.store(false, Ordering::Release);
    }

    async fn run_check(&self) {
        if let Some(last) = *self.last_scaling.lock_or_panic() {
            if Instant::now() < last + self.settings.cooldown {
                return;
            }
        }

        let workers = match self.runtime.list_workers().await {
            Ok(workers) => workers,
            Err(error) => {
                warn!(%error, "could not list workers for scaling check");
                return;
            }
        };
        let mut counts: HashMap<String, u32> = HashMap::new();
        for worker in workers.values() {
            *counts.entry(worker.service_id.clone()).or_insert(0) += 1;
        }

        let infos = self
            .window
            .lock_or_panic()
            .app_infos(unix_timestamp_ms(), &counts);
        let recommendations = recommend(infos, &self.settings);
        if recommendations.is_empty() {
            debug!("no scaling recommendations this cycle");
            return;
        }

        for recommendation in &recommendations {
            info!(
                application_id = %recommendation.application_id,
                target_workers = recommendation.target_worker_count,
                direction = ?recommendation.direction,
                "applying scale recommendation"
            );
        }

        let updates = recommendations
            .into_iter()
            .map(|r| ResourceUpdate {
                application_id: r.application_id,
                worker_count: r.target_worker_count,
            })
            .collect();

        // The cooldown starts at the attempt, not at success, so a failing
        // runtime is not hammered with applies.
        *self.last_scaling.lock_or_panic() = Some(Instant::now());
        if let Err(error) = self.runtime.update_applications_resources(updates).await {
            warn!(%error, "failed to apply scaling recommendations");
        }
    }
}
