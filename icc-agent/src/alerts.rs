// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Alert engine for v1 scalers: watches the health stream, posts an alert
//! when a worker goes unhealthy, and asks the profiling controller for a
//! CPU flamegraph bound to the returned alert id. Very hot workers pause
//! profiling instead of piling profile overhead onto a struggling pod.

use crate::config::{AlertSettings, FlamegraphSettings};
use crate::icc::{AlertBody, AlertPayload, IccClient};
use crate::profiling::{ProfileRequest, ProfilingService};
use crate::runtime::{HealthSample, ProfileType, WorkerId};
use icc_common::MutexExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Default)]
struct AlertState {
    history: VecDeque<HealthSample>,
    worker_first_seen: HashMap<WorkerId, u64>,
    last_alert_at: HashMap<String, u64>,
}

pub struct AlertEngine {
    icc: Option<Arc<IccClient>>,
    profiling: Arc<ProfilingService>,
    settings: AlertSettings,
    pause_elu_threshold: f64,
    pause_timeout: Duration,
    application_id: String,
    state: Mutex<AlertState>,
}

impl AlertEngine {
    pub fn new(
        icc: Option<Arc<IccClient>>,
        profiling: Arc<ProfilingService>,
        settings: AlertSettings,
        flamegraphs: &FlamegraphSettings,
        application_id: String,
    ) -> Self {
        Self {
            icc,
            profiling,
            settings,
            pause_elu_threshold: flamegraphs.pause_elu_threshold,
            pause_timeout: flamegraphs.pause_timeout,
            application_id,
            state: Mutex::new(AlertState::default()),
        }
    }

    pub async fn on_sample(&self, sample: &HealthSample) {
        let now_ms = sample.timestamp_ms;
        let service_id = sample.worker.service_id.clone();

        let history = {
            let mut state = self.state.lock_or_panic();
            state.history.push_back(sample.clone());
            let horizon = now_ms.saturating_sub(self.settings.pod_health_window.as_millis() as u64);
            while state
                .history
                .front()
                .is_some_and(|old| old.timestamp_ms < horizon)
            {
                state.history.pop_front();
            }

            let first_seen = *state
                .worker_first_seen
                .entry(sample.worker.clone())
                .or_insert(now_ms);
            if now_ms.saturating_sub(first_seen) < self.settings.grace_period.as_millis() as u64 {
                debug!(worker = %sample.worker, "worker inside grace period");
                None
            } else if !sample.is_unhealthy(self.settings.max_heap_used) {
                None
            } else if state.last_alert_at.get(&service_id).is_some_and(|last| {
                now_ms.saturating_sub(*last)
                    < self.settings.alert_retention_window.as_millis() as u64
            }) {
                debug!(service_id = %service_id, "alert suppressed by retention window");
                None
            } else {
                state.last_alert_at.insert(service_id.clone(), now_ms);
                Some(state.history.iter().cloned().collect::<Vec<_>>())
            }
        };

        // A pod this hot should not also carry profiling overhead: pause
        // before any flamegraph request can go out.
        if sample.elu >= self.pause_elu_threshold {
            self.profiling
                .pause(&service_id, self.pause_timeout)
                .await;
        }

        let Some(history) = history else {
            return;
        };
        let Some(icc) = &self.icc else {
            debug!(service_id = %service_id, "unhealthy worker but no control center configured");
            return;
        };

        let payload = AlertPayload {
            application_id: self.application_id.clone(),
            alert: AlertBody {
                id: uuid::Uuid::new_v4().to_string(),
                application: self.application_id.clone(),
                service: service_id.clone(),
                current_health: sample.clone(),
                unhealthy: true,
                timestamp: now_ms,
            },
            health_history: history,
        };
        match icc.post_alert(&payload).await {
            Ok(response) => {
                info!(service_id = %service_id, alert_id = %response.id, "alert posted");
                self.profiling
                    .request_profile(
                        &service_id,
                        ProfileType::Cpu,
                        ProfileRequest {
                            alert_id: Some(response.id),
                            timestamp_ms: now_ms,
                        },
                    )
                    .await;
            }
            Err(error) => warn!(%error, service_id = %service_id, "could not post alert"),
        }
    }

    #[cfg(test)]
    fn history_len(&self) -> usize {
        self.state.lock_or_panic().history.len()
    }
}
