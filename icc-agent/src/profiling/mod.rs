// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Profiling controller: one profiler per (service, profile type), a pause
//! registry, the upload sink for produced profiles, and the periodic
//! profiler-state reporter.

mod profiler;

pub use profiler::{ProducedProfile, ProfileRequest, ProfileSink};

use crate::config::FlamegraphSettings;
use crate::icc::{IccClient, IccError, StatesPayload};
use crate::runtime::{ProfileType, RuntimeAdapter, WorkerId};
use icc_common::worker::Worker;
use icc_common::{unix_timestamp_ms, MutexExt};
use profiler::{Profiler, ProfilerHandle};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ProfilingService {
    runtime: Arc<dyn RuntimeAdapter>,
    icc: Option<Arc<IccClient>>,
    settings: FlamegraphSettings,
    pod_id: String,
    profilers: tokio::sync::Mutex<HashMap<(String, ProfileType), ProfilerHandle>>,
    pauses: std::sync::Mutex<HashMap<String, Instant>>,
    dropped_while_paused: AtomicU64,
}

impl ProfilingService {
    pub fn new(
        runtime: Arc<dyn RuntimeAdapter>,
        icc: Option<Arc<IccClient>>,
        settings: FlamegraphSettings,
        pod_id: String,
    ) -> Self {
        Self {
            runtime,
            icc,
            settings,
            pod_id,
            profilers: tokio::sync::Mutex::new(HashMap::new()),
            pauses: std::sync::Mutex::new(HashMap::new()),
            dropped_while_paused: AtomicU64::new(0),
        }
    }

    /// Route a profile request to the service's profiler, creating it on
    /// first use. A second profiler for the same (service, type) is never
    /// created; concurrent requests merge into the existing one.
    pub async fn request_profile(
        &self,
        service_id: &str,
        profile_type: ProfileType,
        request: ProfileRequest,
    ) {
        if self.settings.disabled {
            debug!(service_id, "flamegraphs disabled, ignoring profile request");
            return;
        }
        if self.is_paused(service_id) {
            self.dropped_while_paused.fetch_add(1, Ordering::Relaxed);
            info!(service_id, "profiling paused for service, dropping request");
            return;
        }

        let workers = match self.runtime.list_workers().await {
            Ok(workers) => workers,
            Err(error) => {
                warn!(%error, service_id, "could not list workers for profile request");
                return;
            }
        };

        let key = (service_id.to_string(), profile_type);
        let mut profilers = self.profilers.lock().await;

        // The profiled worker may have gone away between cycles; replace the
        // profiler with one targeting whatever is now the service's first
        // worker.
        if let Some(handle) = profilers.get(&key) {
            if !workers.contains_key(&handle.worker.to_string()) {
                info!(worker = %handle.worker, "profiled worker is gone, restarting profiler");
                if let Some(handle) = profilers.remove(&key) {
                    handle.stop().await;
                }
            }
        }

        if !profilers.contains_key(&key) {
            let Some(target) = Self::default_worker(&workers, service_id) else {
                warn!(service_id, "no workers available to profile");
                return;
            };
            let sink = self.upload_sink(service_id, profile_type);
            let handle =
                Profiler::spawn(target, profile_type, &self.settings, self.runtime.clone(), sink);
            profilers.insert(key.clone(), handle);
        }

        #[allow(clippy::unwrap_used)] // inserted above when missing
        if !profilers.get(&key).unwrap().request(request).await {
            warn!(service_id, "profiler task is gone, dropping request");
            profilers.remove(&key);
        }
    }

    /// Request one profile of the given type for every service the runtime
    /// currently knows about.
    pub async fn request_all_services(&self, profile_type: ProfileType) {
        let workers = match self.runtime.list_workers().await {
            Ok(workers) => workers,
            Err(error) => {
                warn!(%error, "could not list workers for triggered profiles");
                return;
            }
        };
        let services: BTreeSet<String> = workers
            .values()
            .map(|worker| worker.service_id.clone())
            .collect();
        let timestamp_ms = unix_timestamp_ms();
        for service_id in services {
            self.request_profile(
                &service_id,
                profile_type,
                ProfileRequest {
                    alert_id: None,
                    timestamp_ms,
                },
            )
            .await;
        }
    }

    /// Suppress profiling for a service until the timeout elapses, stopping
    /// whatever is currently running for it.
    pub async fn pause(&self, service_id: &str, timeout: Duration) {
        self.pauses
            .lock_or_panic()
            .insert(service_id.to_string(), Instant::now() + timeout);
        info!(
            service_id,
            timeout_ms = timeout.as_millis() as u64,
            "pausing profiling for service"
        );
        let mut profilers = self.profilers.lock().await;
        let keys: Vec<_> = profilers
            .keys()
            .filter(|(service, _)| service == service_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(handle) = profilers.remove(&key) {
                handle.stop().await;
            }
        }
    }

    /// Stop every profiler; used at shutdown after the control channel is
    /// closed.
    pub async fn stop_all(&self) {
        let mut profilers = self.profilers.lock().await;
        for (_, handle) in profilers.drain() {
            handle.stop().await;
        }
    }

    /// How many profile requests were dropped because their service was
    /// paused. Whether such alerts should be retried is an open product
    /// question; the counter makes the drops visible in the meantime.
    pub fn dropped_while_paused(&self) -> u64 {
        self.dropped_while_paused.load(Ordering::Relaxed)
    }

    pub async fn active_profilers(&self) -> Vec<(String, ProfileType)> {
        self.profilers.lock().await.keys().cloned().collect()
    }

    fn is_paused(&self, service_id: &str) -> bool {
        let mut pauses = self.pauses.lock_or_panic();
        match pauses.get(service_id) {
            // An entry expiring exactly now is already expired.
            Some(expires_at) if Instant::now() < *expires_at => true,
            Some(_) => {
                pauses.remove(service_id);
                false
            }
            None => false,
        }
    }

    fn default_worker(workers: &HashMap<String, WorkerId>, service_id: &str) -> Option<WorkerId> {
        workers
            .values()
            .filter(|worker| worker.service_id == service_id)
            .min_by_key(|worker| worker.index)
            .cloned()
    }

    fn upload_sink(&self, service_id: &str, profile_type: ProfileType) -> ProfileSink {
        let icc = self.icc.clone();
        let pod_id = self.pod_id.clone();
        let service_id = service_id.to_string();
        Arc::new(move |profile, requests| {
            let icc = icc.clone();
            let pod_id = pod_id.clone();
            let service_id = service_id.clone();
            Box::pin(async move {
                deliver_profile(icc, pod_id, service_id, profile_type, profile, requests).await;
            })
        })
    }
}

/// Upload one produced profile and bind it to the alerts of its matched
/// requests: the first alert rides along with the upload, the rest go
/// through the attach endpoint, falling back to one upload per alert on
/// control centers that lack it.
async fn deliver_profile(
    icc: Option<Arc<IccClient>>,
    pod_id: String,
    service_id: String,
    profile_type: ProfileType,
    profile: ProducedProfile,
    requests: Vec<ProfileRequest>,
) {
    let Some(icc) = icc else {
        debug!(service_id, "no control center configured, discarding produced profile");
        return;
    };

    let mut alert_ids: Vec<String> = Vec::new();
    for request in &requests {
        if let Some(alert_id) = &request.alert_id {
            if !alert_ids.contains(alert_id) {
                alert_ids.push(alert_id.clone());
            }
        }
    }
    let first = if alert_ids.is_empty() {
        None
    } else {
        Some(alert_ids.remove(0))
    };

    let flamegraph = match icc
        .upload_flamegraph(
            &pod_id,
            &service_id,
            profile_type,
            first.as_deref(),
            profile.bytes.clone(),
        )
        .await
    {
        Ok(flamegraph) => flamegraph,
        Err(error) => {
            warn!(%error, service_id, "flamegraph upload failed");
            return;
        }
    };
    info!(
        service_id,
        flamegraph_id = %flamegraph.id,
        profile_type = %profile_type,
        "uploaded profile"
    );

    if alert_ids.is_empty() {
        return;
    }
    match icc.attach_alerts(&flamegraph.id, &alert_ids).await {
        Ok(()) => {}
        Err(IccError::MultipleAlertsNotSupported) => {
            for alert_id in &alert_ids {
                if let Err(error) = icc
                    .upload_flamegraph(
                        &pod_id,
                        &service_id,
                        profile_type,
                        Some(alert_id),
                        profile.bytes.clone(),
                    )
                    .await
                {
                    warn!(%error, alert_id, "fallback upload for alert failed");
                }
            }
        }
        Err(error) => warn!(%error, "could not attach alerts to flamegraph"),
    }
}

/// Periodically reports the runtime's profiler states to the control
/// center so operators can see what is being profiled.
pub struct StateReporter {
    runtime: Arc<dyn RuntimeAdapter>,
    icc: Arc<IccClient>,
    application_id: String,
    pod_id: String,
    interval: Duration,
    shutdown: CancellationToken,
}

impl StateReporter {
    pub fn new(
        runtime: Arc<dyn RuntimeAdapter>,
        icc: Arc<IccClient>,
        application_id: String,
        pod_id: String,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            icc,
            application_id,
            pod_id,
            interval,
            shutdown,
        }
    }

    async fn report(&self) {
        let states = match self.runtime.profiling_state().await {
            Ok(states) => states,
            Err(error) => {
                debug!(%error, "could not read profiling state");
                return;
            }
        };
        let payload = StatesPayload {
            application_id: self.application_id.clone(),
            pod_id: self.pod_id.clone(),
            expires_in: (self.interval * 2).as_millis() as u64,
            states,
        };
        if let Err(error) = self.icc.post_profiler_states(&payload).await {
            warn!(%error, "could not report profiler states");
        }
    }
}

impl Worker for StateReporter {
    async fn run(&mut self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => self.report().await,
            }
        }
    }
}
