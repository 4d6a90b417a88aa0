// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Boundary between the agent and the application runtime it sits beside.
//!
//! The runtime publishes one ordered stream of [`HealthSample`] events and
//! accepts a small set of commands. Everything the agent knows about workers
//! flows through [`RuntimeAdapter`]; no cached view of the worker set is
//! authoritative.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// One execution unit of an application, identified by `(service, index)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerId {
    pub service_id: String,
    pub index: u32,
}

impl WorkerId {
    pub fn new(service_id: impl Into<String>, index: u32) -> Self {
        Self {
            service_id: service_id.into(),
            index,
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_id, self.index)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileType {
    Cpu,
    Heap,
}

impl ProfileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::Cpu => "cpu",
            ProfileType::Heap => "heap",
        }
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Additional named signal attached to a health event by the runtime,
/// forwarded verbatim into the signals batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomSignal {
    pub name: String,
    pub value: f64,
    pub timestamp_ms: u64,
}

/// Health reading for one worker at one runtime tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub worker: WorkerId,
    /// Event loop utilization in `[0, 1]`.
    pub elu: f64,
    pub heap_used_bytes: u64,
    pub heap_total_bytes: u64,
    pub timestamp_ms: u64,
    /// Legacy runtimes precompute the unhealthy flag; richer runtimes leave
    /// it unset and the agent synthesizes it from elu and heap usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_signals: Vec<CustomSignal>,
}

impl HealthSample {
    pub fn heap_ratio(&self) -> f64 {
        if self.heap_total_bytes == 0 {
            return 0.0;
        }
        self.heap_used_bytes as f64 / self.heap_total_bytes as f64
    }

    /// The runtime-provided flag wins; otherwise unhealthy means a hot event
    /// loop or heap usage above `max_heap_used`.
    pub fn is_unhealthy(&self, max_heap_used: f64) -> bool {
        match self.unhealthy {
            Some(flag) => flag,
            None => self.elu > 0.85 || self.heap_ratio() > max_heap_used,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfilingOptions {
    pub profile_type: ProfileType,
    pub duration: Duration,
    pub source_maps: bool,
}

/// Opaque profile bytes plus the runtime's timestamp for when the profile
/// window started.
#[derive(Clone, Debug)]
pub struct ProfileData {
    pub bytes: bytes::Bytes,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilerStateEntry {
    pub worker: WorkerId,
    pub profile_type: ProfileType,
    pub state: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUpdate {
    pub application_id: String,
    pub worker_count: u32,
}

/// Commands the runtime can fail with. The first three are control-flow
/// tags, not failures: call sites branch on them instead of matching
/// message strings.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no profile available yet")]
    NoProfileAvailable,
    #[error("not enough event loop activity to produce a profile")]
    NotEnoughActivity,
    #[error("profiling has not been started")]
    ProfilingNotStarted,
    #[error("worker {0} is gone")]
    WorkerGone(WorkerId),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Command surface of the application runtime.
///
/// All methods suspend; results must be re-fetched whenever needed rather
/// than cached (workers come and go underneath the agent).
pub trait RuntimeAdapter: Send + Sync {
    /// Hand out the single ordered stream of health events. Called once by
    /// the agent's event pump.
    fn subscribe_health_events(&self) -> mpsc::Receiver<HealthSample>;

    fn start_profiling(
        &self,
        worker: WorkerId,
        options: ProfilingOptions,
    ) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn stop_profiling(
        &self,
        worker: WorkerId,
        profile_type: ProfileType,
    ) -> BoxFuture<'_, Result<(), RuntimeError>>;

    /// Most recently produced profile for the worker, if any.
    fn last_profile(
        &self,
        worker: WorkerId,
        profile_type: ProfileType,
    ) -> BoxFuture<'_, Result<ProfileData, RuntimeError>>;

    fn profiling_state(&self) -> BoxFuture<'_, Result<Vec<ProfilerStateEntry>, RuntimeError>>;

    /// Current worker set, keyed by the worker's display id.
    fn list_workers(&self) -> BoxFuture<'_, Result<HashMap<String, WorkerId>, RuntimeError>>;

    fn update_applications_resources(
        &self,
        updates: Vec<ResourceUpdate>,
    ) -> BoxFuture<'_, Result<(), RuntimeError>>;

    /// Forward a configuration document received over the control channel
    /// to the application.
    fn apply_config(&self, config: serde_json::Value) -> BoxFuture<'_, Result<(), RuntimeError>>;

    /// Whether this runtime emits the richer health-metrics event (heap and
    /// custom signals in addition to elu).
    fn supports_health_metrics(&self) -> bool;

    /// Tear down the event stream; the agent calls this last during
    /// shutdown.
    fn close(&self) -> BoxFuture<'_, ()>;
}

#[cfg(any(test, feature = "test-utils"))]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
pub mod testing {
    use super::*;
    use icc_common::MutexExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Copy, Debug)]
    pub enum ProfileFailure {
        Unavailable,
        NotEnoughActivity,
    }

    /// In-memory runtime used by tests: a fixed worker set, canned
    /// profiles, and call recording.
    pub struct MockRuntime {
        pub workers: Mutex<Vec<WorkerId>>,
        pub profiles: Mutex<HashMap<(WorkerId, ProfileType), Result<ProfileData, ProfileFailure>>>,
        pub started: Mutex<Vec<(WorkerId, ProfileType)>>,
        pub stopped: Mutex<Vec<(WorkerId, ProfileType)>>,
        pub resource_updates: Mutex<Vec<Vec<ResourceUpdate>>>,
        pub applied_configs: Mutex<Vec<serde_json::Value>>,
        pub last_profile_calls: AtomicUsize,
        pub rich_metrics: bool,
        events: Mutex<Option<mpsc::Receiver<HealthSample>>>,
        pub events_tx: mpsc::Sender<HealthSample>,
    }

    impl MockRuntime {
        pub fn new(workers: Vec<WorkerId>) -> Self {
            let (tx, rx) = mpsc::channel(64);
            Self {
                workers: Mutex::new(workers),
                profiles: Mutex::new(HashMap::new()),
                started: Mutex::new(Vec::new()),
                stopped: Mutex::new(Vec::new()),
                resource_updates: Mutex::new(Vec::new()),
                applied_configs: Mutex::new(Vec::new()),
                last_profile_calls: AtomicUsize::new(0),
                rich_metrics: true,
                events: Mutex::new(Some(rx)),
                events_tx: tx,
            }
        }

        pub fn set_profile(&self, worker: WorkerId, profile_type: ProfileType, data: ProfileData) {
            self.profiles
                .lock_or_panic()
                .insert((worker, profile_type), Ok(data));
        }

        pub fn set_profile_error(
            &self,
            worker: WorkerId,
            profile_type: ProfileType,
            failure: ProfileFailure,
        ) {
            self.profiles
                .lock_or_panic()
                .insert((worker, profile_type), Err(failure));
        }
    }

    impl RuntimeAdapter for MockRuntime {
        fn subscribe_health_events(&self) -> mpsc::Receiver<HealthSample> {
            self.events
                .lock_or_panic()
                .take()
                .expect("health events already subscribed")
        }

        fn start_profiling(
            &self,
            worker: WorkerId,
            options: ProfilingOptions,
        ) -> BoxFuture<'_, Result<(), RuntimeError>> {
            self.started
                .lock_or_panic()
                .push((worker, options.profile_type));
            Box::pin(async { Ok(()) })
        }

        fn stop_profiling(
            &self,
            worker: WorkerId,
            profile_type: ProfileType,
        ) -> BoxFuture<'_, Result<(), RuntimeError>> {
            self.stopped.lock_or_panic().push((worker, profile_type));
            Box::pin(async { Ok(()) })
        }

        fn last_profile(
            &self,
            worker: WorkerId,
            profile_type: ProfileType,
        ) -> BoxFuture<'_, Result<ProfileData, RuntimeError>> {
            self.last_profile_calls.fetch_add(1, Ordering::Relaxed);
            let entry = self
                .profiles
                .lock_or_panic()
                .get(&(worker, profile_type))
                .cloned();
            Box::pin(async move {
                match entry {
                    Some(Ok(data)) => Ok(data),
                    Some(Err(ProfileFailure::NotEnoughActivity)) => {
                        Err(RuntimeError::NotEnoughActivity)
                    }
                    Some(Err(ProfileFailure::Unavailable)) | None => {
                        Err(RuntimeError::NoProfileAvailable)
                    }
                }
            })
        }

        fn profiling_state(
            &self,
        ) -> BoxFuture<'_, Result<Vec<ProfilerStateEntry>, RuntimeError>> {
            let started = self.started.lock_or_panic().clone();
            Box::pin(async move {
                Ok(started
                    .into_iter()
                    .map(|(worker, profile_type)| ProfilerStateEntry {
                        worker,
                        profile_type,
                        state: "running".to_string(),
                    })
                    .collect())
            })
        }

        fn list_workers(
            &self,
        ) -> BoxFuture<'_, Result<HashMap<String, WorkerId>, RuntimeError>> {
            let workers = self.workers.lock_or_panic().clone();
            Box::pin(async move {
                Ok(workers
                    .into_iter()
                    .map(|w| (w.to_string(), w))
                    .collect())
            })
        }

        fn update_applications_resources(
            &self,
            updates: Vec<ResourceUpdate>,
        ) -> BoxFuture<'_, Result<(), RuntimeError>> {
            self.resource_updates.lock_or_panic().push(updates);
            Box::pin(async { Ok(()) })
        }

        fn apply_config(
            &self,
            config: serde_json::Value,
        ) -> BoxFuture<'_, Result<(), RuntimeError>> {
            self.applied_configs.lock_or_panic().push(config);
            Box::pin(async { Ok(()) })
        }

        fn supports_health_metrics(&self) -> bool {
            self.rich_metrics
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    pub fn sample(service: &str, index: u32, elu: f64, timestamp_ms: u64) -> HealthSample {
        HealthSample {
            worker: WorkerId::new(service, index),
            elu,
            heap_used_bytes: 64 << 20,
            heap_total_bytes: 256 << 20,
            timestamp_ms,
            unhealthy: None,
            extra_signals: Vec::new(),
        }
    }
}
