// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::FlamegraphSettings;
use crate::runtime::{ProfileType, ProfilingOptions, RuntimeAdapter, RuntimeError, WorkerId};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A queued ask for one profile, optionally tied to an alert.
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileRequest {
    pub alert_id: Option<String>,
    pub timestamp_ms: u64,
}

/// Profile bytes handed to the sink together with the requests they satisfy.
#[derive(Clone, Debug)]
pub struct ProducedProfile {
    pub service_id: String,
    pub worker: WorkerId,
    pub profile_type: ProfileType,
    pub bytes: bytes::Bytes,
    pub timestamp_ms: u64,
}

/// Where produced profiles go. Sinks are plain closures capturing only the
/// ids they need, so profilers hold no back-pointer into the controller.
pub type ProfileSink =
    Arc<dyn Fn(ProducedProfile, Vec<ProfileRequest>) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) enum ProfilerCommand {
    Request(ProfileRequest),
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProfilerState {
    Idle,
    Running,
    Stopping,
}

pub(crate) struct ProfilerHandle {
    pub(crate) worker: WorkerId,
    commands: mpsc::Sender<ProfilerCommand>,
    join: JoinHandle<()>,
}

impl ProfilerHandle {
    pub(crate) async fn request(&self, request: ProfileRequest) -> bool {
        self.commands
            .send(ProfilerCommand::Request(request))
            .await
            .is_ok()
    }

    /// Stop the profiler task and wait for it to wind down.
    pub(crate) async fn stop(self) {
        let _ = self.commands.send(ProfilerCommand::Stop).await;
        let _ = self.join.await;
    }
}

/// Drives one worker's profile sessions for one profile type.
///
/// The profiler task loops over three wake-ups: a command (new request or
/// stop), the production deadline one duration after profiling started, and
/// an idle-stop deadline half a duration after the queue drained.
pub(crate) struct Profiler {
    worker: WorkerId,
    profile_type: ProfileType,
    duration: Duration,
    attempt_timeout: Duration,
    source_maps: bool,
    runtime: Arc<dyn RuntimeAdapter>,
    sink: ProfileSink,
    commands: mpsc::Receiver<ProfilerCommand>,
    state: ProfilerState,
    pending: VecDeque<ProfileRequest>,
    next_production: Option<Instant>,
    idle_stop_at: Option<Instant>,
    last_profile: Option<ProducedProfile>,
}

async fn sleep_until_target(target: Option<Instant>) {
    if let Some(target) = target {
        tokio::time::sleep_until(target).await;
    }
}

impl Profiler {
    pub(crate) fn spawn(
        worker: WorkerId,
        profile_type: ProfileType,
        settings: &FlamegraphSettings,
        runtime: Arc<dyn RuntimeAdapter>,
        sink: ProfileSink,
    ) -> ProfilerHandle {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let profiler = Profiler {
            worker: worker.clone(),
            profile_type,
            duration: settings.duration,
            attempt_timeout: settings.attempt_timeout,
            source_maps: settings.source_maps,
            runtime,
            sink,
            commands: commands_rx,
            state: ProfilerState::Idle,
            pending: VecDeque::new(),
            next_production: None,
            idle_stop_at: None,
            last_profile: None,
        };
        let join = tokio::spawn(profiler.run());
        ProfilerHandle {
            worker,
            commands: commands_tx,
            join,
        }
    }

    async fn run(mut self) {
        loop {
            let next_production = self.next_production;
            let idle_stop_at = self.idle_stop_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ProfilerCommand::Request(request)) => self.handle_request(request).await,
                    Some(ProfilerCommand::Stop) | None => {
                        self.wind_down().await;
                        return;
                    }
                },
                _ = sleep_until_target(next_production), if next_production.is_some() => {
                    self.produce().await;
                }
                _ = sleep_until_target(idle_stop_at), if idle_stop_at.is_some() => {
                    self.idle_stop_at = None;
                    self.stop_profiling().await;
                }
            }
        }
    }

    async fn handle_request(&mut self, request: ProfileRequest) {
        match self.state {
            ProfilerState::Running | ProfilerState::Stopping => {
                self.idle_stop_at = None;
                if self.next_production.is_none() {
                    self.next_production = Some(Instant::now() + self.duration);
                }
                self.pending.push_back(request);
            }
            ProfilerState::Idle => {
                let options = ProfilingOptions {
                    profile_type: self.profile_type,
                    duration: self.duration,
                    source_maps: self.source_maps,
                };
                match self
                    .runtime
                    .start_profiling(self.worker.clone(), options)
                    .await
                {
                    Ok(()) => {
                        debug!(
                            worker = %self.worker,
                            profile_type = %self.profile_type,
                            "profiling started"
                        );
                        self.state = ProfilerState::Running;
                        self.last_profile = None;
                        self.pending.push_back(request);
                        self.next_production = Some(Instant::now() + self.duration);
                        self.idle_stop_at = None;
                    }
                    Err(error) => {
                        warn!(worker = %self.worker, %error, "could not start profiling");
                    }
                }
            }
        }
    }

    async fn produce(&mut self) {
        self.next_production = None;
        if let Some(data) = self.fetch_profile().await {
            let produced = ProducedProfile {
                service_id: self.worker.service_id.clone(),
                worker: self.worker.clone(),
                profile_type: self.profile_type,
                bytes: data.bytes,
                timestamp_ms: data.timestamp_ms,
            };

            // Requests that predate the profile are satisfied by it, in
            // insertion order; later ones wait for the next cycle.
            let mut matched = Vec::new();
            let mut remaining = VecDeque::new();
            while let Some(request) = self.pending.pop_front() {
                if request.timestamp_ms <= produced.timestamp_ms {
                    matched.push(request);
                } else {
                    remaining.push_back(request);
                }
            }
            self.pending = remaining;
            self.last_profile = Some(produced.clone());

            if !matched.is_empty() {
                (self.sink)(produced, matched).await;
            }
        }

        if self.pending.is_empty() {
            self.idle_stop_at = Some(Instant::now() + self.duration / 2);
        } else {
            self.next_production = Some(Instant::now() + self.duration);
        }
    }

    async fn fetch_profile(&self) -> Option<crate::runtime::ProfileData> {
        let attempt_millis = self.attempt_timeout.as_millis().max(1);
        let attempts = self.duration.as_millis().div_ceil(attempt_millis) as u32 + 1;
        for attempt in 1..=attempts {
            match self
                .runtime
                .last_profile(self.worker.clone(), self.profile_type)
                .await
            {
                Ok(data) => return Some(data),
                Err(RuntimeError::NoProfileAvailable) => {
                    info!(worker = %self.worker, attempt, "profile not available yet");
                    if attempt < attempts {
                        tokio::time::sleep(self.attempt_timeout).await;
                    }
                }
                Err(RuntimeError::NotEnoughActivity) => {
                    info!(
                        worker = %self.worker,
                        "not enough event loop activity, skipping this profile"
                    );
                    return None;
                }
                Err(error) => {
                    warn!(worker = %self.worker, %error, "could not fetch produced profile");
                    return None;
                }
            }
        }
        None
    }

    async fn stop_profiling(&mut self) {
        if self.state != ProfilerState::Running {
            return;
        }
        self.state = ProfilerState::Stopping;
        self.next_production = None;
        match self
            .runtime
            .stop_profiling(self.worker.clone(), self.profile_type)
            .await
        {
            Ok(()) => {
                debug!(worker = %self.worker, profile_type = %self.profile_type, "profiling stopped")
            }
            Err(RuntimeError::ProfilingNotStarted) => {
                info!(worker = %self.worker, "profiling already stopped")
            }
            Err(error) => warn!(worker = %self.worker, %error, "could not stop profiling"),
        }
        self.state = ProfilerState::Idle;
    }

    /// Final teardown: profiling is stopped best-effort and whatever is
    /// still queued receives the cycle's last profile, if one exists.
    async fn wind_down(&mut self) {
        self.idle_stop_at = None;
        self.next_production = None;
        self.stop_profiling().await;
        if self.pending.is_empty() {
            return;
        }
        let pending: Vec<ProfileRequest> = self.pending.drain(..).collect();
        match self.last_profile.clone() {
            Some(profile) => (self.sink)(profile, pending).await,
            None => warn!(
                worker = %self.worker,
                dropped = pending.len(),
                "stopping profiler with pending requests and no produced profile"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{MockRuntime, ProfileFailure};
    use crate::runtime::ProfileData;
    use icc_common::MutexExt;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    type SinkCalls = Arc<Mutex<Vec<(ProducedProfile, Vec<ProfileRequest>)>>>;

    fn recording_sink() -> (ProfileSink, SinkCalls) {
        let calls: SinkCalls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let sink: ProfileSink = Arc::new(move |profile, requests| {
            let recorded = recorded.clone();
            Box::pin(async move {
                recorded.lock_or_panic().push((profile, requests));
            })
        });
        (sink, calls)
    }

    fn settings(duration_ms: u64, attempt_ms: u64) -> FlamegraphSettings {
        FlamegraphSettings {
            duration: Duration::from_millis(duration_ms),
            attempt_timeout: Duration::from_millis(attempt_ms),
            ..FlamegraphSettings::default()
        }
    }

    fn request(alert_id: Option<&str>, timestamp_ms: u64) -> ProfileRequest {
        ProfileRequest {
            alert_id: alert_id.map(str::to_string),
            timestamp_ms,
        }
    }

    fn profile(timestamp_ms: u64) -> ProfileData {
        ProfileData {
            bytes: bytes::Bytes::from_static(b"pprof"),
            timestamp_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_coalesce_into_one_production() {
        let worker = WorkerId::new("main", 0);
        let runtime = Arc::new(MockRuntime::new(vec![worker.clone()]));
        runtime.set_profile(worker.clone(), ProfileType::Cpu, profile(1_000));
        let (sink, calls) = recording_sink();

        let handle = Profiler::spawn(
            worker.clone(),
            ProfileType::Cpu,
            &settings(1_000, 1_000),
            runtime.clone(),
            sink,
        );
        assert!(handle.request(request(Some("a1"), 0)).await);
        assert!(handle.request(request(Some("a2"), 200)).await);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let calls = calls.lock_or_panic();
        assert_eq!(calls.len(), 1);
        let (produced, matched) = &calls[0];
        assert_eq!(produced.timestamp_ms, 1_000);
        let alert_ids: Vec<_> = matched.iter().filter_map(|r| r.alert_id.clone()).collect();
        assert_eq!(alert_ids, vec!["a1", "a2"]);
        assert_eq!(
            runtime.started.lock_or_panic().as_slice(),
            &[(worker, ProfileType::Cpu)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_profiler_stops_after_half_duration() {
        let worker = WorkerId::new("main", 0);
        let runtime = Arc::new(MockRuntime::new(vec![worker.clone()]));
        runtime.set_profile(worker.clone(), ProfileType::Cpu, profile(u64::MAX));
        let (sink, _calls) = recording_sink();

        let handle = Profiler::spawn(
            worker.clone(),
            ProfileType::Cpu,
            &settings(1_000, 1_000),
            runtime.clone(),
            sink,
        );
        assert!(handle.request(request(Some("a1"), 0)).await);

        // Production at 1s, idle stop at 1.5s.
        tokio::time::sleep(Duration::from_millis(1_600)).await;

        assert_eq!(
            runtime.stopped.lock_or_panic().as_slice(),
            &[(worker, ProfileType::Cpu)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_request_cancels_idle_stop() {
        let worker = WorkerId::new("main", 0);
        let runtime = Arc::new(MockRuntime::new(vec![worker.clone()]));
        runtime.set_profile(worker.clone(), ProfileType::Cpu, profile(u64::MAX));
        let (sink, calls) = recording_sink();

        let handle = Profiler::spawn(
            worker.clone(),
            ProfileType::Cpu,
            &settings(1_000, 1_000),
            runtime.clone(),
            sink,
        );
        assert!(handle.request(request(Some("a1"), 0)).await);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        // Queue drained, idle stop armed for 1.5s: a fresh request disarms it.
        assert!(handle.request(request(Some("a2"), 0)).await);
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        assert!(runtime.stopped.lock_or_panic().is_empty());
        assert_eq!(calls.lock_or_panic().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_pending_through_last_profile() {
        let worker = WorkerId::new("main", 0);
        let runtime = Arc::new(MockRuntime::new(vec![worker.clone()]));
        runtime.set_profile(worker.clone(), ProfileType::Cpu, profile(500));
        let (sink, calls) = recording_sink();

        let handle = Profiler::spawn(
            worker.clone(),
            ProfileType::Cpu,
            &settings(1_000, 1_000),
            runtime.clone(),
            sink,
        );
        assert!(handle.request(request(Some("a1"), 0)).await);
        // Arrives "after" the profile window: left pending by the match.
        assert!(handle.request(request(Some("a2"), 2_000)).await);
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        handle.stop().await;

        let calls = calls.lock_or_panic();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, vec![request(Some("a1"), 0)]);
        assert_eq!(calls[1].1, vec![request(Some("a2"), 2_000)]);
        assert_eq!(runtime.stopped.lock_or_panic().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_profile_drops_pending() {
        let worker = WorkerId::new("main", 0);
        let runtime = Arc::new(MockRuntime::new(vec![worker.clone()]));
        let (sink, calls) = recording_sink();

        let handle = Profiler::spawn(
            worker.clone(),
            ProfileType::Cpu,
            &settings(1_000, 1_000),
            runtime.clone(),
            sink,
        );
        assert!(handle.request(request(Some("a1"), 0)).await);
        handle.stop().await;

        assert!(calls.lock_or_panic().is_empty());
        assert_eq!(runtime.stopped.lock_or_panic().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_activity_is_not_retried() {
        let worker = WorkerId::new("main", 0);
        let runtime = Arc::new(MockRuntime::new(vec![worker.clone()]));
        runtime.set_profile_error(
            worker.clone(),
            ProfileType::Cpu,
            ProfileFailure::NotEnoughActivity,
        );
        let (sink, calls) = recording_sink();

        let handle = Profiler::spawn(
            worker.clone(),
            ProfileType::Cpu,
            &settings(1_000, 400),
            runtime.clone(),
            sink,
        );
        assert!(handle.request(request(Some("a1"), 0)).await);
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(runtime.last_profile_calls.load(Ordering::Relaxed), 1);
        assert!(calls.lock_or_panic().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_profile_retries_are_bounded() {
        let worker = WorkerId::new("main", 0);
        let runtime = Arc::new(MockRuntime::new(vec![worker.clone()]));
        runtime.set_profile_error(worker.clone(), ProfileType::Cpu, ProfileFailure::Unavailable);
        let (sink, calls) = recording_sink();

        let handle = Profiler::spawn(
            worker.clone(),
            ProfileType::Cpu,
            &settings(1_000, 400),
            runtime.clone(),
            sink,
        );
        assert!(handle.request(request(Some("a1"), 0)).await);
        // Production at 1s, then ceil(1000/400) + 1 = 4 attempts spaced 400ms;
        // the second production would only start at ~3.2s.
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(runtime.last_profile_calls.load(Ordering::Relaxed), 4);
        assert!(calls.lock_or_panic().is_empty());
    }
}
