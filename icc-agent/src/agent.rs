// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent assembly: owns every control loop and tears them down in a
//! deterministic order. All state lives behind this value; dropping it
//! after [`Agent::shutdown`] leaves nothing running.

use crate::alerts::AlertEngine;
use crate::channel::{websocket_url, ControlChannel};
use crate::config::{Config, ScalerVersion};
use crate::health::SignalBatcher;
use crate::icc::IccClient;
use crate::profiling::{ProfilingService, StateReporter};
use crate::runtime::RuntimeAdapter;
use crate::scaler::ScalingController;
use icc_common::auth::AuthProvider;
use icc_common::worker::Worker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How often the scaler re-evaluates even without unhealthy events. The
/// cooldown gate inside the controller keeps this cheap.
const SCALING_CHECK_INTERVAL: Duration = Duration::from_secs(10);

pub struct Agent {
    runtime: Arc<dyn RuntimeAdapter>,
    profiling: Arc<ProfilingService>,
    channel_shutdown: CancellationToken,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    pub fn start(
        config: Config,
        runtime: Arc<dyn RuntimeAdapter>,
        auth: Arc<dyn AuthProvider>,
    ) -> anyhow::Result<Agent> {
        let runtime_id = uuid::Uuid::new_v4().to_string();
        let icc = match &config.icc {
            Some(settings) => Some(Arc::new(IccClient::new(&settings.endpoint, auth.clone())?)),
            None => {
                warn!("no control center url configured, running standalone");
                None
            }
        };

        let shutdown = CancellationToken::new();
        let channel_shutdown = shutdown.child_token();
        let mut tasks = Vec::new();

        let profiling = Arc::new(ProfilingService::new(
            runtime.clone(),
            icc.clone(),
            config.flamegraphs.clone(),
            config.pod_id.clone(),
        ));
        let controller = Arc::new(ScalingController::new(
            runtime.clone(),
            config.scaler.clone(),
        ));

        let batcher = (config.scaler.version == ScalerVersion::V2
            && runtime.supports_health_metrics())
        .then(|| {
            Arc::new(SignalBatcher::new(
                icc.clone(),
                profiling.clone(),
                config.health.clone(),
                config.application_id.clone(),
                runtime_id.clone(),
                shutdown.child_token(),
            ))
        });
        let alerts = (config.scaler.version == ScalerVersion::V1).then(|| {
            Arc::new(AlertEngine::new(
                icc.clone(),
                profiling.clone(),
                config.alerts.clone(),
                &config.flamegraphs,
                config.application_id.clone(),
            ))
        });

        // Event pump: every component observes samples in arrival order.
        {
            let mut events = runtime.subscribe_health_events();
            let pump_shutdown = shutdown.child_token();
            let controller = controller.clone();
            let batcher = batcher.clone();
            let alerts = alerts.clone();
            let max_heap_used = config.alerts.max_heap_used;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = pump_shutdown.cancelled() => return,
                        event = events.recv() => match event {
                            Some(sample) => {
                                controller.record(&sample);
                                if let Some(batcher) = &batcher {
                                    batcher.record(&sample);
                                }
                                if let Some(alerts) = &alerts {
                                    alerts.on_sample(&sample).await;
                                }
                                if sample.is_unhealthy(max_heap_used) {
                                    let controller = controller.clone();
                                    tokio::spawn(async move {
                                        controller.check_for_scaling().await;
                                    });
                                }
                            }
                            None => return,
                        }
                    }
                }
            }));
        }

        // Periodic re-check so scale-downs also happen on quiet pods.
        {
            let monitor_shutdown = shutdown.child_token();
            let controller = controller.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(SCALING_CHECK_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = monitor_shutdown.cancelled() => return,
                        _ = interval.tick() => controller.check_for_scaling().await,
                    }
                }
            }));
        }

        if let Some(batcher) = &batcher {
            let batcher = batcher.clone();
            tasks.push(tokio::spawn(async move { batcher.run().await }));
        }

        if let Some(settings) = &config.icc {
            let mut channel = ControlChannel::new(
                websocket_url(&settings.endpoint, &config.application_id),
                auth.clone(),
                runtime.clone(),
                profiling.clone(),
                settings.reconnect_interval,
                channel_shutdown.clone(),
            );
            tasks.push(tokio::spawn(async move { channel.run().await }));
        }

        if let (Some(icc), false) = (&icc, config.flamegraphs.disabled) {
            let mut reporter = StateReporter::new(
                runtime.clone(),
                icc.clone(),
                config.application_id.clone(),
                config.pod_id.clone(),
                config.states_refresh_interval,
                shutdown.child_token(),
            );
            tasks.push(tokio::spawn(async move { reporter.run().await }));
        }

        info!(
            application_id = %config.application_id,
            pod_id = %config.pod_id,
            scaler_version = %config.scaler.version,
            standalone = icc.is_none(),
            "agent started"
        );

        Ok(Agent {
            runtime,
            profiling,
            channel_shutdown,
            shutdown,
            tasks,
        })
    }

    pub fn profiling(&self) -> &Arc<ProfilingService> {
        &self.profiling
    }

    /// Deterministic teardown: the control channel goes first so nothing
    /// reconnects or triggers mid-shutdown, then every profiler issues its
    /// best-effort stop, then the periodic loops, and the runtime stream
    /// last.
    pub async fn shutdown(mut self) {
        info!("agent shutting down");
        self.channel_shutdown.cancel();
        self.profiling.stop_all().await;
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.runtime.close().await;
    }
}
