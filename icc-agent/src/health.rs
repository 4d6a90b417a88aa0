// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Health-signals batcher: ring-buffers ELU and heap readings per
//! (service, signal, worker) and flushes them to the control center's
//! scaler, fast when something crossed a threshold and slowly otherwise.
//! Alerts coming back from a flush turn into CPU profile requests.

use crate::config::HealthSettings;
use crate::icc::{IccClient, SignalOptions, SignalSeries, SignalsPayload, WorkerSeries};
use crate::profiling::{ProfileRequest, ProfilingService};
use crate::runtime::{HealthSample, ProfileType};
use icc_common::{unix_timestamp_ms, MutexExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SIGNAL_ELU: &str = "elu";
const SIGNAL_HEAP: &str = "heap";

/// Per-(service, signal, worker) buffers never grow past this; the oldest
/// readings are dropped first.
const BUFFER_CAP: usize = 500;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BufferKey {
    service_id: String,
    signal: String,
    worker: String,
}

#[derive(Default)]
struct BatchState {
    started_at_ms: Option<u64>,
    hot: bool,
    buffers: HashMap<BufferKey, VecDeque<(u64, f64)>>,
    heap_totals_mib: HashMap<String, f64>,
}

impl BatchState {
    fn push(&mut self, key: BufferKey, timestamp_ms: u64, value: f64) {
        let buffer = self.buffers.entry(key).or_default();
        if buffer.len() == BUFFER_CAP {
            buffer.pop_front();
        }
        buffer.push_back((timestamp_ms, value));
    }
}

pub struct SignalBatcher {
    icc: Option<Arc<IccClient>>,
    profiling: Arc<ProfilingService>,
    settings: HealthSettings,
    application_id: String,
    runtime_id: String,
    state: Mutex<BatchState>,
    shutdown: CancellationToken,
}

impl SignalBatcher {
    pub fn new(
        icc: Option<Arc<IccClient>>,
        profiling: Arc<ProfilingService>,
        settings: HealthSettings,
        application_id: String,
        runtime_id: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            icc,
            profiling,
            settings,
            application_id,
            runtime_id,
            state: Mutex::new(BatchState::default()),
            shutdown,
        }
    }

    /// Fold one health sample into the open batch, opening one if needed.
    pub fn record(&self, sample: &HealthSample) {
        let service_id = sample.worker.service_id.clone();
        let worker = sample.worker.to_string();
        let heap_used_mib = (sample.heap_used_bytes as f64 / MIB).round();

        let mut state = self.state.lock_or_panic();
        if state.started_at_ms.is_none() {
            state.started_at_ms = Some(sample.timestamp_ms);
        }
        state.push(
            BufferKey {
                service_id: service_id.clone(),
                signal: SIGNAL_ELU.to_string(),
                worker: worker.clone(),
            },
            sample.timestamp_ms,
            sample.elu,
        );
        state.push(
            BufferKey {
                service_id: service_id.clone(),
                signal: SIGNAL_HEAP.to_string(),
                worker: worker.clone(),
            },
            sample.timestamp_ms,
            heap_used_mib,
        );
        state
            .heap_totals_mib
            .insert(service_id.clone(), (sample.heap_total_bytes as f64 / MIB).round());
        for extra in &sample.extra_signals {
            state.push(
                BufferKey {
                    service_id: service_id.clone(),
                    signal: extra.name.clone(),
                    worker: worker.clone(),
                },
                extra.timestamp_ms,
                extra.value,
            );
        }
        if sample.elu > self.settings.elu_threshold
            || heap_used_mib > self.settings.heap_threshold_mib
        {
            state.hot = true;
        }
    }

    /// A hot batch (a value above threshold) flushes on the short timeout,
    /// everything else on the long one. No open batch, no flush.
    fn flush_due(&self, now_ms: u64) -> bool {
        let state = self.state.lock_or_panic();
        let Some(started_at_ms) = state.started_at_ms else {
            return false;
        };
        let timeout = if state.hot {
            self.settings.batch_short
        } else {
            self.settings.batch_long
        };
        now_ms.saturating_sub(started_at_ms) >= timeout.as_millis() as u64
    }

    /// Drain the open batch into a payload and immediately open a new one.
    fn take_batch(&self, now_ms: u64) -> Option<SignalsPayload> {
        let mut state = self.state.lock_or_panic();
        let started_at_ms = state.started_at_ms?;
        let buffers = std::mem::take(&mut state.buffers);
        let heap_totals_mib = state.heap_totals_mib.clone();
        state.started_at_ms = Some(now_ms);
        state.hot = false;
        drop(state);

        if buffers.is_empty() {
            return None;
        }

        let mut signals: HashMap<String, HashMap<String, SignalSeries>> = HashMap::new();
        for (key, values) in buffers {
            let series = signals
                .entry(key.service_id.clone())
                .or_default()
                .entry(key.signal.clone())
                .or_insert_with(|| SignalSeries {
                    options: match key.signal.as_str() {
                        SIGNAL_ELU => SignalOptions {
                            threshold: Some(self.settings.elu_threshold),
                            heap_total: None,
                        },
                        SIGNAL_HEAP => SignalOptions {
                            threshold: Some(self.settings.heap_threshold_mib),
                            heap_total: heap_totals_mib.get(&key.service_id).copied(),
                        },
                        _ => SignalOptions::default(),
                    },
                    workers: HashMap::new(),
                });
            series.workers.insert(
                key.worker,
                WorkerSeries {
                    values: values.into_iter().collect(),
                },
            );
        }

        Some(SignalsPayload {
            application_id: self.application_id.clone(),
            runtime_id: self.runtime_id.clone(),
            batch_started_at: started_at_ms,
            signals,
        })
    }

    async fn flush(&self, now_ms: u64) {
        let Some(payload) = self.take_batch(now_ms) else {
            return;
        };
        let Some(icc) = &self.icc else {
            debug!("no control center configured, discarding signals batch");
            return;
        };
        match icc.post_signals(&payload).await {
            Ok(response) => {
                for alert in response.alerts {
                    self.profiling
                        .request_profile(
                            &alert.service_id,
                            ProfileType::Cpu,
                            ProfileRequest {
                                alert_id: Some(alert.alert_id),
                                timestamp_ms: now_ms,
                            },
                        )
                        .await;
                }
            }
            Err(error) => warn!(%error, "could not post signals batch"),
        }
    }
}

impl SignalBatcher {
    /// Flush loop, ticking once a second until shutdown. A final flush
    /// pushes out whatever is still buffered.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.flush(unix_timestamp_ms()).await;
                    return;
                }
                _ = interval.tick() => {
                    let now_ms = unix_timestamp_ms();
                    if self.flush_due(now_ms) {
                        self.flush(now_ms).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlamegraphSettings;
    use crate::runtime::testing::{sample, MockRuntime};
    use crate::runtime::{CustomSignal, WorkerId};
    use httpmock::prelude::*;
    use icc_common::auth::StaticAuth;
    use icc_common::Endpoint;

    fn batcher(icc: Option<Arc<IccClient>>) -> (Arc<MockRuntime>, SignalBatcher) {
        let runtime = Arc::new(MockRuntime::new(vec![WorkerId::new("main", 0)]));
        let profiling = Arc::new(ProfilingService::new(
            runtime.clone(),
            None,
            FlamegraphSettings::default(),
            "pod-1".to_string(),
        ));
        let batcher = SignalBatcher::new(
            icc,
            profiling,
            HealthSettings::default(),
            "app-1".to_string(),
            "rt-1".to_string(),
            CancellationToken::new(),
        );
        (runtime, batcher)
    }

    fn elu_sample(elu: f64, timestamp_ms: u64) -> HealthSample {
        sample("main", 0, elu, timestamp_ms)
    }

    #[test]
    fn test_hot_batch_flushes_on_short_timeout() {
        let (_runtime, batcher) = batcher(None);
        batcher.record(&elu_sample(0.1, 0));
        batcher.record(&elu_sample(0.9, 200));

        assert!(!batcher.flush_due(999));
        assert!(batcher.flush_due(1_000));

        let payload = batcher.take_batch(1_000).expect("open batch");
        assert_eq!(payload.application_id, "app-1");
        assert_eq!(payload.batch_started_at, 0);
        let elu = &payload.signals["main"]["elu"];
        assert_eq!(elu.options.threshold, Some(0.8));
        assert_eq!(
            elu.workers["main:0"].values,
            vec![(0, 0.1), (200, 0.9)]
        );
    }

    #[test]
    fn test_quiet_batch_waits_for_long_timeout() {
        let (_runtime, batcher) = batcher(None);
        batcher.record(&elu_sample(0.1, 0));

        assert!(!batcher.flush_due(1_000));
        assert!(!batcher.flush_due(9_999));
        assert!(batcher.flush_due(10_000));
    }

    #[test]
    fn test_no_open_batch_is_a_noop() {
        let (_runtime, batcher) = batcher(None);
        assert!(!batcher.flush_due(60_000));
        assert!(batcher.take_batch(60_000).is_none());
    }

    #[test]
    fn test_flush_opens_a_new_batch_immediately() {
        let (_runtime, batcher) = batcher(None);
        batcher.record(&elu_sample(0.9, 0));
        batcher.take_batch(1_000);

        // The next batch is already open, timed from the flush.
        batcher.record(&elu_sample(0.5, 1_200));
        let payload = batcher.take_batch(11_000).expect("open batch");
        assert_eq!(payload.batch_started_at, 1_000);
    }

    #[test]
    fn test_heap_values_are_mib_rounded_with_total_option() {
        let (_runtime, batcher) = batcher(None);
        batcher.record(&elu_sample(0.5, 100));

        let payload = batcher.take_batch(10_000).expect("open batch");
        let heap = &payload.signals["main"]["heap"];
        assert_eq!(heap.workers["main:0"].values, vec![(100, 64.0)]);
        assert_eq!(heap.options.heap_total, Some(256.0));
        assert_eq!(heap.options.threshold, Some(512.0));
    }

    #[test]
    fn test_custom_signals_are_forwarded_verbatim() {
        let (_runtime, batcher) = batcher(None);
        let mut sample = elu_sample(0.5, 100);
        sample.extra_signals.push(CustomSignal {
            name: "rss".to_string(),
            value: 123.0,
            timestamp_ms: 90,
        });
        batcher.record(&sample);

        let payload = batcher.take_batch(10_000).expect("open batch");
        let rss = &payload.signals["main"]["rss"];
        assert_eq!(rss.options, SignalOptions::default());
        assert_eq!(rss.workers["main:0"].values, vec![(90, 123.0)]);
    }

    #[test]
    fn test_buffers_cap_drops_oldest() {
        let (_runtime, batcher) = batcher(None);
        for i in 0..600u64 {
            batcher.record(&elu_sample(0.5, i));
        }

        let payload = batcher.take_batch(10_000).expect("open batch");
        let values = &payload.signals["main"]["elu"].workers["main:0"].values;
        assert_eq!(values.len(), 500);
        assert_eq!(values[0].0, 100);
        assert_eq!(values[499].0, 599);
    }

    #[tokio::test]
    async fn test_flush_dispatches_returned_alerts_to_profiling() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/signals");
                then.status(200).json_body(serde_json::json!({
                    "alerts": [
                        {"serviceId": "main", "workerId": "main:0", "alertId": "al-7"}
                    ]
                }));
            })
            .await;

        let endpoint = Endpoint::parse(&server.url("")).unwrap();
        let icc = Arc::new(
            IccClient::new(&endpoint, Arc::new(StaticAuth::bearer("secret").unwrap())).unwrap(),
        );
        let (_runtime, batcher) = batcher(Some(icc));
        batcher.record(&elu_sample(0.9, 0));
        batcher.flush(2_000).await;

        mock.assert_async().await;
        let active = batcher.profiling.active_profilers().await;
        assert_eq!(active, vec![("main".to_string(), ProfileType::Cpu)]);
    }
}
