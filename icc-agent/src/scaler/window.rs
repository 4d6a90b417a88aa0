// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::algorithm::AppInfo;
use crate::runtime::{HealthSample, WorkerId};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Rolling ELU history, per application and per worker.
///
/// Entries older than the configured window are discarded lazily, both when
/// new samples are appended and when the window is read.
#[derive(Debug)]
pub struct EluWindow {
    window: Duration,
    apps: HashMap<String, HashMap<WorkerId, VecDeque<(u64, f64)>>>,
}

impl EluWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            apps: HashMap::new(),
        }
    }

    pub fn record(&mut self, sample: &HealthSample) {
        let horizon = sample.timestamp_ms.saturating_sub(self.window.as_millis() as u64);
        let entries = self
            .apps
            .entry(sample.worker.service_id.clone())
            .or_default()
            .entry(sample.worker.clone())
            .or_default();
        entries.push_back((sample.timestamp_ms, sample.elu));
        while entries.front().is_some_and(|(ts, _)| *ts < horizon) {
            entries.pop_front();
        }
    }

    /// Summarize the window into per-application inputs for the algorithm.
    ///
    /// `worker_counts` is the runtime's current view of workers per
    /// application; the application ELU is the mean across workers of each
    /// worker's mean over the window, rounded to two decimals.
    pub fn app_infos(&mut self, now_ms: u64, worker_counts: &HashMap<String, u32>) -> Vec<AppInfo> {
        let horizon = now_ms.saturating_sub(self.window.as_millis() as u64);
        for workers in self.apps.values_mut() {
            for entries in workers.values_mut() {
                while entries.front().is_some_and(|(ts, _)| *ts < horizon) {
                    entries.pop_front();
                }
            }
            workers.retain(|_, entries| !entries.is_empty());
        }
        self.apps.retain(|_, workers| !workers.is_empty());

        let mut infos = Vec::new();
        for (application_id, workers) in &self.apps {
            let Some(worker_count) = worker_counts.get(application_id).copied() else {
                continue;
            };
            let worker_means: Vec<f64> = workers
                .values()
                .map(|entries| {
                    entries.iter().map(|(_, elu)| elu).sum::<f64>() / entries.len() as f64
                })
                .collect();
            let elu = worker_means.iter().sum::<f64>() / worker_means.len() as f64;
            infos.push(AppInfo {
                application_id: application_id.clone(),
                elu: (elu * 100.0).round() / 100.0,
                worker_count,
            });
        }
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::sample;

    fn counts(entries: &[(&str, u32)]) -> HashMap<String, u32> {
        entries
            .iter()
            .map(|(id, count)| (id.to_string(), *count))
            .collect()
    }

    #[test]
    fn test_mean_of_worker_means_rounded() {
        let mut window = EluWindow::new(Duration::from_secs(60));
        window.record(&sample("main", 0, 0.8, 1_000));
        window.record(&sample("main", 0, 0.9, 2_000));
        window.record(&sample("main", 1, 0.4, 2_000));

        let infos = window.app_infos(2_000, &counts(&[("main", 2)]));
        assert_eq!(infos.len(), 1);
        // worker 0 mean 0.85, worker 1 mean 0.4 -> 0.625 -> 0.63
        assert_eq!(infos[0].elu, 0.63);
        assert_eq!(infos[0].worker_count, 2);
    }

    #[test]
    fn test_entries_outside_window_are_dropped_on_read() {
        let mut window = EluWindow::new(Duration::from_secs(10));
        window.record(&sample("main", 0, 1.0, 0));
        window.record(&sample("main", 0, 0.5, 9_000));

        let infos = window.app_infos(20_000, &counts(&[("main", 1)]));
        assert!(infos.is_empty(), "all entries expired: {infos:?}");
    }

    #[test]
    fn test_entries_outside_window_are_dropped_on_insert() {
        let mut window = EluWindow::new(Duration::from_secs(10));
        window.record(&sample("main", 0, 1.0, 0));
        window.record(&sample("main", 0, 0.5, 15_000));

        let infos = window.app_infos(15_000, &counts(&[("main", 1)]));
        assert_eq!(infos[0].elu, 0.5);
    }

    #[test]
    fn test_apps_without_runtime_workers_are_skipped() {
        let mut window = EluWindow::new(Duration::from_secs(10));
        window.record(&sample("gone", 0, 0.5, 1_000));

        let infos = window.app_infos(1_000, &counts(&[("main", 1)]));
        assert!(infos.is_empty());
    }
}
