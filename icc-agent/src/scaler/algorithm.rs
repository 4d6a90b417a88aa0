// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::ScalerSettings;
use serde::Serialize;

/// Input row: one application's windowed mean ELU and current worker count.
#[derive(Clone, Debug, PartialEq)]
pub struct AppInfo {
    pub application_id: String,
    pub elu: f64,
    pub worker_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScaleRecommendation {
    pub application_id: String,
    pub target_worker_count: u32,
    pub direction: Direction,
}

/// Deterministic scaling pass over the current application set.
///
/// Applications are ranked by ELU ascending (worker count descending on
/// ties). Every cold application above one worker sheds a worker; the
/// hottest application gains one if the pod still has headroom, otherwise a
/// worker is reallocated from the coldest application when the imbalance is
/// large enough. Worker counts never drop below one.
pub fn recommend(mut apps: Vec<AppInfo>, settings: &ScalerSettings) -> Vec<ScaleRecommendation> {
    let mut recommendations = Vec::new();
    if apps.is_empty() {
        return recommendations;
    }

    apps.sort_by(|a, b| {
        a.elu
            .partial_cmp(&b.elu)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.worker_count.cmp(&a.worker_count))
    });

    let mut scaled_down: Vec<bool> = vec![false; apps.len()];
    for (i, app) in apps.iter().enumerate() {
        if app.elu < settings.scale_down_elu && app.worker_count > 1 {
            scaled_down[i] = true;
            recommendations.push(ScaleRecommendation {
                application_id: app.application_id.clone(),
                target_worker_count: app.worker_count - 1,
                direction: Direction::Down,
            });
        }
    }

    let effective = |i: usize| apps[i].worker_count - u32::from(scaled_down[i]);

    let candidate_idx = apps.len() - 1;
    let candidate = &apps[candidate_idx];
    if candidate.elu <= settings.scale_up_elu {
        return recommendations;
    }

    let total_workers: u32 = (0..apps.len()).map(effective).sum();
    if total_workers < settings.max_workers {
        recommendations.push(ScaleRecommendation {
            application_id: candidate.application_id.clone(),
            target_worker_count: candidate.worker_count + 1,
            direction: Direction::Up,
        });
        return recommendations;
    }

    // At the worker cap: steal from the coldest application, but only when
    // the imbalance is worth the churn.
    if candidate_idx == 0 {
        return recommendations;
    }
    let donor_idx = 0;
    let donor = &apps[donor_idx];
    let donor_workers = effective(donor_idx);
    let elu_gap = candidate.elu - donor.elu >= settings.min_elu_diff;
    let worker_gap = donor_workers.saturating_sub(effective(candidate_idx)) >= 2;
    if donor_workers > 1 && (elu_gap || worker_gap) {
        recommendations.push(ScaleRecommendation {
            application_id: donor.application_id.clone(),
            target_worker_count: donor_workers - 1,
            direction: Direction::Down,
        });
        recommendations.push(ScaleRecommendation {
            application_id: candidate.application_id.clone(),
            target_worker_count: candidate.worker_count + 1,
            direction: Direction::Up,
        });
    }

    recommendations
}
