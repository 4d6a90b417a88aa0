// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use icc_common::Endpoint;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

const ENV_ICC_URL: &str = "ICC_AGENT_URL";
const ENV_APPLICATION_ID: &str = "ICC_AGENT_APPLICATION_ID";
const ENV_POD_ID: &str = "ICC_AGENT_POD_ID";
const ENV_RECONNECT_INTERVAL_MILLIS: &str = "ICC_AGENT_RECONNECT_INTERVAL_MILLIS";

const ENV_SCALER_VERSION: &str = "ICC_AGENT_SCALER_VERSION";
const ENV_MAX_WORKERS: &str = "ICC_AGENT_MAX_WORKERS";
const ENV_SCALE_UP_ELU: &str = "ICC_AGENT_SCALE_UP_ELU";
const ENV_SCALE_DOWN_ELU: &str = "ICC_AGENT_SCALE_DOWN_ELU";
const ENV_MIN_ELU_DIFF: &str = "ICC_AGENT_MIN_ELU_DIFF";
const ENV_TIME_WINDOW_SECS: &str = "ICC_AGENT_TIME_WINDOW_SECS";
const ENV_COOLDOWN_SECS: &str = "ICC_AGENT_COOLDOWN_SECS";

const ENV_FLAMEGRAPHS_DISABLED: &str = "ICC_AGENT_FLAMEGRAPHS_DISABLED";
const ENV_FLAMEGRAPH_DURATION_SECS: &str = "ICC_AGENT_FLAMEGRAPH_DURATION_SECS";
const ENV_PAUSE_ELU_THRESHOLD: &str = "ICC_AGENT_PAUSE_ELU_THRESHOLD";
const ENV_PAUSE_TIMEOUT_MILLIS: &str = "ICC_AGENT_PAUSE_TIMEOUT_MILLIS";

const ENV_HEALTH_ELU_THRESHOLD: &str = "ICC_AGENT_HEALTH_ELU_THRESHOLD";
const ENV_HEALTH_HEAP_THRESHOLD_MIB: &str = "ICC_AGENT_HEALTH_HEAP_THRESHOLD_MIB";
const ENV_BATCH_SHORT_MILLIS: &str = "ICC_AGENT_BATCH_SHORT_MILLIS";
const ENV_BATCH_LONG_MILLIS: &str = "ICC_AGENT_BATCH_LONG_MILLIS";

const ENV_ALERT_GRACE_PERIOD_SECS: &str = "ICC_AGENT_ALERT_GRACE_PERIOD_SECS";
const ENV_POD_HEALTH_WINDOW_MILLIS: &str = "ICC_AGENT_POD_HEALTH_WINDOW_MILLIS";
const ENV_ALERT_RETENTION_WINDOW_MILLIS: &str = "ICC_AGENT_ALERT_RETENTION_WINDOW_MILLIS";
const ENV_MAX_HEAP_USED: &str = "ICC_AGENT_MAX_HEAP_USED";

const ENV_STATES_REFRESH_INTERVAL_SECS: &str = "ICC_AGENT_STATES_REFRESH_INTERVAL_SECS";

const SCALER_VERSION_V1: &str = "v1";
const SCALER_VERSION_V2: &str = "v2";

/// Which remote scaler algorithm this pod talks to. `V1` drives the local
/// alert engine; `V2` drives the health-signals batcher. Mutually exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalerVersion {
    V1,
    #[default]
    V2,
}

impl std::fmt::Display for ScalerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalerVersion::V1 => write!(f, "{SCALER_VERSION_V1}"),
            ScalerVersion::V2 => write!(f, "{SCALER_VERSION_V2}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScalerSettings {
    pub version: ScalerVersion,
    pub max_workers: u32,
    pub scale_up_elu: f64,
    pub scale_down_elu: f64,
    pub min_elu_diff: f64,
    pub time_window: Duration,
    pub cooldown: Duration,
}

impl Default for ScalerSettings {
    fn default() -> Self {
        Self {
            version: ScalerVersion::default(),
            max_workers: 10,
            scale_up_elu: 0.8,
            scale_down_elu: 0.2,
            min_elu_diff: 0.2,
            time_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FlamegraphSettings {
    pub disabled: bool,
    pub duration: Duration,
    /// How long to wait between attempts to fetch a produced profile.
    pub attempt_timeout: Duration,
    pub pause_elu_threshold: f64,
    pub pause_timeout: Duration,
    pub source_maps: bool,
}

impl Default for FlamegraphSettings {
    fn default() -> Self {
        Self {
            disabled: false,
            duration: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(5),
            pause_elu_threshold: 0.95,
            pause_timeout: Duration::from_secs(60),
            source_maps: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HealthSettings {
    pub elu_threshold: f64,
    pub heap_threshold_mib: f64,
    pub batch_short: Duration,
    pub batch_long: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            elu_threshold: 0.8,
            heap_threshold_mib: 512.0,
            batch_short: Duration::from_secs(1),
            batch_long: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AlertSettings {
    pub grace_period: Duration,
    pub pod_health_window: Duration,
    pub alert_retention_window: Duration,
    pub max_heap_used: f64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            pod_health_window: Duration::from_secs(60),
            alert_retention_window: Duration::from_secs(60),
            max_heap_used: 0.9,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IccSettings {
    pub endpoint: Endpoint,
    pub reconnect_interval: Duration,
}

/// Process-lifetime agent configuration. Without an `IccSettings` the agent
/// runs standalone: no network I/O is initiated, local loops still run.
#[derive(Clone, Debug)]
pub struct Config {
    pub application_id: String,
    pub pod_id: String,
    pub icc: Option<IccSettings>,
    pub scaler: ScalerSettings,
    pub flamegraphs: FlamegraphSettings,
    pub health: HealthSettings,
    pub alerts: AlertSettings,
    pub states_refresh_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application_id: String::new(),
            pod_id: String::new(),
            icc: None,
            scaler: ScalerSettings::default(),
            flamegraphs: FlamegraphSettings::default(),
            health: HealthSettings::default(),
            alerts: AlertSettings::default(),
            states_refresh_interval: Duration::from_secs(10),
        }
    }
}

static ENV_CONFIG: LazyLock<Config> = LazyLock::new(FromEnv::config);

impl Config {
    pub fn get() -> &'static Self {
        &ENV_CONFIG
    }
}

pub struct FromEnv {}

impl FromEnv {
    fn var(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(name: &str, default: T) -> T {
        Self::var(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn secs(name: &str, default: Duration) -> Duration {
        Self::var(name)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    fn millis(name: &str, default: Duration) -> Duration {
        Self::var(name)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    fn flag(name: &str) -> bool {
        matches!(Self::var(name).as_deref(), Some("true" | "1"))
    }

    fn scaler_version() -> ScalerVersion {
        match Self::var(ENV_SCALER_VERSION).as_deref() {
            Some(SCALER_VERSION_V1) => ScalerVersion::V1,
            Some(SCALER_VERSION_V2) | None => ScalerVersion::default(),
            Some(other) => {
                tracing::warn!(version = other, "unknown scaler version, using default");
                ScalerVersion::default()
            }
        }
    }

    fn icc() -> Option<IccSettings> {
        let url = Self::var(ENV_ICC_URL)?;
        let endpoint = match Endpoint::parse(&url) {
            Ok(endpoint) => endpoint,
            Err(error) => {
                tracing::warn!(%error, %url, "invalid control center url, running standalone");
                return None;
            }
        };
        Some(IccSettings {
            endpoint,
            reconnect_interval: Self::millis(
                ENV_RECONNECT_INTERVAL_MILLIS,
                Duration::from_secs(5),
            ),
        })
    }

    pub fn config() -> Config {
        let defaults = Config::default();
        let scaler_defaults = ScalerSettings::default();
        let flamegraph_defaults = FlamegraphSettings::default();
        let health_defaults = HealthSettings::default();
        let alert_defaults = AlertSettings::default();
        Config {
            application_id: Self::var(ENV_APPLICATION_ID).unwrap_or_default(),
            pod_id: Self::var(ENV_POD_ID).unwrap_or_default(),
            icc: Self::icc(),
            scaler: ScalerSettings {
                version: Self::scaler_version(),
                max_workers: Self::parse(ENV_MAX_WORKERS, scaler_defaults.max_workers),
                scale_up_elu: Self::parse(ENV_SCALE_UP_ELU, scaler_defaults.scale_up_elu),
                scale_down_elu: Self::parse(ENV_SCALE_DOWN_ELU, scaler_defaults.scale_down_elu),
                min_elu_diff: Self::parse(ENV_MIN_ELU_DIFF, scaler_defaults.min_elu_diff),
                time_window: Self::secs(ENV_TIME_WINDOW_SECS, scaler_defaults.time_window),
                cooldown: Self::secs(ENV_COOLDOWN_SECS, scaler_defaults.cooldown),
            },
            flamegraphs: FlamegraphSettings {
                disabled: Self::flag(ENV_FLAMEGRAPHS_DISABLED),
                duration: Self::secs(ENV_FLAMEGRAPH_DURATION_SECS, flamegraph_defaults.duration),
                attempt_timeout: flamegraph_defaults.attempt_timeout,
                pause_elu_threshold: Self::parse(
                    ENV_PAUSE_ELU_THRESHOLD,
                    flamegraph_defaults.pause_elu_threshold,
                ),
                pause_timeout: Self::millis(
                    ENV_PAUSE_TIMEOUT_MILLIS,
                    flamegraph_defaults.pause_timeout,
                ),
                source_maps: flamegraph_defaults.source_maps,
            },
            health: HealthSettings {
                elu_threshold: Self::parse(
                    ENV_HEALTH_ELU_THRESHOLD,
                    health_defaults.elu_threshold,
                ),
                heap_threshold_mib: Self::parse(
                    ENV_HEALTH_HEAP_THRESHOLD_MIB,
                    health_defaults.heap_threshold_mib,
                ),
                batch_short: Self::millis(ENV_BATCH_SHORT_MILLIS, health_defaults.batch_short),
                batch_long: Self::millis(ENV_BATCH_LONG_MILLIS, health_defaults.batch_long),
            },
            alerts: AlertSettings {
                grace_period: Self::secs(
                    ENV_ALERT_GRACE_PERIOD_SECS,
                    alert_defaults.grace_period,
                ),
                pod_health_window: Self::millis(
                    ENV_POD_HEALTH_WINDOW_MILLIS,
                    alert_defaults.pod_health_window,
                ),
                alert_retention_window: Self::millis(
                    ENV_ALERT_RETENTION_WINDOW_MILLIS,
                    alert_defaults.alert_retention_window,
                ),
                max_heap_used: Self::parse(ENV_MAX_HEAP_USED, alert_defaults.max_heap_used),
            },
            states_refresh_interval: Self::secs(
                ENV_STATES_REFRESH_INTERVAL_SECS,
                defaults.states_refresh_interval,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scaler.version, ScalerVersion::V2);
        assert_eq!(config.scaler.max_workers, 10);
        assert!(config.icc.is_none());
        assert_eq!(config.health.batch_long, Duration::from_secs(10));
        assert_eq!(config.states_refresh_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var(ENV_ICC_URL, "http://icc.test:8080");
        std::env::set_var(ENV_SCALER_VERSION, "v1");
        std::env::set_var(ENV_MAX_WORKERS, "4");
        std::env::set_var(ENV_BATCH_LONG_MILLIS, "2500");

        let config = FromEnv::config();
        assert_eq!(config.scaler.version, ScalerVersion::V1);
        assert_eq!(config.scaler.max_workers, 4);
        assert_eq!(config.health.batch_long, Duration::from_millis(2500));
        let icc = config.icc.expect("icc settings");
        assert_eq!(icc.endpoint.url.host(), Some("icc.test"));

        std::env::remove_var(ENV_ICC_URL);
        std::env::remove_var(ENV_SCALER_VERSION);
        std::env::remove_var(ENV_MAX_WORKERS);
        std::env::remove_var(ENV_BATCH_LONG_MILLIS);
    }

    #[test]
    fn test_scaler_version_display() {
        assert_eq!(ScalerVersion::V1.to_string(), "v1");
        assert_eq!(ScalerVersion::V2.to_string(), "v2");
    }
}
