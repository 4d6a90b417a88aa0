// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the Infrastructure Control Center.
//!
//! The client is stateless apart from its base endpoint: authorization
//! headers are produced fresh for every request by the configured
//! [`AuthProvider`], since credentials can rotate at any time.

use crate::runtime::{HealthSample, ProfileType, ProfilerStateEntry};
use icc_common::auth::AuthProvider;
use icc_common::{header, Endpoint};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum IccError {
    /// The control center predates the attach endpoint; callers fall back
    /// to one upload per alert.
    #[error("attaching multiple alerts is not supported by this control center")]
    MultipleAlertsNotSupported,
    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heap_total: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSeries {
    /// `[timestamp, value]` tuples in arrival order.
    pub values: Vec<(u64, f64)>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalSeries {
    pub options: SignalOptions,
    pub workers: HashMap<String, WorkerSeries>,
}

/// Signal series for one service, keyed by signal name (`elu`, `heap`, or a
/// custom name forwarded verbatim).
pub type ServiceSignals = HashMap<String, SignalSeries>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalsPayload {
    pub application_id: String,
    pub runtime_id: String,
    pub batch_started_at: u64,
    pub signals: HashMap<String, ServiceSignals>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalAlert {
    pub service_id: String,
    pub worker_id: String,
    pub alert_id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SignalsResponse {
    #[serde(default)]
    pub alerts: Vec<SignalAlert>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertBody {
    pub id: String,
    pub application: String,
    pub service: String,
    pub current_health: HealthSample,
    pub unhealthy: bool,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub application_id: String,
    pub alert: AlertBody,
    pub health_history: Vec<HealthSample>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AlertResponse {
    pub id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FlamegraphResponse {
    pub id: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachAlertsPayload<'a> {
    alert_ids: &'a [String],
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatesPayload {
    pub application_id: String,
    pub pod_id: String,
    /// Milliseconds after which the control center may consider the
    /// reported states stale.
    pub expires_in: u64,
    pub states: Vec<ProfilerStateEntry>,
}

pub struct IccClient {
    http: reqwest::Client,
    base_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl IccClient {
    pub fn new(endpoint: &Endpoint, auth: Arc<dyn AuthProvider>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(endpoint.timeout_ms))
            .build()?;
        let base_url = endpoint.url.to_string();
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    pub async fn post_signals(&self, payload: &SignalsPayload) -> Result<SignalsResponse, IccError> {
        let path = "/signals".to_string();
        let headers = self.auth_headers().await?;
        let response = self
            .http
            .post(self.url(&path))
            .headers(headers)
            .json(payload)
            .send()
            .await?;
        let body = Self::check("POST", path, response).await?;
        if body.is_empty() {
            return Ok(SignalsResponse::default());
        }
        serde_json::from_str(&body).map_err(|e| IccError::Other(e.into()))
    }

    pub async fn post_alert(&self, payload: &AlertPayload) -> Result<AlertResponse, IccError> {
        let path = "/alerts".to_string();
        let headers = self.auth_headers().await?;
        let response = self
            .http
            .post(self.url(&path))
            .headers(headers)
            .json(payload)
            .send()
            .await?;
        let body = Self::check("POST", path, response).await?;
        serde_json::from_str(&body).map_err(|e| IccError::Other(e.into()))
    }

    /// Upload raw profile bytes, optionally bound to an alert. The body is
    /// an opaque octet stream; the flamegraph id comes back as JSON.
    pub async fn upload_flamegraph(
        &self,
        pod_id: &str,
        service_id: &str,
        profile_type: ProfileType,
        alert_id: Option<&str>,
        bytes: bytes::Bytes,
    ) -> Result<FlamegraphResponse, IccError> {
        let path = format!("/pods/{pod_id}/services/{service_id}/flamegraph");
        let headers = self.auth_headers().await?;
        let mut request = self
            .http
            .post(self.url(&path))
            .headers(headers)
            .header(CONTENT_TYPE, header::APPLICATION_OCTET_STREAM)
            .query(&[("profileType", profile_type.as_str())]);
        if let Some(alert_id) = alert_id {
            request = request.query(&[("alertId", alert_id)]);
        }
        let response = request.body(bytes).send().await?;
        let body = Self::check("POST", path, response).await?;
        serde_json::from_str(&body).map_err(|e| IccError::Other(e.into()))
    }

    /// Bind further alerts to an already uploaded flamegraph. A 404 whose
    /// body names the missing route means the control center predates this
    /// endpoint.
    pub async fn attach_alerts(
        &self,
        flamegraph_id: &str,
        alert_ids: &[String],
    ) -> Result<(), IccError> {
        let path = format!("/flamegraphs/{flamegraph_id}/alerts");
        let headers = self.auth_headers().await?;
        let response = self
            .http
            .post(self.url(&path))
            .headers(headers)
            .json(&AttachAlertsPayload { alert_ids })
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND && body.contains("Route POST") {
            return Err(IccError::MultipleAlertsNotSupported);
        }
        if !status.is_success() {
            error!(status = status.as_u16(), %path, %body, "control center request failed");
            return Err(IccError::Status {
                method: "POST",
                path,
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    pub async fn post_profiler_states(&self, payload: &StatesPayload) -> Result<(), IccError> {
        let path = "/flamegraphs/states".to_string();
        let headers = self.auth_headers().await?;
        let response = self
            .http
            .post(self.url(&path))
            .headers(headers)
            .json(payload)
            .send()
            .await?;
        Self::check("POST", path, response).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn auth_headers(&self) -> Result<HeaderMap, IccError> {
        self.auth.authorization().await.map_err(IccError::Other)
    }

    async fn check(
        method: &'static str,
        path: String,
        response: reqwest::Response,
    ) -> Result<String, IccError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!(status = status.as_u16(), %path, %body, "control center request failed");
            return Err(IccError::Status {
                method,
                path,
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}
