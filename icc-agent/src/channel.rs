// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistent control channel to the Infrastructure Control Center.
//!
//! The agent keeps one WebSocket open per pod, subscribes to the `/config`
//! topic, and dispatches whatever the control center pushes: profile
//! triggers go to the profiling controller, configuration updates go to the
//! application runtime. Any error tears the connection down and a fresh one
//! is made after the reconnect interval, with fresh auth headers.

use crate::profiling::ProfilingService;
use crate::runtime::{ProfileType, RuntimeAdapter};
use futures::{SinkExt, StreamExt};
use icc_common::auth::AuthProvider;
use icc_common::worker::Worker;
use icc_common::Endpoint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SUBSCRIBE_TOPIC: &str = "/config";

#[derive(Debug, PartialEq)]
enum ControlFrame {
    Ack,
    TriggerProfile(ProfileType),
    ConfigUpdated {
        topic: String,
        data: serde_json::Value,
    },
    Unknown(serde_json::Value),
}

fn parse_frame(text: &str) -> Option<ControlFrame> {
    let mut value: serde_json::Value = serde_json::from_str(text).ok()?;
    match value.get("command").and_then(|c| c.as_str()) {
        Some("ack") => return Some(ControlFrame::Ack),
        Some("trigger-flamegraph") => return Some(ControlFrame::TriggerProfile(ProfileType::Cpu)),
        Some("trigger-heapprofile") => {
            return Some(ControlFrame::TriggerProfile(ProfileType::Heap))
        }
        _ => {}
    }
    if value.get("type").and_then(|t| t.as_str()) == Some("config-updated") {
        let topic = value
            .get("topic")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        let data = value.get_mut("data").map(serde_json::Value::take);
        return Some(ControlFrame::ConfigUpdated {
            topic,
            data: data.unwrap_or(serde_json::Value::Null),
        });
    }
    Some(ControlFrame::Unknown(value))
}

/// The channel endpoint for one application, with the http scheme swapped
/// for its WebSocket counterpart.
pub fn websocket_url(endpoint: &Endpoint, application_id: &str) -> String {
    let base = endpoint.url.to_string();
    let base = base.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/api/updates/applications/{application_id}")
}

pub struct ControlChannel {
    url: String,
    auth: Arc<dyn AuthProvider>,
    runtime: Arc<dyn RuntimeAdapter>,
    profiling: Arc<ProfilingService>,
    reconnect_interval: Duration,
    shutdown: CancellationToken,
    is_reconnecting: AtomicBool,
}

impl ControlChannel {
    pub fn new(
        url: String,
        auth: Arc<dyn AuthProvider>,
        runtime: Arc<dyn RuntimeAdapter>,
        profiling: Arc<ProfilingService>,
        reconnect_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            url,
            auth,
            runtime,
            profiling,
            reconnect_interval,
            shutdown,
            is_reconnecting: AtomicBool::new(false),
        }
    }

    async fn connect_and_serve(&self) -> anyhow::Result<()> {
        let mut request = self.url.as_str().into_client_request()?;
        let headers = self.auth.authorization().await?;
        request.headers_mut().extend(headers);
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await?;
        debug!(url = %self.url, "control channel connected");

        let subscribe = serde_json::json!({
            "command": "subscribe",
            "topic": SUBSCRIBE_TOPIC,
        });
        ws.send(Message::Text(subscribe.to_string().into())).await?;

        // The very first frame must acknowledge the subscription.
        let first = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            frame = ws.next() => frame,
        };
        match first {
            Some(Ok(Message::Text(text))) if parse_frame(&text) == Some(ControlFrame::Ack) => {
                info!("control channel subscribed");
            }
            other => anyhow::bail!("subscription was not acknowledged: {other:?}"),
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("control channel closed by remote")
                    }
                    Some(Ok(_)) => {} // ping/pong/binary
                    Some(Err(error)) => return Err(error.into()),
                }
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        match parse_frame(text) {
            Some(ControlFrame::TriggerProfile(profile_type)) => {
                info!(profile_type = %profile_type, "profile trigger received");
                self.profiling.request_all_services(profile_type).await;
            }
            Some(ControlFrame::ConfigUpdated { topic, data }) => {
                info!(topic = %topic, "configuration update received");
                if let Err(error) = self.runtime.apply_config(data).await {
                    warn!(%error, "could not apply configuration update");
                }
            }
            Some(ControlFrame::Ack) => {}
            Some(ControlFrame::Unknown(value)) => {
                debug!(%value, "ignoring unknown control message");
            }
            None => debug!("ignoring malformed control message"),
        }
    }

    async fn reconnect_delay(&self) {
        if self.is_reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            delay_ms = self.reconnect_interval.as_millis() as u64,
            "control channel reconnecting"
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.reconnect_interval) => {}
        }
        self.is_reconnecting.store(false, Ordering::Release);
    }
}

impl Worker for ControlChannel {
    async fn run(&mut self) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            if let Err(error) = self.connect_and_serve().await {
                warn!(%error, "control channel connection failed");
            }
            if self.shutdown.is_cancelled() {
                return;
            }
            self.reconnect_delay().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlamegraphSettings;
    use crate::runtime::testing::MockRuntime;
    use crate::runtime::WorkerId;
    use icc_common::auth::StaticAuth;
    use icc_common::MutexExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_trigger_frames() {
        assert_eq!(
            parse_frame(r#"{"command": "trigger-flamegraph"}"#),
            Some(ControlFrame::TriggerProfile(ProfileType::Cpu))
        );
        assert_eq!(
            parse_frame(r#"{"command": "trigger-heapprofile"}"#),
            Some(ControlFrame::TriggerProfile(ProfileType::Heap))
        );
        assert_eq!(parse_frame(r#"{"command": "ack"}"#), Some(ControlFrame::Ack));
    }

    #[test]
    fn test_parse_config_updated_frame() {
        let frame = parse_frame(
            r#"{"type": "config-updated", "topic": "/config", "data": {"maxWorkers": 4}}"#,
        );
        match frame {
            Some(ControlFrame::ConfigUpdated { topic, data }) => {
                assert_eq!(topic, "/config");
                assert_eq!(data["maxWorkers"], 4);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_and_malformed_frames() {
        assert!(matches!(
            parse_frame(r#"{"command": "reboot-the-moon"}"#),
            Some(ControlFrame::Unknown(_))
        ));
        assert_eq!(parse_frame("not json"), None);
    }

    #[test]
    fn test_websocket_url_swaps_scheme() {
        let endpoint = Endpoint::parse("https://icc.example.com").unwrap();
        assert_eq!(
            websocket_url(&endpoint, "app-1"),
            "wss://icc.example.com/api/updates/applications/app-1"
        );
        let endpoint = Endpoint::parse("http://localhost:9090/").unwrap();
        assert_eq!(
            websocket_url(&endpoint, "app-1"),
            "ws://localhost:9090/api/updates/applications/app-1"
        );
    }

    fn channel_for(
        url: String,
        runtime: Arc<MockRuntime>,
        shutdown: CancellationToken,
    ) -> ControlChannel {
        let profiling = Arc::new(ProfilingService::new(
            runtime.clone(),
            None,
            FlamegraphSettings::default(),
            "pod-1".to_string(),
        ));
        ControlChannel::new(
            url,
            Arc::new(StaticAuth::bearer("secret").unwrap()),
            runtime,
            profiling,
            Duration::from_millis(50),
            shutdown,
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscribe_ack_and_dispatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let subscribe = ws.next().await.unwrap().unwrap();
            assert!(subscribe.to_text().unwrap().contains("subscribe"));
            ws.send(Message::Text(r#"{"command": "ack"}"#.to_string().into()))
                .await
                .unwrap();
            ws.send(Message::Text(
                r#"{"command": "trigger-flamegraph"}"#.to_string().into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(
                r#"{"type": "config-updated", "topic": "/config", "data": {"maxWorkers": 4}}"#
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
            // Hold the connection open until the client goes away.
            while ws.next().await.is_some() {}
        });

        let runtime = Arc::new(MockRuntime::new(vec![WorkerId::new("main", 0)]));
        let shutdown = CancellationToken::new();
        let mut channel = channel_for(format!("ws://{address}"), runtime.clone(), shutdown.clone());
        let client = tokio::spawn(async move { channel.run().await });

        {
            let runtime = runtime.clone();
            wait_until(move || !runtime.started.lock_or_panic().is_empty()).await;
        }
        assert_eq!(
            runtime.started.lock_or_panic()[0],
            (WorkerId::new("main", 0), ProfileType::Cpu)
        );
        {
            let runtime = runtime.clone();
            wait_until(move || !runtime.applied_configs.lock_or_panic().is_empty()).await;
        }
        assert_eq!(runtime.applied_configs.lock_or_panic()[0]["maxWorkers"], 4);

        shutdown.cancel();
        client.await.unwrap();
        server.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_ack_triggers_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection: answer the subscription with garbage.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            ws.send(Message::Text(r#"{"command": "nope"}"#.to_string().into()))
                .await
                .unwrap();
            drop(ws);

            // Second connection: behave.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            ws.send(Message::Text(r#"{"command": "ack"}"#.to_string().into()))
                .await
                .unwrap();
            ws.send(Message::Text(
                r#"{"command": "trigger-heapprofile"}"#.to_string().into(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });

        let runtime = Arc::new(MockRuntime::new(vec![WorkerId::new("main", 0)]));
        let shutdown = CancellationToken::new();
        let mut channel = channel_for(format!("ws://{address}"), runtime.clone(), shutdown.clone());
        let client = tokio::spawn(async move { channel.run().await });

        {
            let runtime = runtime.clone();
            wait_until(move || !runtime.started.lock_or_panic().is_empty()).await;
        }
        assert_eq!(
            runtime.started.lock_or_panic()[0],
            (WorkerId::new("main", 0), ProfileType::Heap)
        );

        shutdown.cancel();
        client.await.unwrap();
        server.abort();
    }
}
