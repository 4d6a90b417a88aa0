// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use futures::future::BoxFuture;
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue};

/// Source of authorization headers for outbound control-center traffic.
///
/// Credentials may rotate underneath the agent at any time, so callers must
/// obtain a fresh header set for every request (HTTP and WebSocket handshake
/// alike) and must never cache the result.
pub trait AuthProvider: Send + Sync {
    fn authorization(&self) -> BoxFuture<'_, anyhow::Result<HeaderMap>>;
}

/// Fixed bearer token, for tests and local development.
pub struct StaticAuth {
    headers: HeaderMap,
}

impl StaticAuth {
    pub fn bearer(token: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
        Ok(Self { headers })
    }

    pub fn empty() -> Self {
        Self {
            headers: HeaderMap::new(),
        }
    }
}

impl AuthProvider for StaticAuth {
    fn authorization(&self) -> BoxFuture<'_, anyhow::Result<HeaderMap>> {
        Box::pin(async move { Ok(self.headers.clone()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_header() {
        let auth = StaticAuth::bearer("t0ken").unwrap();
        let headers = futures::executor::block_on(auth.authorization()).unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer t0ken");
    }
}
