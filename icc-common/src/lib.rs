// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod auth;
pub mod worker;

/// Extension trait for `Mutex` to provide a method that acquires a lock,
/// panicking if the lock is poisoned.
///
/// Avoids sprinkling `#[allow(clippy::unwrap_used)]` over every `Mutex`
/// usage in crates that deny `unwrap_used` outside of tests.
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}

pub mod header {
    #![allow(clippy::declare_interior_mutable_const)]
    use http::HeaderValue;

    pub const APPLICATION_JSON_STR: &str = "application/json";
    pub const APPLICATION_OCTET_STREAM_STR: &str = "application/octet-stream";

    pub const APPLICATION_JSON: HeaderValue = HeaderValue::from_static(APPLICATION_JSON_STR);
    pub const APPLICATION_OCTET_STREAM: HeaderValue =
        HeaderValue::from_static(APPLICATION_OCTET_STREAM_STR);
}

/// Milliseconds since the Unix epoch, as carried in every wire payload.
pub fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(serialize_with = "serialize_uri", deserialize_with = "deserialize_uri")]
    pub url: http::Uri,
    pub timeout_ms: u64,
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint {
            url: http::Uri::default(),
            timeout_ms: Self::DEFAULT_TIMEOUT,
        }
    }
}

#[derive(serde::Deserialize, serde::Serialize)]
struct SerializedUri<'a> {
    scheme: Option<Cow<'a, str>>,
    authority: Option<Cow<'a, str>>,
    path_and_query: Option<Cow<'a, str>>,
}

fn serialize_uri<S>(uri: &http::Uri, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let parts = uri.clone().into_parts();
    let uri = SerializedUri {
        scheme: parts.scheme.as_ref().map(|s| Cow::Borrowed(s.as_str())),
        authority: parts.authority.as_ref().map(|s| Cow::Borrowed(s.as_str())),
        path_and_query: parts
            .path_and_query
            .as_ref()
            .map(|s| Cow::Borrowed(s.as_str())),
    };
    uri.serialize(serializer)
}

fn deserialize_uri<'de, D>(deserializer: D) -> Result<http::Uri, D::Error>
where
    D: Deserializer<'de>,
{
    let uri = SerializedUri::deserialize(deserializer)?;
    let mut builder = http::Uri::builder();
    if let Some(v) = uri.authority {
        builder = builder.authority(v.deref());
    }
    if let Some(v) = uri.scheme {
        builder = builder.scheme(v.deref());
    }
    if let Some(v) = uri.path_and_query {
        builder = builder.path_and_query(v.deref());
    }

    builder.build().map_err(Error::custom)
}

impl Endpoint {
    /// Default value for the timeout field in milliseconds.
    pub const DEFAULT_TIMEOUT: u64 = 10_000;

    pub fn parse(url: &str) -> anyhow::Result<Endpoint> {
        Ok(Endpoint {
            url: http::Uri::from_str(url)?,
            ..Default::default()
        })
    }

    #[inline]
    pub fn from_url(url: http::Uri) -> Endpoint {
        Endpoint {
            url,
            ..Default::default()
        }
    }

    /// Set a custom timeout for this endpoint. Passing 0 keeps the default.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = if timeout_ms == 0 {
            Self::DEFAULT_TIMEOUT
        } else {
            timeout_ms
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_uri_roundtrip() {
        let endpoint = Endpoint::parse("https://icc.example.com/api").unwrap();
        let json = serde_json::to_string(&endpoint).unwrap();
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(endpoint, back);
        assert_eq!(back.url.host(), Some("icc.example.com"));
        assert_eq!(back.timeout_ms, Endpoint::DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_with_timeout_zero_keeps_default() {
        let endpoint = Endpoint::parse("http://localhost:9090")
            .unwrap()
            .with_timeout(0);
        assert_eq!(endpoint.timeout_ms, Endpoint::DEFAULT_TIMEOUT);
        let endpoint = endpoint.with_timeout(500);
        assert_eq!(endpoint.timeout_ms, 500);
    }
}
