//! Production transports behind the gateway's seams.

use crate::{DiscoveryClient, Gateway};
use anyhow::{Context, Result};
use async_stream::try_stream;
use futures::StreamExt;
use porthole_metrics::{BackendError, MetricsBackend, QueryParams};
use porthole_watch::{EventStream, WatchUpstream};
use serde_json::Value;
use std::sync::Arc;

pub struct HttpDiscovery {
    client: reqwest::Client,
}

impl HttpDiscovery {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl DiscoveryClient for HttpDiscovery {
    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("GET {url}"))?;
        Ok(response.json().await?)
    }
}

/// Streams `watch=1` NDJSON responses through the cluster's auth proxy.
pub struct ProxyWatchUpstream {
    gateway: Arc<Gateway>,
    client: reqwest::Client,
}

impl ProxyWatchUpstream {
    pub fn new(gateway: Arc<Gateway>, client: reqwest::Client) -> Self {
        Self { gateway, client }
    }
}

#[async_trait::async_trait]
impl WatchUpstream for ProxyWatchUpstream {
    async fn open(&self, cluster: Option<&str>, url: &str) -> Result<EventStream> {
        let cluster = cluster.context("watch requests must carry a cluster id")?;
        let base = self.gateway.cluster_base_url(cluster)?;
        let separator = if url.contains('?') { '&' } else { '?' };
        let full = format!("{base}{url}{separator}watch=1");
        let response = self.client.get(&full).send().await?.error_for_status()?;
        let mut chunks = response.bytes_stream();

        let stream = try_stream! {
            let mut pending: Vec<u8> = Vec::new();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk?;
                pending.extend_from_slice(&chunk);
                // One JSON event per line; a chunk boundary can fall anywhere.
                while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let event: Value = serde_json::from_str(line)?;
                    let phase = event
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("ERROR")
                        .to_string();
                    let object = event.get("object").cloned().unwrap_or(Value::Null);
                    yield (phase, object);
                }
            }
        };
        Ok(stream.boxed())
    }
}

/// Prometheus-shaped query endpoint addressed by one base URL.
pub struct HttpMetricsBackend {
    client: reqwest::Client,
    base: Option<String>,
}

impl HttpMetricsBackend {
    pub fn new(client: reqwest::Client, base: Option<String>) -> Self {
        Self { client, base }
    }
}

#[async_trait::async_trait]
impl MetricsBackend for HttpMetricsBackend {
    async fn fetch(&self, query: &str, params: &QueryParams) -> Result<Value, BackendError> {
        let base = self
            .base
            .as_deref()
            .ok_or_else(|| BackendError::NotFound("no metrics backend configured".into()))?;
        let response = self
            .client
            .get(base)
            .query(&[("query", query)])
            .query(params)
            .send()
            .await
            .map_err(|e| BackendError::Other(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(query.to_string()));
        }
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Other(format!("metrics backend answered {status}")));
        }
        response.json().await.map_err(|e| BackendError::Other(e.to_string()))
    }
}
