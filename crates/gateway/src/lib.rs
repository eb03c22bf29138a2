//! Gateway composition root.
//!
//! A [`Gateway`] owns the cluster connections, the auth-proxy supervisors,
//! the resolved API registry and the metrics executor, and wires them behind
//! the HTTP surface in [`routes`]. Transport implementations of the seams
//! (watch upstream, discovery, metrics backend) live in [`upstream`]; tests
//! inject scripted ones.

#![forbid(unsafe_code)]

pub mod routes;
pub mod upstream;

use anyhow::{bail, Result};
use porthole_authproxy::{AuthProxyProcess, BinarySource, BundledBinary, ProxyBus};
use porthole_core::{ClusterId, GatewayError, ProxyEvent, ProxyState};
use porthole_metrics::{MetricsBackend, RetryingQueryExecutor};
use porthole_path::{parse, resolve_link, ApiRegistry, ObjectRef, PathRef, RegistryEntry};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Fetches JSON discovery documents through a cluster's local proxy.
#[async_trait::async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Path of the bundled `kubectl`-compatible proxy binary.
    pub proxy_binary: PathBuf,
    /// Base URL of the metrics backend, when one is configured.
    pub metrics_url: Option<String>,
    /// Accept unconfirmed API bases instead of failing resolution hard.
    pub test_mode: bool,
}

/// One configured cluster and its (at most one) running auth proxy.
struct ClusterConnection {
    kubeconfig_path: PathBuf,
    api_url: String,
    proxy: Option<Arc<AuthProxyProcess>>,
}

pub struct Gateway {
    config: GatewayConfig,
    registry: RwLock<ApiRegistry>,
    clusters: Mutex<HashMap<ClusterId, ClusterConnection>>,
    bus: ProxyBus,
    binary: Arc<dyn BinarySource>,
    discovery: Arc<dyn DiscoveryClient>,
    executor: Arc<RetryingQueryExecutor>,
    http: reqwest::Client,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let http = reqwest::Client::new();
        let binary = Arc::new(BundledBinary { path: config.proxy_binary.clone() });
        let discovery = Arc::new(upstream::HttpDiscovery::new(http.clone()));
        let backend = Arc::new(upstream::HttpMetricsBackend::new(
            http.clone(),
            config.metrics_url.clone(),
        ));
        Self::with_parts(config, binary, discovery, backend)
    }

    /// Seam-injecting constructor; tests pass scripted implementations.
    pub fn with_parts(
        config: GatewayConfig,
        binary: Arc<dyn BinarySource>,
        discovery: Arc<dyn DiscoveryClient>,
        metrics_backend: Arc<dyn MetricsBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: RwLock::new(ApiRegistry::new()),
            clusters: Mutex::new(HashMap::new()),
            bus: ProxyBus::new(),
            binary,
            discovery,
            executor: Arc::new(RetryingQueryExecutor::new(metrics_backend)),
            http: reqwest::Client::new(),
        })
    }

    pub fn executor(&self) -> &RetryingQueryExecutor {
        &self.executor
    }

    pub fn subscribe_proxy_events(&self, cluster_id: &str) -> broadcast::Receiver<ProxyEvent> {
        self.bus.subscribe(cluster_id)
    }

    /// Start (or reuse) the auth proxy for a cluster and return its local
    /// port. A running proxy is reused; a failed start leaves the connection
    /// registered but without an active proxy.
    pub async fn start_auth_proxy(
        &self,
        cluster_id: ClusterId,
        kubeconfig_path: PathBuf,
        api_url: String,
    ) -> Result<u16> {
        let proxy = {
            let mut clusters = self.clusters.lock().expect("cluster map poisoned");
            let conn = clusters.entry(cluster_id.clone()).or_insert_with(|| ClusterConnection {
                kubeconfig_path: kubeconfig_path.clone(),
                api_url: api_url.clone(),
                proxy: None,
            });
            if let Some(existing) = &conn.proxy {
                if let (Some(port), ProxyState::Running) = (existing.port(), existing.state()) {
                    debug!(cluster = %cluster_id, port, "auth proxy already running");
                    return Ok(port);
                }
            }
            conn.kubeconfig_path = kubeconfig_path.clone();
            conn.api_url = api_url.clone();
            let proxy = Arc::new(AuthProxyProcess::new(
                cluster_id.clone(),
                kubeconfig_path,
                api_url,
                self.binary.clone(),
                self.bus.sender(&cluster_id),
            ));
            conn.proxy = Some(proxy.clone());
            proxy
        };

        match proxy.start().await {
            Ok(port) => Ok(port),
            Err(e) => {
                warn!(cluster = %cluster_id, error = %e, "auth proxy failed to start");
                // A start() that raced a stop() may have spawned; make sure
                // nothing outlives the failed attempt.
                proxy.stop();
                let mut clusters = self.clusters.lock().expect("cluster map poisoned");
                if let Some(conn) = clusters.get_mut(&cluster_id) {
                    conn.proxy = None;
                }
                Err(e)
            }
        }
    }

    /// Stop any existing proxy and start a fresh one, reusing the cluster's
    /// stored kubeconfig and API URL. This is the restart policy the proxy
    /// supervisor itself deliberately does not carry.
    pub async fn restart_auth_proxy(&self, cluster_id: &str) -> Result<u16> {
        let (kubeconfig_path, api_url) = {
            let mut clusters = self.clusters.lock().expect("cluster map poisoned");
            let conn = clusters
                .get_mut(cluster_id)
                .ok_or_else(|| GatewayError::ClusterUnknown(cluster_id.to_string()))?;
            if let Some(proxy) = conn.proxy.take() {
                proxy.stop();
            }
            (conn.kubeconfig_path.clone(), conn.api_url.clone())
        };
        self.start_auth_proxy(cluster_id.to_string(), kubeconfig_path, api_url).await
    }

    /// Stop the cluster's auth proxy if one is running.
    pub fn stop_auth_proxy(&self, cluster_id: &str) -> Result<()> {
        let mut clusters = self.clusters.lock().expect("cluster map poisoned");
        let conn = clusters
            .get_mut(cluster_id)
            .ok_or_else(|| GatewayError::ClusterUnknown(cluster_id.to_string()))?;
        if let Some(proxy) = conn.proxy.take() {
            proxy.stop();
        }
        Ok(())
    }

    pub fn proxy_state(&self, cluster_id: &str) -> Option<ProxyState> {
        let clusters = self.clusters.lock().expect("cluster map poisoned");
        clusters.get(cluster_id).and_then(|c| c.proxy.as_ref()).map(|p| p.state())
    }

    /// Local base URL of the cluster's running auth proxy.
    pub fn cluster_base_url(&self, cluster_id: &str) -> Result<String> {
        let clusters = self.clusters.lock().expect("cluster map poisoned");
        let conn = clusters
            .get(cluster_id)
            .ok_or_else(|| GatewayError::ClusterUnknown(cluster_id.to_string()))?;
        match conn.proxy.as_ref().and_then(|p| p.port()) {
            Some(port) => Ok(format!("http://127.0.0.1:{port}")),
            None => bail!("auth proxy not running for cluster {cluster_id}"),
        }
    }

    /// Relay a plain REST request through the cluster's auth proxy, passing
    /// the method, body and upstream status along untouched.
    pub async fn relay(
        &self,
        cluster_id: &str,
        method: reqwest::Method,
        path: &str,
        content_type: Option<reqwest::header::HeaderValue>,
        body: bytes::Bytes,
    ) -> Result<(u16, bytes::Bytes)> {
        let base = self.cluster_base_url(cluster_id)?;
        let mut request = self.http.request(method, format!("{base}{path}"));
        if let Some(content_type) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        let response = request.body(body).send().await?;
        let status = response.status().as_u16();
        Ok((status, response.bytes().await?))
    }

    pub fn resolve_object_link(&self, reference: &ObjectRef, parent_namespace: Option<&str>) -> String {
        let registry = self.registry.read().expect("registry poisoned");
        resolve_link(reference, parent_namespace, &registry)
    }

    pub fn registry_entry(&self, base: &str) -> Option<RegistryEntry> {
        self.registry.read().expect("registry poisoned").get(base).cloned()
    }

    /// Resolve which of the candidate API bases the cluster actually serves
    /// and register the result, including the group's preferred version.
    ///
    /// Without fallback bases the primary is trusted as-is. With fallbacks,
    /// each base in order is confirmed against the cluster's discovery
    /// document for its group/version; the first one listing the resource
    /// wins. If none confirms, resolution fails hard unless `test_mode`
    /// accepts the primary unverified.
    pub async fn resolve_preferred_version(
        &self,
        cluster_base: &str,
        kind: &str,
        primary_base: &str,
        fallback_bases: &[String],
    ) -> Result<RegistryEntry> {
        let primary = parse(primary_base)?;
        if let Some(entry) = self.registry.read().expect("registry poisoned").get(&primary.api_base())
        {
            return Ok(entry.clone());
        }

        let confirmed = if fallback_bases.is_empty() {
            Some((primary.clone(), true))
        } else {
            self.confirm_base(cluster_base, primary_base, fallback_bases).await
        };

        let (base_ref, namespaced) = match confirmed {
            Some(found) => found,
            None if self.config.test_mode => (primary.clone(), true),
            None => {
                return Err(GatewayError::RegistryResolutionFailure(
                    primary.resource.clone().unwrap_or_else(|| primary.api_base()),
                )
                .into())
            }
        };

        let preferred = self.preferred_version_of(cluster_base, &base_ref).await;
        let entry = RegistryEntry {
            canonical_base: base_ref.api_base(),
            kind: kind.to_string(),
            preferred_version: preferred,
            namespaced,
        };

        let mut registry = self.registry.write().expect("registry poisoned");
        registry.register(entry.clone());
        if let Some(version) = &entry.preferred_version {
            // Also register under the preferred-version base so links built
            // from either version hit the cache.
            let mut alias_ref = base_ref.clone();
            alias_ref.api_version = version.clone();
            let mut alias = entry.clone();
            alias.canonical_base = alias_ref.api_base();
            registry.register(alias);
        }
        info!(kind, base = %entry.canonical_base, preferred = ?entry.preferred_version, "API registered");
        Ok(entry)
    }

    /// [`resolve_preferred_version`](Self::resolve_preferred_version) against
    /// a cluster's running proxy.
    pub async fn resolve_preferred_version_for(
        &self,
        cluster_id: &str,
        kind: &str,
        primary_base: &str,
        fallback_bases: &[String],
    ) -> Result<RegistryEntry> {
        let cluster_base = self.cluster_base_url(cluster_id)?;
        self.resolve_preferred_version(&cluster_base, kind, primary_base, fallback_bases).await
    }

    async fn confirm_base(
        &self,
        cluster_base: &str,
        primary_base: &str,
        fallbacks: &[String],
    ) -> Option<(PathRef, bool)> {
        for raw in std::iter::once(primary_base).chain(fallbacks.iter().map(String::as_str)) {
            let candidate = match parse(raw) {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(base = raw, error = %e, "skipping unparsable API base");
                    continue;
                }
            };
            let resource = match &candidate.resource {
                Some(resource) => resource.clone(),
                None => continue,
            };
            let url = format!(
                "{cluster_base}{}/{}",
                candidate.api_prefix,
                candidate.api_version_with_group()
            );
            match self.discovery.get_json(&url).await {
                Ok(doc) => {
                    let listed = doc
                        .get("resources")
                        .and_then(Value::as_array)
                        .and_then(|resources| {
                            resources.iter().find(|r| {
                                r.get("name").and_then(Value::as_str) == Some(resource.as_str())
                            })
                        });
                    if let Some(found) = listed {
                        let namespaced =
                            found.get("namespaced").and_then(Value::as_bool).unwrap_or(true);
                        return Some((candidate, namespaced));
                    }
                    debug!(base = raw, "base answers but does not list the resource");
                }
                Err(e) => debug!(base = raw, error = %e, "discovery failed, trying next base"),
            }
        }
        None
    }

    async fn preferred_version_of(&self, cluster_base: &str, base: &PathRef) -> Option<String> {
        if base.api_group.is_empty() {
            // The core group publishes no preferredVersion document.
            return None;
        }
        let url = format!("{cluster_base}{}/{}", base.api_prefix, base.api_group);
        match self.discovery.get_json(&url).await {
            Ok(doc) => doc
                .get("preferredVersion")
                .and_then(|p| p.get("version"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(e) => {
                debug!(group = %base.api_group, error = %e, "no preferredVersion document");
                None
            }
        }
    }
}
