#![forbid(unsafe_code)]

use porthole_authproxy::BundledBinary;
use porthole_core::GatewayError;
use porthole_gateway::{DiscoveryClient, Gateway, GatewayConfig};
use porthole_metrics::{BackendError, MetricsBackend, QueryParams};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Serves canned discovery documents and records the URLs asked for.
struct ScriptedDiscovery {
    docs: HashMap<String, Value>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedDiscovery {
    fn new(docs: HashMap<String, Value>) -> Arc<Self> {
        Arc::new(Self { docs, calls: Mutex::new(Vec::new()) })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl DiscoveryClient for ScriptedDiscovery {
    async fn get_json(&self, url: &str) -> anyhow::Result<Value> {
        self.calls.lock().unwrap().push(url.to_string());
        match self.docs.get(url) {
            Some(doc) => Ok(doc.clone()),
            None => anyhow::bail!("404 for {url}"),
        }
    }
}

struct NoBackend;

#[async_trait::async_trait]
impl MetricsBackend for NoBackend {
    async fn fetch(&self, query: &str, _params: &QueryParams) -> Result<Value, BackendError> {
        Err(BackendError::NotFound(query.to_string()))
    }
}

fn gateway_with(discovery: Arc<ScriptedDiscovery>, test_mode: bool) -> Arc<Gateway> {
    Gateway::with_parts(
        GatewayConfig { proxy_binary: "/nonexistent".into(), metrics_url: None, test_mode },
        Arc::new(BundledBinary { path: "/nonexistent".into() }),
        discovery,
        Arc::new(NoBackend),
    )
}

#[tokio::test]
async fn core_group_base_is_trusted_without_discovery() {
    let discovery = ScriptedDiscovery::new(HashMap::new());
    let gateway = gateway_with(discovery.clone(), false);

    let entry = gateway
        .resolve_preferred_version("http://cluster", "Pod", "/api/v1/pods", &[])
        .await
        .unwrap();

    assert_eq!(entry.canonical_base, "/api/v1/pods");
    assert_eq!(entry.kind, "Pod");
    assert_eq!(entry.preferred_version, None);
    assert!(entry.namespaced);
    assert!(discovery.calls().is_empty(), "no fallbacks means no discovery round-trips");
}

#[tokio::test]
async fn fallback_bases_are_probed_in_order() {
    let mut docs = HashMap::new();
    docs.insert(
        "http://cluster/apis/apps/v1".to_string(),
        json!({ "resources": [{ "name": "deployments", "namespaced": true }] }),
    );
    docs.insert(
        "http://cluster/apis/apps".to_string(),
        json!({ "preferredVersion": { "version": "v1" } }),
    );
    let discovery = ScriptedDiscovery::new(docs);
    let gateway = gateway_with(discovery.clone(), false);

    let entry = gateway
        .resolve_preferred_version(
            "http://cluster",
            "Deployment",
            "/apis/apps/v1beta1/deployments",
            &["/apis/apps/v1/deployments".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(entry.canonical_base, "/apis/apps/v1/deployments");
    assert_eq!(entry.preferred_version.as_deref(), Some("v1"));
    assert_eq!(
        discovery.calls(),
        vec![
            "http://cluster/apis/apps/v1beta1".to_string(),
            "http://cluster/apis/apps/v1".to_string(),
            "http://cluster/apis/apps".to_string(),
        ],
        "primary first, then fallbacks, then the group document"
    );
}

#[tokio::test]
async fn unconfirmed_base_fails_resolution() {
    let discovery = ScriptedDiscovery::new(HashMap::new());
    let gateway = gateway_with(discovery, false);

    let err = gateway
        .resolve_preferred_version(
            "http://cluster",
            "Deployment",
            "/apis/apps/v1beta1/deployments",
            &["/apis/apps/v1/deployments".to_string()],
        )
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<GatewayError>(),
        Some(&GatewayError::RegistryResolutionFailure("deployments".to_string()))
    );
    assert_eq!(
        err.to_string(),
        "Can't find working API for the Kubernetes resource deployments"
    );
}

#[tokio::test]
async fn test_mode_accepts_the_unconfirmed_primary() {
    let discovery = ScriptedDiscovery::new(HashMap::new());
    let gateway = gateway_with(discovery, true);

    let entry = gateway
        .resolve_preferred_version(
            "http://cluster",
            "Deployment",
            "/apis/apps/v1beta1/deployments",
            &["/apis/apps/v1/deployments".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(entry.canonical_base, "/apis/apps/v1beta1/deployments");
    assert_eq!(entry.preferred_version, None);
}

#[tokio::test]
async fn resolved_bases_are_cached_and_aliased() {
    let mut docs = HashMap::new();
    docs.insert(
        "http://cluster/apis/apps/v1beta1".to_string(),
        json!({ "resources": [{ "name": "deployments", "namespaced": true }] }),
    );
    docs.insert(
        "http://cluster/apis/apps".to_string(),
        json!({ "preferredVersion": { "version": "v1" } }),
    );
    let discovery = ScriptedDiscovery::new(docs);
    let gateway = gateway_with(discovery.clone(), false);

    let entry = gateway
        .resolve_preferred_version(
            "http://cluster",
            "Deployment",
            "/apis/apps/v1beta1/deployments",
            &["/apis/apps/v1beta1/deployments".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(entry.canonical_base, "/apis/apps/v1beta1/deployments");
    assert_eq!(entry.preferred_version.as_deref(), Some("v1"));

    // The preferred-version base resolves to the same registration.
    let alias = gateway.registry_entry("/apis/apps/v1/deployments").unwrap();
    assert_eq!(alias.kind, "Deployment");

    let calls_after_first = discovery.calls().len();
    let again = gateway
        .resolve_preferred_version(
            "http://cluster",
            "Deployment",
            "/apis/apps/v1beta1/deployments",
            &["/apis/apps/v1beta1/deployments".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(again, entry);
    assert_eq!(discovery.calls().len(), calls_after_first, "cache hit skips discovery");
}

#[tokio::test]
async fn link_resolution_uses_registered_entries() {
    let mut docs = HashMap::new();
    docs.insert(
        "http://cluster/apis/apps/v1".to_string(),
        json!({ "resources": [{ "name": "deployments", "namespaced": true }] }),
    );
    docs.insert(
        "http://cluster/apis/apps".to_string(),
        json!({ "preferredVersion": { "version": "v1" } }),
    );
    let discovery = ScriptedDiscovery::new(docs);
    let gateway = gateway_with(discovery, false);

    gateway
        .resolve_preferred_version(
            "http://cluster",
            "Deployment",
            "/apis/apps/v1/deployments",
            &["/apis/apps/v1/deployments".to_string()],
        )
        .await
        .unwrap();

    let link = gateway.resolve_object_link(
        &porthole_path::ObjectRef {
            kind: "Deployment".to_string(),
            api_version: "apps/v1".to_string(),
            name: "nginx".to_string(),
            namespace: None,
        },
        Some("default"),
    );
    assert_eq!(link, "/apis/apps/v1/namespaces/default/deployments/nginx");
}
