//! Porthole core types and errors.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier for a configured cluster connection.
pub type ClusterId = String;

/// Broadcast topic carrying one cluster's auth-proxy log events.
pub fn kube_auth_channel(cluster_id: &str) -> String {
    format!("kube-auth:{}", cluster_id)
}

/// Status code attached to the synthetic terminal watch frame, signalling
/// that the upstream watch expired and a resync may be required.
pub const WATCH_GONE_STATUS: u16 = 410;

/// One frame of an outgoing watch stream.
///
/// A single struct covers both change frames (`{"type", "object"}`) and the
/// synthetic terminal frame (`{"type": "STREAM_END", "url", "status"}`);
/// field order here is the literal key order on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl WatchEvent {
    /// A change frame relayed from an upstream watch.
    pub fn change(phase: impl Into<String>, object: Value) -> Self {
        Self { phase: phase.into(), object: Some(object), url: None, status: None }
    }

    /// The terminal frame appended when one watcher stops.
    pub fn stream_end(url: impl Into<String>) -> Self {
        Self {
            phase: "STREAM_END".into(),
            object: None,
            url: Some(url.into()),
            status: Some(WATCH_GONE_STATUS),
        }
    }
}

/// Log-level event broadcast on a cluster's `kube-auth:<id>` channel.
///
/// `error` is tri-state on the wire: stdout "serving" lines carry no `error`
/// key at all, so it is an `Option` skipped when absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyEvent {
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
}

impl ProxyEvent {
    pub fn info(data: impl Into<String>) -> Self {
        Self { data: data.into(), error: None }
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self { data: data.into(), error: Some(true) }
    }

    pub fn exit(data: impl Into<String>) -> Self {
        Self { data: data.into(), error: Some(false) }
    }
}

/// Lifecycle of one auth-proxy subprocess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProxyState {
    Starting,
    Running,
    Exited(Option<i32>),
    Failed(String),
}

/// Gateway error taxonomy.
///
/// Process and watch failures never surface here; they are converted into
/// in-band events (`ProxyEvent`, `STREAM_END` frames) because their consumers
/// are long-lived subscriptions. Metrics failures degrade to an empty result
/// shape instead of propagating.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum GatewayError {
    #[error("invalid apiPath: {0}")]
    MalformedPath(String),
    #[error("auth proxy binary unavailable: {0}")]
    ProxyBinaryUnavailable(String),
    #[error("Can't find working API for the Kubernetes resource {0}")]
    RegistryResolutionFailure(String),
    #[error("unknown cluster: {0}")]
    ClusterUnknown(ClusterId),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
