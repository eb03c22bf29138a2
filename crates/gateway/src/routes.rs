//! HTTP surface: the multiplexed watch stream, the metrics batch endpoint
//! and the raw per-cluster relay.

use crate::Gateway;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use porthole_core::GatewayError;
use porthole_metrics::QueryParams;
use porthole_watch::{WatchSession, WatchUpstream};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

const WATCH_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub upstream: Arc<dyn WatchUpstream>,
}

pub fn build_router(gateway: Arc<Gateway>, upstream: Arc<dyn WatchUpstream>) -> Router {
    Router::new()
        .route("/watch", get(watch))
        .route("/metrics", post(metrics))
        .route("/clusters/{cluster_id}/k8s/{*path}", any(relay))
        .with_state(AppState { gateway, upstream })
}

/// Subscribe to the union of the requested watch URLs as one event stream.
/// Frames are written as `data: <JSON>\n\n`; the stream stays open until the
/// client disconnects, each ended watcher leaving a STREAM_END frame behind.
async fn watch(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    let apis: Vec<String> =
        params.into_iter().filter(|(key, _)| key == "api").map(|(_, value)| value).collect();
    if apis.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "message": "Empty request. Query params 'api' are not provided.",
                "example": "?api=/api/v1/pods&api=/api/v1/nodes",
            })),
        )
            .into_response();
    }
    let cluster_id =
        headers.get("x-cluster-id").and_then(|v| v.to_str().ok()).map(str::to_string);

    let (tx, rx) = mpsc::channel::<String>(WATCH_CHANNEL_CAPACITY);
    let session = WatchSession::start(state.upstream.clone(), cluster_id, apis, tx).await;
    debug!(session = %session.id(), "watch stream opened");

    let body = Body::from_stream(
        ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(Bytes::from(frame))),
    );
    match Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Body shapes accepted by the metrics endpoint; the response mirrors the
/// request shape (scalar, array, or named map).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MetricsPayload {
    Single(String),
    List(Vec<String>),
    Named(Map<String, Value>),
}

/// Named specs carry either the query string itself or an object with a
/// `query` field; anything else degrades like a failing query would.
fn query_of(spec: &Value) -> String {
    match spec {
        Value::String(query) => query.clone(),
        Value::Object(spec) => {
            spec.get("query").and_then(Value::as_str).unwrap_or_default().to_string()
        }
        _ => String::new(),
    }
}

/// Run one or many metrics queries. Never fails: unreadable payloads come
/// back as `{}` and failing queries as empty result shapes.
async fn metrics(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
    payload: Result<Json<MetricsPayload>, JsonRejection>,
) -> Json<Value> {
    let params: QueryParams = params;
    let executor = state.gateway.executor();
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => {
            debug!(error = %rejection, "unreadable metrics payload");
            return Json(json!({}));
        }
    };
    let result = match payload {
        MetricsPayload::Single(query) => executor.execute(&query, &params).await,
        MetricsPayload::List(queries) => {
            Value::Array(executor.execute_batch(&queries, &params).await)
        }
        MetricsPayload::Named(specs) => {
            let names: Vec<String> = specs.keys().cloned().collect();
            let queries: Vec<String> = specs.values().map(query_of).collect();
            let results = executor.execute_batch(&queries, &params).await;
            Value::Object(names.into_iter().zip(results).collect())
        }
    };
    Json(result)
}

/// Raw REST relay through a cluster's auth proxy, any verb.
async fn relay(
    State(state): State<AppState>,
    Path((cluster_id, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let content_type = request.headers().get(header::CONTENT_TYPE).cloned();
    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    match state.gateway.relay(&cluster_id, method, &format!("/{path}"), content_type, body).await {
        Ok((status, body)) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, body).into_response()
        }
        Err(e) => {
            let status = match e.downcast_ref::<GatewayError>() {
                Some(GatewayError::ClusterUnknown(_)) => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_GATEWAY,
            };
            (status, Json(json!({ "message": e.to_string() }))).into_response()
        }
    }
}
