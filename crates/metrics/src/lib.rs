//! Bounded-retry query execution against a time-series backend.
//!
//! The executor's contract is "always returns a usable shape": any failure
//! degrades to `{"status": <error>, "data": {"result": []}}` so a broken
//! metrics backend shows as an empty chart, never an error dialog.

#![forbid(unsafe_code)]

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Total attempt budget, counting the initial try.
const MAX_ATTEMPTS: usize = 5;

/// Extra query-string parameters forwarded to the backend with every query.
pub type QueryParams = Vec<(String, String)>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Structurally absent resource; retrying cannot succeed.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

/// Seam to the metrics backend (Prometheus-shaped in production).
#[async_trait::async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn fetch(&self, query: &str, params: &QueryParams) -> Result<Value, BackendError>;
}

type InFlight = Shared<BoxFuture<'static, Value>>;

#[derive(Clone)]
struct InFlightEntry {
    generation: u64,
    fut: InFlight,
}

/// Executes named queries with a fixed attempt budget, linear backoff and
/// per-key coalescing of concurrent identical requests.
pub struct RetryingQueryExecutor {
    backend: Arc<dyn MetricsBackend>,
    in_flight: Mutex<HashMap<String, InFlightEntry>>,
    generations: std::sync::atomic::AtomicU64,
}

impl RetryingQueryExecutor {
    pub fn new(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend,
            in_flight: Mutex::new(HashMap::new()),
            generations: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Execute one query, returning the backend result or the degraded empty
    /// shape. Concurrent calls for the same trimmed key share one in-flight
    /// execution; a settled key is re-issued fresh on the next call.
    pub async fn execute(&self, query: &str, params: &QueryParams) -> Value {
        let key = query.trim().to_string();

        let entry = {
            let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
            match in_flight.get(&key) {
                Some(existing) => {
                    metrics::counter!("metrics_queries_coalesced_total", 1u64);
                    existing.clone()
                }
                None => {
                    let fut = run_attempts(self.backend.clone(), key.clone(), params.clone())
                        .boxed()
                        .shared();
                    let entry = InFlightEntry {
                        generation: self
                            .generations
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
                        fut,
                    };
                    in_flight.insert(key.clone(), entry.clone());
                    entry
                }
            }
        };

        let result = entry.fut.clone().await;

        // Free the key once settled; the generation guard keeps a stale
        // completion from evicting a newer execution of the same key.
        let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
        if in_flight.get(&key).is_some_and(|current| current.generation == entry.generation) {
            in_flight.remove(&key);
        }
        result
    }

    /// Execute a batch concurrently; results come back in request order
    /// regardless of completion order.
    pub async fn execute_batch(&self, queries: &[String], params: &QueryParams) -> Vec<Value> {
        join_all(queries.iter().map(|q| self.execute(q, params))).await
    }
}

/// Best-effort empty result returned instead of an error.
fn degraded(error: &BackendError) -> Value {
    json!({ "status": error.to_string(), "data": { "result": [] } })
}

async fn run_attempts(backend: Arc<dyn MetricsBackend>, key: String, params: QueryParams) -> Value {
    let mut attempt = 0;
    loop {
        metrics::counter!("metrics_query_attempts_total", 1u64);
        match backend.fetch(&key, &params).await {
            Ok(value) => return value,
            Err(err) => {
                attempt += 1;
                let not_found = matches!(err, BackendError::NotFound(_));
                if attempt >= MAX_ATTEMPTS || not_found {
                    warn!(query = %key, attempt, not_found, error = %err, "metrics query degraded to empty result");
                    return degraded(&err);
                }
                debug!(query = %key, attempt, error = %err, "metrics query attempt failed, backing off");
                // Linear backoff: 1s before the 2nd attempt, 2s before the 3rd...
                tokio::time::sleep(Duration::from_millis(attempt as u64 * 1000)).await;
            }
        }
    }
}
