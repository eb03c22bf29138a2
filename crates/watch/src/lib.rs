//! Watch stream multiplexing.
//!
//! A [`WatchSession`] turns N independent upstream watch subscriptions into
//! one ordered, rate-limited outgoing event stream. Upstream callbacks push
//! into a shared buffer and never touch the transport; a periodic flush task
//! drains the buffer and writes one `data: <JSON>\n\n` frame per event. The
//! decoupling bounds transport writes under bursts while preserving arrival
//! order within each upstream and within a flush batch.

#![forbid(unsafe_code)]

use futures::stream::BoxStream;
use porthole_core::{ClusterId, WatchEvent};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Interval at which buffered events are written to the outgoing stream.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// `(phase, object)` pairs until the upstream ends or errors.
pub type EventStream = BoxStream<'static, anyhow::Result<(String, Value)>>;

/// Seam to the upstream watch transport; tests inject mocks, production
/// drives a streaming HTTP request through the cluster's auth proxy.
#[async_trait::async_trait]
pub trait WatchUpstream: Send + Sync {
    async fn open(&self, cluster: Option<&str>, url: &str) -> anyhow::Result<EventStream>;
}

type SharedBuffer = Arc<Mutex<VecDeque<WatchEvent>>>;

/// One upstream watch subscription, owned exclusively by its session.
pub struct ApiWatcher {
    url: String,
    buffer: SharedBuffer,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    last_resource_version: Mutex<Option<String>>,
}

impl ApiWatcher {
    async fn open(
        upstream: &dyn WatchUpstream,
        cluster: Option<&str>,
        url: String,
        buffer: SharedBuffer,
    ) -> Arc<Self> {
        let watcher = Arc::new(Self {
            url,
            buffer,
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
            last_resource_version: Mutex::new(None),
        });

        match upstream.open(cluster, &watcher.url).await {
            Ok(mut stream) => {
                let this = watcher.clone();
                let handle = tokio::spawn(async move {
                    use futures::StreamExt;
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok((phase, object)) => this.ingest(phase, object),
                            Err(e) => {
                                warn!(url = %this.url, error = %e, "watch ended");
                                this.stop();
                                break;
                            }
                        }
                    }
                });
                *watcher.task.lock().expect("watcher task poisoned") = Some(handle);
            }
            Err(e) => {
                // Failure to open counts as an upstream watch error: the
                // watcher ends with its terminal frame, the session goes on.
                warn!(url = %watcher.url, error = %e, "failed to open upstream watch");
                watcher.stop();
            }
        }
        watcher
    }

    fn ingest(&self, phase: String, object: Value) {
        if let Some(rv) = object
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
        {
            *self.last_resource_version.lock().expect("rv poisoned") = Some(rv.to_string());
        }
        self.buffer
            .lock()
            .expect("event buffer poisoned")
            .push_back(WatchEvent::change(phase, object));
    }

    /// Abort the upstream and append the terminal frame. No-op if already
    /// stopped.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.task.lock().expect("watcher task poisoned").take() {
            handle.abort();
        }
        debug!(url = %self.url, resource_version = ?self.last_resource_version(), "watch aborted");
        self.buffer
            .lock()
            .expect("event buffer poisoned")
            .push_back(WatchEvent::stream_end(&self.url));
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Cursor for a resource-version-aware resync after STREAM_END.
    pub fn last_resource_version(&self) -> Option<String> {
        self.last_resource_version.lock().expect("rv poisoned").clone()
    }
}

/// Owns the watchers and the flush task for one downstream client request.
pub struct WatchSession {
    id: Uuid,
    cluster_id: Option<ClusterId>,
    watchers: Vec<Arc<ApiWatcher>>,
    stopped: AtomicBool,
    stop_notify: Arc<Notify>,
}

impl WatchSession {
    /// Open one watcher per URL and start the flush task writing frames to
    /// `out`. Dropping the receiving side stops every watcher; the session
    /// never leaks upstream subscriptions past the client.
    pub async fn start(
        upstream: Arc<dyn WatchUpstream>,
        cluster_id: Option<ClusterId>,
        urls: Vec<String>,
        out: mpsc::Sender<String>,
    ) -> Arc<Self> {
        let buffer: SharedBuffer = Arc::new(Mutex::new(VecDeque::new()));
        let mut watchers = Vec::with_capacity(urls.len());
        for url in urls {
            watchers
                .push(ApiWatcher::open(upstream.as_ref(), cluster_id.as_deref(), url, buffer.clone()).await);
        }

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            cluster_id,
            watchers: watchers.clone(),
            stopped: AtomicBool::new(false),
            stop_notify: Arc::new(Notify::new()),
        });
        info!(session = %session.id, cluster = ?session.cluster_id, watchers = watchers.len(), "watch session started");

        tokio::spawn(flush_loop(buffer, watchers, out, session.stop_notify.clone()));
        session
    }

    /// Stop every watcher and let the flush task emit the terminal frames.
    /// Safe to call multiple times and concurrently with ongoing flushes.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session = %self.id, "stopping watch session");
        for watcher in &self.watchers {
            watcher.stop();
        }
        self.stop_notify.notify_one();
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn watched_urls(&self) -> Vec<String> {
        self.watchers.iter().map(|w| w.url().to_string()).collect()
    }

    pub fn watchers(&self) -> &[Arc<ApiWatcher>] {
        &self.watchers
    }
}

async fn flush_loop(
    buffer: SharedBuffer,
    watchers: Vec<Arc<ApiWatcher>>,
    out: mpsc::Sender<String>,
    stop: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !flush_once(&buffer, &out).await {
                    debug!("watch transport closed mid-flush");
                    stop_all(&watchers);
                    break;
                }
            }
            _ = out.closed() => {
                debug!("watch client disconnected");
                stop_all(&watchers);
                break;
            }
            _ = stop.notified() => {
                // Final drain carries the STREAM_END frames out before close.
                let _ = flush_once(&buffer, &out).await;
                break;
            }
        }
    }
}

fn stop_all(watchers: &[Arc<ApiWatcher>]) {
    for watcher in watchers {
        watcher.stop();
    }
}

/// Drain the whole buffer and write one frame per event. Returns false once
/// the receiving side is gone.
async fn flush_once(buffer: &SharedBuffer, out: &mpsc::Sender<String>) -> bool {
    let drained: Vec<WatchEvent> = {
        let mut buffer = buffer.lock().expect("event buffer poisoned");
        buffer.drain(..).collect()
    };
    if drained.is_empty() {
        return true;
    }
    let count = drained.len() as u64;
    for event in drained {
        let frame = match serde_json::to_string(&event) {
            Ok(json) => format!("data: {json}\n\n"),
            Err(e) => {
                warn!(error = %e, "dropping unserializable watch event");
                continue;
            }
        };
        if out.send(frame).await.is_err() {
            return false;
        }
    }
    metrics::counter!("watch_frames_flushed_total", count);
    true
}
