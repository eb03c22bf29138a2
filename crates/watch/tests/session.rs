#![forbid(unsafe_code)]

use futures::StreamExt;
use porthole_watch::{EventStream, WatchSession, WatchUpstream};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Scripted upstream: plays the configured events for a URL, then stays
/// open until aborted. Dropping a stream counts as one abort.
struct MockUpstream {
    events: HashMap<String, Vec<(String, Value)>>,
    opens: Arc<AtomicUsize>,
    aborts: Arc<AtomicUsize>,
}

struct AbortGuard(Arc<AtomicUsize>);

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl WatchUpstream for MockUpstream {
    async fn open(&self, _cluster: Option<&str>, url: &str) -> anyhow::Result<EventStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let events = self.events.get(url).cloned().unwrap_or_default();
        let guard = AbortGuard(self.aborts.clone());
        let stream = futures::stream::iter(events.into_iter().map(Ok))
            .chain(futures::stream::pending())
            .map(move |item| {
                let _alive = &guard;
                item
            });
        Ok(stream.boxed())
    }
}

fn upstream_with(events: HashMap<String, Vec<(String, Value)>>) -> (Arc<MockUpstream>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let opens = Arc::new(AtomicUsize::new(0));
    let aborts = Arc::new(AtomicUsize::new(0));
    let upstream = Arc::new(MockUpstream { events, opens: opens.clone(), aborts: aborts.clone() });
    (upstream, opens, aborts)
}

async fn collect_until_closed(mut rx: mpsc::Receiver<String>) -> Vec<String> {
    let mut frames = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => break,
            Err(_) => panic!("timed out waiting for stream close"),
        }
    }
    frames
}

async fn wait_for(counter: &AtomicUsize, expected: usize) {
    for _ in 0..100 {
        if counter.load(Ordering::SeqCst) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(counter.load(Ordering::SeqCst), expected);
}

#[tokio::test]
async fn stopping_session_ends_every_watcher_exactly_once() {
    let urls = vec![
        "/api/v1/pods".to_string(),
        "/api/v1/nodes".to_string(),
        "/api/v1/services".to_string(),
    ];
    let (upstream, opens, aborts) = upstream_with(HashMap::new());
    let (tx, rx) = mpsc::channel(64);

    let session = WatchSession::start(upstream, None, urls.clone(), tx).await;
    assert_eq!(opens.load(Ordering::SeqCst), 3);

    session.stop();
    // Idempotent: the second stop adds nothing.
    session.stop();

    let frames = collect_until_closed(rx).await;
    assert_eq!(frames.len(), 3, "one STREAM_END per watcher, then close: {frames:?}");
    for url in &urls {
        let expected = format!("data: {{\"type\":\"STREAM_END\",\"url\":\"{url}\",\"status\":410}}\n\n");
        assert!(frames.contains(&expected), "missing terminal frame for {url}");
    }
    wait_for(&aborts, 3).await;
}

#[tokio::test]
async fn burst_of_events_flushes_in_arrival_order() {
    let mut events = HashMap::new();
    events.insert(
        "/api/v1/pods".to_string(),
        vec![
            ("ADDED".to_string(), json!({"metadata": {"name": "a", "resourceVersion": "1"}})),
            ("MODIFIED".to_string(), json!({"metadata": {"name": "a", "resourceVersion": "2"}})),
            ("DELETED".to_string(), json!({"metadata": {"name": "a", "resourceVersion": "3"}})),
        ],
    );
    let (upstream, _, _) = upstream_with(events);
    let (tx, mut rx) = mpsc::channel(64);

    let _session = WatchSession::start(upstream, None, vec!["/api/v1/pods".into()], tx).await;

    let mut phases = Vec::new();
    for _ in 0..3 {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within flush interval")
            .expect("stream open");
        let body: Value = serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        phases.push(body["type"].as_str().unwrap().to_string());
    }
    assert_eq!(phases, vec!["ADDED", "MODIFIED", "DELETED"]);
}

#[tokio::test]
async fn client_disconnect_stops_all_watchers() {
    let (upstream, _, aborts) = upstream_with(HashMap::new());
    let (tx, rx) = mpsc::channel(64);

    let _session = WatchSession::start(
        upstream,
        Some("cluster-1".into()),
        vec!["/api/v1/pods".into(), "/api/v1/nodes".into()],
        tx,
    )
    .await;

    drop(rx);
    wait_for(&aborts, 2).await;
}

#[tokio::test]
async fn failed_upstream_open_terminates_only_that_watcher() {
    // Only /api/v1/pods is scripted; the mock still opens unknown URLs, so
    // fail one by making the upstream error instead.
    struct HalfBrokenUpstream(Arc<MockUpstream>);

    #[async_trait::async_trait]
    impl WatchUpstream for HalfBrokenUpstream {
        async fn open(&self, cluster: Option<&str>, url: &str) -> anyhow::Result<EventStream> {
            if url.contains("broken") {
                anyhow::bail!("connection refused");
            }
            self.0.open(cluster, url).await
        }
    }

    let mut events = HashMap::new();
    events.insert(
        "/api/v1/pods".to_string(),
        vec![("ADDED".to_string(), json!({"metadata": {"name": "nginx"}}))],
    );
    let (inner, _, _) = upstream_with(events);
    let (tx, mut rx) = mpsc::channel(64);

    let _session = WatchSession::start(
        Arc::new(HalfBrokenUpstream(inner)),
        None,
        vec!["/api/v1/broken".into(), "/api/v1/pods".into()],
        tx,
    )
    .await;

    let mut got_stream_end = false;
    let mut got_added = false;
    for _ in 0..2 {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within flush interval")
            .expect("stream open");
        let body: Value = serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        match body["type"].as_str().unwrap() {
            "STREAM_END" => {
                assert_eq!(body["url"], "/api/v1/broken");
                assert_eq!(body["status"], 410);
                got_stream_end = true;
            }
            "ADDED" => {
                assert_eq!(body["object"]["metadata"]["name"], "nginx");
                got_added = true;
            }
            other => panic!("unexpected frame type {other}"),
        }
    }
    assert!(got_stream_end && got_added);
}

#[tokio::test]
async fn watcher_tracks_last_resource_version() {
    let mut events = HashMap::new();
    events.insert(
        "/api/v1/pods".to_string(),
        vec![
            ("ADDED".to_string(), json!({"metadata": {"name": "a", "resourceVersion": "41"}})),
            ("MODIFIED".to_string(), json!({"metadata": {"name": "a", "resourceVersion": "42"}})),
        ],
    );
    let (upstream, _, _) = upstream_with(events);
    let (tx, mut rx) = mpsc::channel(64);

    let session = WatchSession::start(upstream, None, vec!["/api/v1/pods".into()], tx).await;
    for _ in 0..2 {
        let _ = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    }
    assert_eq!(session.watched_urls(), vec!["/api/v1/pods".to_string()]);
    assert_eq!(session.watchers()[0].last_resource_version().as_deref(), Some("42"));
    session.stop();
}
