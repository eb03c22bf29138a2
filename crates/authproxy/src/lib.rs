//! Auth proxy subprocess supervision.
//!
//! One [`AuthProxyProcess`] owns one locally-spawned `kubectl proxy`-style
//! subprocess bound to a free local port and translates its process events
//! into the small notification protocol the UI multiplexes per cluster.
//! Crash recovery is deliberately not handled here; restart policy belongs
//! to the owning cluster connection.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use porthole_core::{kube_auth_channel, ClusterId, GatewayError, ProxyEvent, ProxyState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const PORT_PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Provides the proxy binary, retrieving a bundled copy if one must first be
/// ensured. Failure here is fatal for the cluster connection's proxy start.
#[async_trait::async_trait]
pub trait BinarySource: Send + Sync {
    async fn ensure(&self) -> Result<PathBuf>;
}

/// Bundled binary at a fixed path; `ensure` just verifies it is present.
pub struct BundledBinary {
    pub path: PathBuf,
}

#[async_trait::async_trait]
impl BinarySource for BundledBinary {
    async fn ensure(&self) -> Result<PathBuf> {
        tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("proxy binary missing at {}", self.path.display()))?;
        Ok(self.path.clone())
    }
}

/// Ask the OS for a free local port.
pub async fn get_free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.context("probing for a free port")?;
    Ok(listener.local_addr()?.port())
}

/// Per-cluster broadcast channels, named `kube-auth:<clusterId>` by
/// convention so the UI can multiplex many clusters' proxy logs.
#[derive(Default)]
pub struct ProxyBus {
    channels: Mutex<HashMap<String, broadcast::Sender<ProxyEvent>>>,
}

impl ProxyBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self, cluster_id: &str) -> broadcast::Sender<ProxyEvent> {
        let mut channels = self.channels.lock().expect("proxy bus poisoned");
        channels
            .entry(kube_auth_channel(cluster_id))
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, cluster_id: &str) -> broadcast::Receiver<ProxyEvent> {
        self.sender(cluster_id).subscribe()
    }
}

/// Literal event translation; external consumers depend on these values.
pub fn translate_stdout(line: &str) -> ProxyEvent {
    if line.contains("Starting to serve on") {
        ProxyEvent::info("Authentication proxy started\n")
    } else {
        ProxyEvent::info(line)
    }
}

pub fn translate_stderr(line: &str) -> ProxyEvent {
    ProxyEvent::error(line)
}

pub fn translate_exit(code: Option<i32>) -> ProxyEvent {
    match code {
        Some(code) => ProxyEvent::exit(format!("proxy exited with code: {code}")),
        None => ProxyEvent::exit("proxy exited with code: unknown"),
    }
}

/// Supervisor for one authenticating proxy subprocess.
pub struct AuthProxyProcess {
    cluster_id: ClusterId,
    kubeconfig_path: PathBuf,
    api_url: String,
    binary: Arc<dyn BinarySource>,
    events: broadcast::Sender<ProxyEvent>,
    state: Arc<Mutex<ProxyState>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    stopped: Arc<AtomicBool>,
    port: Mutex<Option<u16>>,
}

impl AuthProxyProcess {
    pub fn new(
        cluster_id: ClusterId,
        kubeconfig_path: PathBuf,
        api_url: String,
        binary: Arc<dyn BinarySource>,
        events: broadcast::Sender<ProxyEvent>,
    ) -> Self {
        Self {
            cluster_id,
            kubeconfig_path,
            api_url,
            binary,
            events,
            state: Arc::new(Mutex::new(ProxyState::Starting)),
            stop_tx: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
            port: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ProxyState {
        self.state.lock().expect("proxy state poisoned").clone()
    }

    pub fn port(&self) -> Option<u16> {
        *self.port.lock().expect("proxy port poisoned")
    }

    /// Spawn the subprocess and resolve once its listening port answers on
    /// TCP. The wait is unbounded here; the caller enforces the timeout.
    pub async fn start(&self) -> Result<u16> {
        if self.stopped.load(Ordering::SeqCst) {
            bail!("auth proxy already stopped");
        }

        let binary = match self.binary.ensure().await {
            Ok(path) => path,
            Err(e) => {
                self.set_state(ProxyState::Failed(e.to_string()));
                return Err(GatewayError::ProxyBinaryUnavailable(e.to_string()).into());
            }
        };

        // stop() may have landed while ensure() was in flight; bail before
        // spawning anything.
        if self.stopped.load(Ordering::SeqCst) {
            bail!("auth proxy stopped during startup");
        }

        let port = get_free_port().await?;
        let mut cmd = Command::new(&binary);
        cmd.arg("proxy")
            .arg(format!("--port={port}"))
            .arg(format!("--kubeconfig={}", self.kubeconfig_path.display()))
            .arg(format!("--server={}", self.api_url))
            .arg("--accept-hosts=.*")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.set_state(ProxyState::Failed(e.to_string()));
                let _ = self.events.send(ProxyEvent::error(e.to_string()));
                return Err(e).with_context(|| format!("spawning {}", binary.display()));
            }
        };
        info!(cluster = %self.cluster_id, port, "auth proxy spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, self.events.clone(), translate_stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, self.events.clone(), translate_stderr));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop_tx.lock().expect("stop handle poisoned") = Some(stop_tx);
        tokio::spawn(monitor(
            child,
            stop_rx,
            self.events.clone(),
            self.state.clone(),
            self.cluster_id.clone(),
        ));

        // A stop() racing the handle registration above finds no handle to
        // fire, so it is on us to kill the child we just spawned.
        if self.stopped.load(Ordering::SeqCst) {
            if let Some(tx) = self.stop_tx.lock().expect("stop handle poisoned").take() {
                let _ = tx.send(());
            }
            bail!("auth proxy stopped during startup");
        }

        self.wait_until_port_used(port).await?;
        self.set_state(ProxyState::Running);
        *self.port.lock().expect("proxy port poisoned") = Some(port);
        info!(cluster = %self.cluster_id, port, "auth proxy serving");
        Ok(port)
    }

    /// Idempotent; safe to invoke multiple times or before `start` completes.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(cluster = %self.cluster_id, "stopping auth proxy");
        if let Some(tx) = self.stop_tx.lock().expect("stop handle poisoned").take() {
            let _ = tx.send(());
        }
    }

    fn set_state(&self, state: ProxyState) {
        *self.state.lock().expect("proxy state poisoned") = state;
    }

    async fn wait_until_port_used(&self, port: u16) -> Result<()> {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                bail!("auth proxy stopped during startup");
            }
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(_) => return Ok(()),
                Err(_) => tokio::time::sleep(PORT_PROBE_INTERVAL).await,
            }
        }
    }
}

async fn monitor(
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    events: broadcast::Sender<ProxyEvent>,
    state: Arc<Mutex<ProxyState>>,
    cluster_id: ClusterId,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    match status {
        Ok(status) => {
            debug!(cluster = %cluster_id, ?status, "auth proxy exited");
            *state.lock().expect("proxy state poisoned") = ProxyState::Exited(status.code());
            let _ = events.send(translate_exit(status.code()));
        }
        Err(e) => {
            warn!(cluster = %cluster_id, error = %e, "auth proxy wait failed");
            *state.lock().expect("proxy state poisoned") = ProxyState::Failed(e.to_string());
            let _ = events.send(ProxyEvent::error(e.to_string()));
        }
    }
}

async fn pump_lines<R>(
    reader: R,
    events: broadcast::Sender<ProxyEvent>,
    translate: fn(&str) -> ProxyEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = events.send(translate(&line));
    }
}
