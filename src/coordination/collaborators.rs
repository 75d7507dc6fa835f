use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::RunConfig;

/// Produces the resolved run configuration at global setup
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(&self) -> Result<RunConfig>;
}

/// Resolves to a fixed, already-built configuration
#[derive(Debug, Clone, Default)]
pub struct StaticConfigResolver {
    config: RunConfig,
}

impl StaticConfigResolver {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigResolver for StaticConfigResolver {
    async fn resolve(&self) -> Result<RunConfig> {
        Ok(self.config.clone())
    }
}

/// Reads the configuration from a JSON file
#[derive(Debug, Clone)]
pub struct JsonFileConfigResolver {
    path: PathBuf,
}

impl JsonFileConfigResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigResolver for JsonFileConfigResolver {
    async fn resolve(&self) -> Result<RunConfig> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read config file {}", self.path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Malformed config file {}", self.path.display()))
    }
}

/// Environment-specific hooks around the whole run (e.g. device farm warm-up)
#[async_trait]
pub trait GlobalLifecycleHandler: Send + Sync {
    async fn global_init(&self, config: &RunConfig) -> Result<()>;

    async fn global_cleanup(&self) -> Result<()>;

    /// Best-effort cleanup from a signal handler; must not block
    fn emergency_cleanup(&self);
}

/// Lifecycle handler for environments without global hooks
#[derive(Debug, Clone, Default)]
pub struct NoopLifecycleHandler;

#[async_trait]
impl GlobalLifecycleHandler for NoopLifecycleHandler {
    async fn global_init(&self, _config: &RunConfig) -> Result<()> {
        Ok(())
    }

    async fn global_cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn emergency_cleanup(&self) {}
}

/// Always-on transport server for out-of-process automation clients
#[async_trait]
pub trait AuxiliaryServer: Send + Sync {
    /// Start listening; returns the port actually bound
    async fn open(&self) -> Result<u16>;

    /// Stop listening; idempotent and non-blocking
    fn close(&self);

    fn port(&self) -> Option<u16>;
}

pub trait AuxiliaryServerFactory: Send + Sync {
    /// A server that will listen on `port` (0 for an ephemeral port)
    fn create(&self, port: u16) -> Arc<dyn AuxiliaryServer>;
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackServerFactory;

impl AuxiliaryServerFactory for LoopbackServerFactory {
    fn create(&self, port: u16) -> Arc<dyn AuxiliaryServer> {
        Arc::new(LoopbackServer::new(port))
    }
}

struct Listening {
    port: u16,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

type Peers = Arc<RwLock<HashMap<u64, mpsc::UnboundedSender<Arc<str>>>>>;

/// Line relay on `127.0.0.1`
///
/// Every newline-terminated frame received from one peer is forwarded to all
/// other connected peers, which is all the session server needs to pair a test
/// runner with the app under test.
pub struct LoopbackServer {
    requested_port: u16,
    listening: Mutex<Option<Listening>>,
    peers: Peers,
}

impl LoopbackServer {
    pub fn new(port: u16) -> Self {
        Self {
            requested_port: port,
            listening: Mutex::new(None),
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl AuxiliaryServer for LoopbackServer {
    async fn open(&self) -> Result<u16> {
        if let Some(port) = self.port() {
            return Ok(port);
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], self.requested_port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind session server on {addr}"))?;
        let port = listener.local_addr()?.port();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_peers(listener, Arc::clone(&self.peers), shutdown_rx));
        *self.listening.lock() = Some(Listening {
            port,
            shutdown,
            accept_task,
        });

        info!(port, "Session server listening");
        Ok(port)
    }

    fn close(&self) {
        if let Some(listening) = self.listening.lock().take() {
            let _ = listening.shutdown.send(true);
            listening.accept_task.abort();
            self.peers.write().clear();
            info!(port = listening.port, "Session server closed");
        }
    }

    fn port(&self) -> Option<u16> {
        self.listening.lock().as_ref().map(|l| l.port)
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_peers(listener: TcpListener, peers: Peers, mut shutdown: watch::Receiver<bool>) {
    let next_id = AtomicU64::new(1);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, addr)) => {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        debug!(peer = %addr, "Session server peer connected");
                        tokio::spawn(relay_peer(id, stream, Arc::clone(&peers), shutdown.clone()));
                    }
                    Err(e) => warn!("Session server accept failed: {}", e),
                }
            }
        }
    }
}

async fn relay_peer(id: u64, stream: TcpStream, peers: Peers, mut shutdown: watch::Receiver<bool>) {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<str>>();
    peers.write().insert(id, tx);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            line = lines.next_line() => line,
        };

        let Ok(Some(line)) = line else {
            break;
        };
        let frame: Arc<str> = format!("{line}\n").into();
        for (peer, tx) in peers.read().iter() {
            if *peer != id {
                let _ = tx.send(Arc::clone(&frame));
            }
        }
    }

    peers.write().remove(&id);
    writer_task.abort();
}

/// Port requested by a configured session server URL; 0 when none is set
pub fn requested_port(server: Option<&str>) -> Result<u16> {
    let Some(server) = server else {
        return Ok(0);
    };

    let url = url::Url::parse(server).with_context(|| format!("Invalid session server URL '{server}'"))?;
    Ok(url.port_or_known_default().unwrap_or(0))
}
