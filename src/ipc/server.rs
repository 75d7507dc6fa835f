use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::{FailedTests, IpcMessage};
use super::socket_path_for;
use crate::error::{IpcTransportError, Result};
use crate::logs::{LogLevel, LogRecord, Logger};
use crate::session::SessionState;
use crate::telemetry::{BusEvent, BusStats};

type Frame = Arc<str>;

enum ServerState {
    Unstarted,
    Listening {
        shutdown: watch::Sender<bool>,
        accept_task: JoinHandle<()>,
    },
    Disposed,
}

/// State shared between the server handle and its connection tasks
struct Hub {
    session: RwLock<SessionState>,
    logger: Logger,
    clients: RwLock<HashMap<u64, mpsc::UnboundedSender<Frame>>>,
    next_conn_id: AtomicU64,
    /// Highest registered worker index; held across the registration broadcasts
    workers: Mutex<usize>,
    failed_tests: Mutex<FailedTests>,
    stats: Mutex<BusStats>,
}

/// Primary side of the IPC bus
///
/// Lifecycle is `Unstarted -> Listening -> Disposed`. A disposed server is
/// never restarted; every run creates a fresh one.
pub struct IpcServer {
    id: String,
    socket_path: PathBuf,
    state: Mutex<ServerState>,
    hub: Arc<Hub>,
}

impl IpcServer {
    /// Server for `session`, listening at the endpoint derived from its `ipc_server_id`
    pub fn new(session: SessionState, logger: Logger) -> Self {
        let id = session.ipc_server_id.clone();
        let socket_path = socket_path_for(&id);

        Self {
            id,
            socket_path,
            state: Mutex::new(ServerState::Unstarted),
            hub: Arc::new(Hub {
                session: RwLock::new(session),
                logger: logger.category("ipc"),
                clients: RwLock::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                workers: Mutex::new(0),
                failed_tests: Mutex::new(FailedTests::default()),
                stats: Mutex::new(BusStats::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the endpoint and start accepting workers
    pub async fn start(&self) -> Result<()> {
        match &*self.state.lock() {
            ServerState::Unstarted => {}
            ServerState::Listening { .. } => return Err(IpcTransportError::AlreadyStarted.into()),
            ServerState::Disposed => return Err(IpcTransportError::Disposed.into()),
        }

        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Err(IpcTransportError::AddressInUse(self.socket_path.clone()).into());
            }
            debug!("Removing stale IPC socket {}", self.socket_path.display());
            std::fs::remove_file(&self.socket_path).map_err(IpcTransportError::from)?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                IpcTransportError::AddressInUse(self.socket_path.clone())
            } else {
                IpcTransportError::Io(e)
            }
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(Arc::clone(&self.hub), listener, shutdown_rx));

        let mut state = self.state.lock();
        if !matches!(*state, ServerState::Unstarted) {
            // Lost a race against another start or a dispose
            accept_task.abort();
            let _ = std::fs::remove_file(&self.socket_path);
            return Err(IpcTransportError::AlreadyStarted.into());
        }
        *state = ServerState::Listening {
            shutdown,
            accept_task,
        };

        info!(
            server_id = %self.id,
            socket = %self.socket_path.display(),
            "IPC server listening"
        );
        Ok(())
    }

    /// Register a worker and broadcast the session config and workers count
    ///
    /// Also used by the primary for in-process workers that never connect.
    pub fn on_register_worker(&self, worker_id: usize, log_file: Option<PathBuf>) {
        self.hub.register_worker(worker_id, log_file);
    }

    /// Send `message` to every connected worker, in send order per connection
    pub fn broadcast(&self, message: &IpcMessage) -> usize {
        self.hub.broadcast(message)
    }

    /// Append a shipped record to the primary's run log
    pub fn on_log(&self, level: LogLevel, meta: Map<String, Value>, args: Vec<Value>) {
        self.hub.log(level, meta, args);
    }

    pub fn on_failed_tests(&self, test_file_paths: Vec<String>, permanent: bool) {
        self.hub.failed_tests(test_file_paths, permanent);
    }

    /// Stop listening and drop every connection
    ///
    /// Synchronous so it can run from the emergency path. Calling it twice, or
    /// on a server that never started, does nothing.
    pub fn dispose(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ServerState::Disposed);

        if let ServerState::Listening {
            shutdown,
            accept_task,
        } = previous
        {
            let _ = shutdown.send(true);
            accept_task.abort();
            self.hub.clients.write().clear();

            if let Err(e) = std::fs::remove_file(&self.socket_path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Failed to remove IPC socket {}: {}", self.socket_path.display(), e);
            }
            info!(server_id = %self.id, "IPC server disposed");
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(*self.state.lock(), ServerState::Listening { .. })
    }

    /// Highest worker index registered so far
    pub fn workers_count(&self) -> usize {
        *self.hub.workers.lock()
    }

    pub fn failed_tests(&self) -> FailedTests {
        self.hub.failed_tests.lock().clone()
    }

    pub fn stats(&self) -> BusStats {
        self.hub.stats.lock().clone()
    }

    /// Current session state, including worker log files registered so far
    pub fn session(&self) -> SessionState {
        self.hub.session.read().clone()
    }

    /// Modify the session state broadcast to workers that register later
    pub fn update_session(&self, f: impl FnOnce(&mut SessionState)) {
        f(&mut *self.hub.session.write());
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Hub {
    fn record(&self, event: BusEvent) {
        self.stats.lock().update(&event);
    }

    fn register_worker(&self, worker_id: usize, log_file: Option<PathBuf>) {
        // Concurrent registrations must broadcast in count order
        let mut workers = self.workers.lock();
        *workers = (*workers).max(worker_id);
        let count = *workers;
        self.record(BusEvent::WorkerRegistered { worker_id });

        let session = {
            let mut session = self.session.write();
            if let Some(path) = log_file {
                session.add_worker_log_file(worker_id, path);
            }
            session.clone()
        };

        info!(worker_id, workers = count, "Worker registered");
        self.broadcast(&IpcMessage::SessionConfig { session });
        self.broadcast(&IpcMessage::WorkersCount { value: count });
    }

    fn broadcast(&self, message: &IpcMessage) -> usize {
        let frame: Frame = match message.encode() {
            Ok(frame) => frame.into(),
            Err(e) => {
                warn!("Failed to encode {} broadcast: {}", message.kind(), e);
                return 0;
            }
        };

        let mut closed = Vec::new();
        let mut delivered = 0;
        {
            let clients = self.clients.read();
            for (conn_id, tx) in clients.iter() {
                if tx.send(Arc::clone(&frame)).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*conn_id);
                }
            }
        }

        if !closed.is_empty() {
            let mut clients = self.clients.write();
            for conn_id in closed {
                clients.remove(&conn_id);
            }
        }

        self.record(BusEvent::Broadcast {
            recipients: delivered,
        });
        delivered
    }

    fn log(&self, level: LogLevel, meta: Map<String, Value>, args: Vec<Value>) {
        let record = LogRecord::from_wire(level, meta, args);
        self.logger.write_record(&record);
        self.record(BusEvent::LogShipped);
    }

    fn failed_tests(&self, test_file_paths: Vec<String>, permanent: bool) {
        let count = test_file_paths.len();
        warn!(count, permanent, "Worker reported failed tests");
        self.failed_tests.lock().record(test_file_paths, permanent);
        self.record(BusEvent::FailedTestsReported { count });
    }

    fn dispatch(&self, conn_id: u64, message: IpcMessage) {
        match message {
            IpcMessage::RegisterWorker {
                worker_id,
                log_file,
            } => self.register_worker(worker_id, log_file),
            IpcMessage::Log { level, meta, args } => self.log(level, meta, args),
            IpcMessage::ReportFailedTests {
                test_file_paths,
                permanent,
            } => self.failed_tests(test_file_paths, permanent),
            other => {
                debug!(conn_id, kind = other.kind(), "Ignoring worker-bound frame");
            }
        }
    }
}

async fn accept_loop(hub: Arc<Hub>, listener: UnixListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let hub = Arc::clone(&hub);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(hub, stream, shutdown).await;
                        });
                    }
                    Err(e) => {
                        warn!("IPC accept failed: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_connection(hub: Arc<Hub>, stream: UnixStream, mut shutdown: watch::Receiver<bool>) {
    let conn_id = hub.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let (reader, writer) = stream.into_split();

    // Registered before the first frame is read so no broadcast caused by this
    // connection's own registration can be missed
    let (tx, rx) = mpsc::unbounded_channel::<Frame>();
    hub.clients.write().insert(conn_id, tx);
    hub.record(BusEvent::ClientConnected);
    let writer_task = tokio::spawn(writer_loop(conn_id, writer, rx));

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

        match line {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match IpcMessage::decode(&line) {
                Ok(message) => {
                    hub.record(BusEvent::FrameReceived { bytes: line.len() });
                    hub.dispatch(conn_id, message);
                }
                Err(e) => {
                    hub.record(BusEvent::FrameRejected);
                    warn!(conn_id, "Dropping malformed IPC frame: {}", e);
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(conn_id, "IPC read failed: {}", e);
                break;
            }
        }
    }

    hub.clients.write().remove(&conn_id);
    hub.record(BusEvent::ClientDisconnected);
    let _ = writer_task.await;
    debug!(conn_id, "IPC connection closed");
}

async fn writer_loop(conn_id: u64, mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let send = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await
        };
        if let Err(e) = send.await {
            warn!(conn_id, "IPC write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn server_id() -> String {
        format!("test-{}", uuid::Uuid::new_v4().simple())
    }

    fn server(logger: Logger) -> IpcServer {
        IpcServer::new(SessionState::create(server_id()), logger)
    }

    struct RawClient {
        lines: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl RawClient {
        async fn connect(server: &IpcServer) -> Self {
            let stream = UnixStream::connect(server.socket_path()).await.unwrap();
            let (reader, writer) = stream.into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send(&mut self, message: &IpcMessage) {
            self.writer
                .write_all(message.encode().unwrap().as_bytes())
                .await
                .unwrap();
        }

        async fn next(&mut self) -> IpcMessage {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .expect("connection closed");
            IpcMessage::decode(&line).unwrap()
        }

        async fn next_count(&mut self) -> usize {
            loop {
                if let IpcMessage::WorkersCount { value } = self.next().await {
                    return value;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_out_of_order_registration_keeps_max_count() {
        let server = server(Logger::disabled());
        server.start().await.unwrap();

        let mut client = RawClient::connect(&server).await;
        client
            .send(&IpcMessage::RegisterWorker {
                worker_id: 3,
                log_file: None,
            })
            .await;
        assert_eq!(client.next_count().await, 3);

        server.on_register_worker(1, None);
        server.on_register_worker(2, None);

        assert_eq!(client.next_count().await, 3);
        assert_eq!(client.next_count().await, 3);
        assert_eq!(server.workers_count(), 3);
        server.dispose();
    }

    #[tokio::test]
    async fn test_registration_broadcasts_config_before_count() {
        let server = server(Logger::disabled());
        server.start().await.unwrap();

        let mut client = RawClient::connect(&server).await;
        client
            .send(&IpcMessage::RegisterWorker {
                worker_id: 1,
                log_file: Some(PathBuf::from("/tmp/worker-1.log.jsonl")),
            })
            .await;

        match client.next().await {
            IpcMessage::SessionConfig { session } => {
                assert_eq!(
                    session.worker_log_files.get(&1),
                    Some(&PathBuf::from("/tmp/worker-1.log.jsonl"))
                );
            }
            other => panic!("expected session config, got {other:?}"),
        }
        assert_eq!(client.next().await, IpcMessage::WorkersCount { value: 1 });
        assert_eq!(server.session().worker_log_files.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_never_lower_count() {
        for _ in 0..20 {
            let server = Arc::new(server(Logger::disabled()));
            server.start().await.unwrap();

            let mut client = RawClient::connect(&server).await;
            client
                .send(&IpcMessage::RegisterWorker {
                    worker_id: 1,
                    log_file: None,
                })
                .await;
            assert_eq!(client.next_count().await, 1);

            let registrations: Vec<_> = (2..=8)
                .map(|worker_id| {
                    let server = Arc::clone(&server);
                    tokio::task::spawn_blocking(move || server.on_register_worker(worker_id, None))
                })
                .collect();
            for registration in registrations {
                registration.await.unwrap();
            }

            let mut observed = Vec::new();
            for _ in 2..=8 {
                observed.push(client.next_count().await);
            }
            assert!(
                observed.windows(2).all(|pair| pair[0] <= pair[1]),
                "workers count went down: {observed:?}"
            );
            assert_eq!(observed.last(), Some(&8));
            server.dispose();
        }
    }

    #[test]
    fn test_worker_log_files_follow_worker_index() {
        let server = server(Logger::disabled());
        server.on_register_worker(2, Some(PathBuf::from("/tmp/w2.jsonl")));
        server.on_register_worker(1, Some(PathBuf::from("/tmp/w1.jsonl")));

        assert_eq!(
            server.session().merge_sources(),
            vec![PathBuf::from("/tmp/w1.jsonl"), PathBuf::from("/tmp/w2.jsonl")]
        );
    }

    #[tokio::test]
    async fn test_broadcasts_arrive_in_send_order() {
        let server = server(Logger::disabled());
        server.start().await.unwrap();

        let mut client = RawClient::connect(&server).await;
        client
            .send(&IpcMessage::RegisterWorker {
                worker_id: 1,
                log_file: None,
            })
            .await;
        assert_eq!(client.next_count().await, 1);

        for value in 10..20 {
            server.broadcast(&IpcMessage::WorkersCount { value });
        }
        for value in 10..20 {
            assert_eq!(client.next().await, IpcMessage::WorkersCount { value });
        }
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let never_started = server(Logger::disabled());
        never_started.dispose();
        never_started.dispose();

        let server = server(Logger::disabled());
        server.start().await.unwrap();
        assert!(server.socket_path().exists());

        server.dispose();
        server.dispose();
        assert!(!server.is_listening());
        assert!(!server.socket_path().exists());
    }

    #[tokio::test]
    async fn test_disposed_server_cannot_restart() {
        let server = server(Logger::disabled());
        server.dispose();

        let err = server.start().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::OrchestratorError::IpcTransport(IpcTransportError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_second_server_on_same_endpoint_fails() {
        let id = server_id();
        let first = IpcServer::new(SessionState::create(id.clone()), Logger::disabled());
        first.start().await.unwrap();

        let second = IpcServer::new(SessionState::create(id), Logger::disabled());
        let err = second.start().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::OrchestratorError::IpcTransport(IpcTransportError::AddressInUse(_))
        ));

        // The failed server must not remove the live endpoint
        drop(second);
        assert!(first.socket_path().exists());
    }

    #[tokio::test]
    async fn test_shipped_logs_are_normalized_into_run_log() {
        let dir = TempDir::new().unwrap();
        let logger = Logger::create_in(dir.path()).unwrap();
        let server = server(logger.clone());
        server.start().await.unwrap();

        let mut meta = Map::new();
        meta.insert("time".to_string(), json!("2024-05-01T10:00:00.250Z"));
        meta.insert("tid".to_string(), json!(2));

        let mut client = RawClient::connect(&server).await;
        client
            .send(&IpcMessage::Log {
                level: LogLevel::Warn,
                meta,
                args: vec![json!("device lost")],
            })
            .await;
        client
            .send(&IpcMessage::RegisterWorker {
                worker_id: 2,
                log_file: None,
            })
            .await;
        // Registration is handled after the log frame on the same connection
        client.next_count().await;
        logger.flush();

        let contents = std::fs::read_to_string(logger.file().unwrap()).unwrap();
        let record: LogRecord = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(record.level, LogLevel::Warn);
        assert_eq!(record.time.to_rfc3339(), "2024-05-01T10:00:00.250+00:00");
        assert!(!record.meta.contains_key("time"));
        assert_eq!(record.meta_u64("tid"), Some(2));
        assert_eq!(record.message(), "device lost");
        assert_eq!(server.stats().log_records, 1);
    }

    #[tokio::test]
    async fn test_failed_tests_are_tracked() {
        let server = server(Logger::disabled());
        server.start().await.unwrap();

        let mut client = RawClient::connect(&server).await;
        client
            .send(&IpcMessage::ReportFailedTests {
                test_file_paths: vec!["login.test.js".to_string()],
                permanent: false,
            })
            .await;
        client
            .send(&IpcMessage::RegisterWorker {
                worker_id: 1,
                log_file: None,
            })
            .await;
        client.next_count().await;

        let failed = server.failed_tests();
        assert_eq!(failed.test_file_paths, vec!["login.test.js"]);
        assert!(!failed.permanent);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let server = server(Logger::disabled());
        server.start().await.unwrap();

        let mut client = RawClient::connect(&server).await;
        client.writer.write_all(b"{ not json\n").await.unwrap();
        client
            .send(&IpcMessage::RegisterWorker {
                worker_id: 1,
                log_file: None,
            })
            .await;

        assert_eq!(client.next_count().await, 1);
        assert_eq!(server.stats().frames_rejected, 1);
    }
}
