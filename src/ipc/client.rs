use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::message::IpcMessage;
use super::socket_path_for;
use crate::config::{IPC_CONNECT_RETRY_INTERVAL, IPC_CONNECT_TIMEOUT};
use crate::error::{IpcTransportError, OrchestratorError, Result};
use crate::logs::LogRecord;
use crate::session::SessionState;

/// Worker side of the IPC bus
pub struct IpcClient {
    server_id: String,
    socket_path: PathBuf,
    writer: Mutex<Option<OwnedWriteHalf>>,
    session: watch::Receiver<Option<SessionState>>,
    workers_count: watch::Receiver<usize>,
    reader_task: JoinHandle<()>,
}

impl IpcClient {
    /// Connect to the primary's endpoint named `server_id`
    pub async fn connect(server_id: &str) -> Result<Self> {
        Self::connect_within(server_id, IPC_CONNECT_TIMEOUT).await
    }

    /// Connect, retrying until `timeout` while the endpoint is not yet bound
    pub async fn connect_within(server_id: &str, timeout: Duration) -> Result<Self> {
        let socket_path = socket_path_for(server_id);
        let stream = connect_with_retry(&socket_path, timeout).await?;
        let (reader, writer) = stream.into_split();

        let (session_tx, session) = watch::channel(None);
        let (count_tx, workers_count) = watch::channel(0);
        let reader_task = tokio::spawn(read_broadcasts(reader, session_tx, count_tx));

        debug!(server_id, "Connected to IPC server");
        Ok(Self {
            server_id: server_id.to_string(),
            socket_path,
            writer: Mutex::new(Some(writer)),
            session,
            workers_count,
            reader_task,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn register_worker(&self, worker_id: usize, log_file: Option<PathBuf>) -> Result<()> {
        self.send(&IpcMessage::RegisterWorker {
            worker_id,
            log_file,
        })
        .await
    }

    /// Ship a record to the primary's run log, keeping its original timestamp
    pub async fn log(&self, record: &LogRecord) -> Result<()> {
        let mut meta = record.meta.clone();
        meta.insert("time".to_string(), json!(record.time.to_rfc3339()));

        self.send(&IpcMessage::Log {
            level: record.level,
            meta,
            args: record.args.clone(),
        })
        .await
    }

    pub async fn report_failed_tests(&self, test_file_paths: Vec<String>, permanent: bool) -> Result<()> {
        self.send(&IpcMessage::ReportFailedTests {
            test_file_paths,
            permanent,
        })
        .await
    }

    /// Wait for the first session config broadcast
    pub async fn wait_for_config(&self, timeout: Duration) -> Result<SessionState> {
        let mut session = self.session.clone();
        let waited = tokio::time::timeout(timeout, session.wait_for(Option::is_some)).await;

        match waited {
            Ok(Ok(state)) => match state.as_ref() {
                Some(state) => Ok(state.clone()),
                None => Err(IpcTransportError::Closed.into()),
            },
            Ok(Err(_)) => Err(IpcTransportError::Closed.into()),
            Err(_) => Err(OrchestratorError::Configuration(format!(
                "No session config received from {} within {:?}",
                self.server_id, timeout
            ))),
        }
    }

    /// Latest session config broadcast, if any arrived
    pub fn session(&self) -> Option<SessionState> {
        self.session.borrow().clone()
    }

    /// Latest workers count broadcast by the primary
    pub fn workers_count(&self) -> usize {
        *self.workers_count.borrow()
    }

    /// Watch the workers count as broadcasts arrive
    pub fn subscribe_workers_count(&self) -> watch::Receiver<usize> {
        self.workers_count.clone()
    }

    /// Close the connection; later sends fail with `Closed`
    pub async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(e) = writer.shutdown().await
        {
            debug!("IPC shutdown failed: {}", e);
        }
        self.reader_task.abort();
    }

    async fn send(&self, message: &IpcMessage) -> Result<()> {
        let frame = message.encode()?;
        let mut writer = self.writer.lock().await;
        let Some(out) = writer.as_mut() else {
            return Err(IpcTransportError::Closed.into());
        };

        let sent = async {
            out.write_all(frame.as_bytes()).await?;
            out.flush().await
        };
        sent.await.map_err(IpcTransportError::from)?;
        Ok(())
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn connect_with_retry(socket_path: &Path, timeout: Duration) -> Result<UnixStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => {
                return Err(IpcTransportError::Connect {
                    path: socket_path.to_path_buf(),
                    source: e,
                }
                .into());
            }
            Err(e) => {
                debug!("IPC endpoint {} not ready: {}", socket_path.display(), e);
                tokio::time::sleep(IPC_CONNECT_RETRY_INTERVAL).await;
            }
        }
    }
}

async fn read_broadcasts(
    reader: OwnedReadHalf,
    session_tx: watch::Sender<Option<SessionState>>,
    count_tx: watch::Sender<usize>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("IPC read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match IpcMessage::decode(&line) {
            Ok(IpcMessage::SessionConfig { session }) => {
                session_tx.send_replace(Some(session));
            }
            Ok(IpcMessage::WorkersCount { value }) => {
                count_tx.send_replace(value);
            }
            Ok(other) => debug!(kind = other.kind(), "Ignoring primary-bound frame"),
            Err(e) => warn!("Dropping malformed IPC frame: {}", e),
        }
    }
    debug!("IPC server closed the connection");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcServer;
    use crate::logs::{LogLevel, Logger};
    use serde_json::Map;
    use tempfile::TempDir;

    fn server_id() -> String {
        format!("test-{}", uuid::Uuid::new_v4().simple())
    }

    async fn started(id: &str, logger: Logger) -> IpcServer {
        let server = IpcServer::new(SessionState::create(id), logger);
        server.start().await.unwrap();
        server
    }

    #[tokio::test]
    async fn test_register_then_receive_config() {
        let id = server_id();
        let server = started(&id, Logger::disabled()).await;

        let client = IpcClient::connect(&id).await.unwrap();
        client
            .register_worker(1, Some(PathBuf::from("/tmp/w1.log.jsonl")))
            .await
            .unwrap();

        let session = client.wait_for_config(Duration::from_secs(5)).await.unwrap();
        assert_eq!(session.ipc_server_id, id);
        assert_eq!(
            session.worker_log_files.get(&1),
            Some(&PathBuf::from("/tmp/w1.log.jsonl"))
        );

        let mut count = client.subscribe_workers_count();
        count.wait_for(|v| *v == 1).await.unwrap();
        assert_eq!(client.workers_count(), 1);
        server.dispose();
    }

    #[tokio::test]
    async fn test_every_client_sees_the_max_count() {
        let id = server_id();
        let server = started(&id, Logger::disabled()).await;

        let mut clients = Vec::new();
        for worker_id in [3, 1, 2] {
            let client = IpcClient::connect(&id).await.unwrap();
            client.register_worker(worker_id, None).await.unwrap();
            client.wait_for_config(Duration::from_secs(5)).await.unwrap();
            clients.push(client);
        }

        for client in &clients {
            let mut count = client.subscribe_workers_count();
            let seen = tokio::time::timeout(Duration::from_secs(5), count.wait_for(|v| *v == 3))
                .await
                .unwrap()
                .map(|v| *v)
                .unwrap();
            assert_eq!(seen, 3);
        }
        assert_eq!(server.workers_count(), 3);
    }

    #[tokio::test]
    async fn test_connect_to_missing_endpoint_fails() {
        let err = IpcClient::connect_within(&server_id(), Duration::from_millis(250))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            OrchestratorError::IpcTransport(IpcTransportError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_waits_for_late_server() {
        let id = server_id();
        let late = {
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                started(&id, Logger::disabled()).await
            })
        };

        let client = IpcClient::connect_within(&id, Duration::from_secs(5)).await.unwrap();
        client.register_worker(1, None).await.unwrap();
        client.wait_for_config(Duration::from_secs(5)).await.unwrap();
        late.await.unwrap().dispose();
    }

    #[tokio::test]
    async fn test_config_wait_fails_when_server_disposes() {
        let id = server_id();
        let server = started(&id, Logger::disabled()).await;
        let client = IpcClient::connect(&id).await.unwrap();

        // Give the server a moment to accept before tearing it down
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.dispose();

        let err = client
            .wait_for_config(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::IpcTransport(IpcTransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_send_after_disconnect_is_closed() {
        let id = server_id();
        let _server = started(&id, Logger::disabled()).await;
        let client = IpcClient::connect(&id).await.unwrap();

        client.disconnect().await;
        let err = client.register_worker(1, None).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::IpcTransport(IpcTransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_shipped_record_keeps_its_time() {
        let dir = TempDir::new().unwrap();
        let logger = Logger::create_in(dir.path()).unwrap();
        let id = server_id();
        let server = started(&id, logger.clone()).await;

        let client = IpcClient::connect(&id).await.unwrap();
        let mut meta = Map::new();
        meta.insert("tid".to_string(), json!(1));
        let record = LogRecord::new(LogLevel::Error, meta, vec![json!("crashed")]);

        client.log(&record).await.unwrap();
        client
            .report_failed_tests(vec!["a.test.js".into()], true)
            .await
            .unwrap();
        client.register_worker(1, None).await.unwrap();
        client.wait_for_config(Duration::from_secs(5)).await.unwrap();
        logger.flush();

        let contents = std::fs::read_to_string(logger.file().unwrap()).unwrap();
        let shipped: LogRecord = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(shipped.time, record.time);
        assert_eq!(shipped.message(), "crashed");
        assert!(server.failed_tests().permanent);
    }
}
