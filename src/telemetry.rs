use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Events observed by the IPC bus, aggregated into [`BusStats`]
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A worker process opened a connection
    ClientConnected,
    /// A worker connection closed (cleanly or not)
    ClientDisconnected,
    /// A frame was decoded from a worker
    FrameReceived { bytes: usize },
    /// A frame could not be decoded and was dropped
    FrameRejected,
    /// A worker registered itself
    WorkerRegistered { worker_id: usize },
    /// A broadcast was queued for every connected worker
    Broadcast { recipients: usize },
    /// A log record shipped by a worker was appended to the run log
    LogShipped,
    /// A worker reported failed test files
    FailedTestsReported { count: usize },
}

/// Counters aggregated from bus events
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BusStats {
    pub connections_opened: usize,
    pub connections_closed: usize,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_rejected: u64,
    pub workers_registered: usize,
    pub highest_worker_id: usize,
    pub broadcasts_sent: u64,
    pub frames_delivered: u64,
    pub log_records: u64,
    pub failed_tests_reported: usize,
}

impl BusStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a bus event
    pub fn update(&mut self, event: &BusEvent) {
        match event {
            BusEvent::ClientConnected => {
                self.connections_opened += 1;
            }
            BusEvent::ClientDisconnected => {
                self.connections_closed += 1;
            }
            BusEvent::FrameReceived { bytes } => {
                self.frames_received += 1;
                self.bytes_received += *bytes as u64;
            }
            BusEvent::FrameRejected => {
                self.frames_rejected += 1;
            }
            BusEvent::WorkerRegistered { worker_id } => {
                self.workers_registered += 1;
                self.highest_worker_id = self.highest_worker_id.max(*worker_id);
            }
            BusEvent::Broadcast { recipients } => {
                self.broadcasts_sent += 1;
                self.frames_delivered += *recipients as u64;
            }
            BusEvent::LogShipped => {
                self.log_records += 1;
            }
            BusEvent::FailedTestsReported { count } => {
                self.failed_tests_reported += count;
            }
        }
    }

    /// Connections currently open
    pub fn active_connections(&self) -> usize {
        self.connections_opened.saturating_sub(self.connections_closed)
    }
}

/// Install the global diagnostic subscriber
///
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init_tracing(quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("e2e_conductor=warn")
    } else {
        EnvFilter::new("e2e_conductor=info")
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_aggregate_events() {
        let mut stats = BusStats::new();

        stats.update(&BusEvent::ClientConnected);
        stats.update(&BusEvent::ClientConnected);
        stats.update(&BusEvent::FrameReceived { bytes: 40 });
        stats.update(&BusEvent::FrameReceived { bytes: 60 });
        stats.update(&BusEvent::WorkerRegistered { worker_id: 3 });
        stats.update(&BusEvent::WorkerRegistered { worker_id: 1 });
        stats.update(&BusEvent::Broadcast { recipients: 2 });
        stats.update(&BusEvent::ClientDisconnected);

        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.bytes_received, 100);
        assert_eq!(stats.workers_registered, 2);
        assert_eq!(stats.highest_worker_id, 3);
        assert_eq!(stats.frames_delivered, 2);
        assert_eq!(stats.active_connections(), 1);
    }

    #[test]
    fn test_disconnect_without_connect_does_not_underflow() {
        let mut stats = BusStats::new();
        stats.update(&BusEvent::ClientDisconnected);
        assert_eq!(stats.active_connections(), 0);
    }
}
