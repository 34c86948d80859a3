//! Broker - lifecycle controller for the embedded broker
//!
//! The Broker owns the queue registry, the session manager and the
//! transport listener. It starts them in that order and tears them down in
//! reverse.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use emberq_storage::QueueRegistry;
use emberq_types::{Error, Result, StartupStage};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::BrokerConfig;
use crate::listener::TransportListener;
use crate::manager::SessionManager;

/// Started or stopped cleanly
pub const EXIT_OK: i32 = 0;
/// Any failure without a more specific code (configuration, I/O)
pub const EXIT_FAILURE: i32 = 1;
/// Listener could not bind its address
pub const EXIT_BIND_FAILURE: i32 = 2;
/// Queue registry failed to initialize
pub const EXIT_REGISTRY_FAILURE: i32 = 3;
/// Connections were force-closed after the grace period expired
pub const EXIT_FORCED_SHUTDOWN: i32 = 4;

/// How often expired messages are swept from all queues
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Process exit code for a failed broker operation
pub fn exit_code(err: &Error) -> i32 {
    match err {
        Error::Startup {
            stage: StartupStage::Listener,
            ..
        }
        | Error::Bind { .. } => EXIT_BIND_FAILURE,
        Error::Startup {
            stage: StartupStage::Registry,
            ..
        } => EXIT_REGISTRY_FAILURE,
        _ => EXIT_FAILURE,
    }
}

/// Broker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// What happened during `Broker::stop`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections that had to be force-closed after the grace period
    pub forced_connections: usize,

    /// Messages discarded when the registry closed
    pub discarded_messages: usize,
}

impl ShutdownReport {
    pub fn forced(&self) -> bool {
        self.forced_connections > 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.forced() {
            EXIT_FORCED_SHUTDOWN
        } else {
            EXIT_OK
        }
    }
}

/// Handles exposed to embedding code while the broker runs
#[derive(Clone)]
struct Handles {
    registry: Arc<QueueRegistry>,
    sessions: Arc<SessionManager>,
    local_addr: SocketAddr,
}

struct Running {
    config: BrokerConfig,
    registry: Arc<QueueRegistry>,
    sessions: Arc<SessionManager>,
    listener: TransportListener,
    maintenance: JoinHandle<()>,
}

/// Embedded message broker
pub struct Broker {
    state: RwLock<BrokerState>,
    handles: RwLock<Option<Handles>>,
    running: Mutex<Option<Running>>,
}

impl Broker {
    /// Create a stopped broker
    pub fn new() -> Self {
        Self {
            state: RwLock::new(BrokerState::Stopped),
            handles: RwLock::new(None),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BrokerState {
        *self.state.read()
    }

    fn set_state(&self, state: BrokerState) {
        *self.state.write() = state;
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handles.read().as_ref().map(|h| h.local_addr)
    }

    /// The running broker's queue registry
    pub fn registry(&self) -> Result<Arc<QueueRegistry>> {
        self.handles
            .read()
            .as_ref()
            .map(|h| Arc::clone(&h.registry))
            .ok_or(Error::NotRunning)
    }

    /// The running broker's session manager, for in-process clients
    pub fn sessions(&self) -> Result<Arc<SessionManager>> {
        self.handles
            .read()
            .as_ref()
            .map(|h| Arc::clone(&h.sessions))
            .ok_or(Error::NotRunning)
    }

    // ==================== Lifecycle ====================

    /// Start the broker: registry first, then the listener
    ///
    /// On failure nothing is left running and the error names the stage
    /// that failed.
    pub async fn start(&self, config: BrokerConfig) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.set_state(BrokerState::Starting);
        info!(
            bind_address = %config.bind_address,
            port = config.port,
            queues = config.queues.len(),
            "Starting broker"
        );

        let registry = Arc::new(QueueRegistry::new());
        for decl in &config.queues {
            if let Err(err) = registry.create_queue(&decl.name, decl.durable) {
                registry.close_all();
                self.set_state(BrokerState::Stopped);
                error!(queue = %decl.name, error = %err, "Queue registry initialization failed");
                return Err(Error::startup(StartupStage::Registry, err));
            }
        }

        let sessions = Arc::new(SessionManager::new(Arc::clone(&registry)));
        let mut listener = TransportListener::new(Arc::clone(&sessions));
        let local_addr = match listener.start(&config.bind_address, config.port).await {
            Ok(addr) => addr,
            Err(err) => {
                sessions.close_all();
                registry.close_all();
                self.set_state(BrokerState::Stopped);
                error!(error = %err, "Transport listener failed to start");
                return Err(Error::startup(StartupStage::Listener, err));
            }
        };

        let maintenance = spawn_expiry_sweep(Arc::clone(&registry));

        *self.handles.write() = Some(Handles {
            registry: Arc::clone(&registry),
            sessions: Arc::clone(&sessions),
            local_addr,
        });
        *running = Some(Running {
            config,
            registry,
            sessions,
            listener,
            maintenance,
        });
        self.set_state(BrokerState::Running);
        info!(address = %local_addr, "Broker started");

        Ok(local_addr)
    }

    /// Stop the broker: listener first, then sessions, then the registry
    ///
    /// Connections get `shutdown_grace_ms` to finish before they are
    /// force-closed. Stopping a stopped broker is a no-op.
    pub async fn stop(&self) -> ShutdownReport {
        let mut running = self.running.lock().await;
        let Some(mut current) = running.take() else {
            return ShutdownReport::default();
        };
        self.set_state(BrokerState::Stopping);
        info!("Stopping broker");

        let grace = current.config.shutdown_grace();
        let deadline = Instant::now() + grace;
        self.handles.write().take();

        let listener_outcome = current.listener.stop(grace).await;

        // In-process connections share what is left of the grace period.
        let remaining = deadline.saturating_duration_since(Instant::now());
        current.sessions.wait_idle(remaining).await;
        let in_process_forced = current.sessions.close_all();
        current.maintenance.abort();

        let report = ShutdownReport {
            forced_connections: listener_outcome.forced_connections + in_process_forced,
            discarded_messages: current.registry.close_all(),
        };
        if report.forced() {
            warn!(
                forced_connections = report.forced_connections,
                "Broker stopped after force-closing connections"
            );
        }

        self.set_state(BrokerState::Stopped);
        info!(discarded_messages = report.discarded_messages, "Broker stopped");
        report
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

fn spawn_expiry_sweep(registry: Arc<QueueRegistry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            registry.purge_expired();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberq_storage::Wait;
    use emberq_types::{AckMode, Message};

    fn test_config() -> BrokerConfig {
        BrokerConfig::default()
            .with_port(0)
            .with_queue("exampleQueue", true)
            .with_shutdown_grace(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let broker = Broker::new();
        assert_eq!(broker.state(), BrokerState::Stopped);
        assert!(matches!(broker.registry(), Err(Error::NotRunning)));

        let addr = broker.start(test_config()).await.unwrap();
        assert_eq!(broker.state(), BrokerState::Running);
        assert_eq!(broker.local_addr(), Some(addr));

        let queue = broker.registry().unwrap().get_queue("exampleQueue").unwrap();
        assert!(queue.is_durable());
        assert!(matches!(
            broker.start(test_config()).await,
            Err(Error::AlreadyRunning)
        ));

        let report = broker.stop().await;
        assert_eq!(report.exit_code(), EXIT_OK);
        assert_eq!(broker.state(), BrokerState::Stopped);
        assert!(queue.is_closed());
        assert!(broker.local_addr().is_none());

        // Idempotent
        assert_eq!(broker.stop().await, ShutdownReport::default());
    }

    #[tokio::test]
    async fn test_restart_gets_fresh_registry() {
        let broker = Broker::new();
        broker.start(test_config()).await.unwrap();
        let first = broker.registry().unwrap();
        broker.stop().await;

        broker.start(test_config()).await.unwrap();
        let second = broker.registry().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.get_queue("exampleQueue").is_ok());
        broker.stop().await;
    }

    #[tokio::test]
    async fn test_registry_failure_rolls_back() {
        let broker = Broker::new();
        let config = test_config().with_queue("not valid", false);

        let err = broker.start(config).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Startup {
                stage: StartupStage::Registry,
                ..
            }
        ));
        assert_eq!(exit_code(&err), EXIT_REGISTRY_FAILURE);
        assert_eq!(broker.state(), BrokerState::Stopped);
        assert!(broker.registry().is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_rolls_back() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let broker = Broker::new();
        let err = broker.start(test_config().with_port(port)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Startup {
                stage: StartupStage::Listener,
                ..
            }
        ));
        assert_eq!(exit_code(&err), EXIT_BIND_FAILURE);
        assert_eq!(broker.state(), BrokerState::Stopped);

        // Nothing left half-started: a later start succeeds
        drop(occupied);
        broker.start(test_config()).await.unwrap();
        broker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_blocked_in_process_receive() {
        let broker = Broker::new();
        broker.start(test_config()).await.unwrap();

        let sessions = broker.sessions().unwrap();
        let connection = sessions.connect(None).unwrap();
        let session = sessions.open_session(&connection, AckMode::Auto).unwrap();
        let consumer = sessions.create_consumer(&session, "exampleQueue").unwrap();

        let blocked = {
            let sessions = Arc::clone(&sessions);
            tokio::spawn(async move { sessions.receive(&consumer, Wait::Forever).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let report = broker.stop().await;
        assert!(started.elapsed() < Duration::from_millis(200) + Duration::from_secs(1));
        assert!(report.forced());
        assert_eq!(report.exit_code(), EXIT_FORCED_SHUTDOWN);

        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_pending_messages_are_discarded_on_stop() {
        let broker = Broker::new();
        broker.start(test_config()).await.unwrap();
        let registry = broker.registry().unwrap();
        let queue = registry.get_queue("exampleQueue").unwrap();
        registry.enqueue(&queue, Message::text("left behind")).unwrap();

        let report = broker.stop().await;
        assert_eq!(report.discarded_messages, 1);
        assert!(!report.forced());
    }
}
