//! Transport listener
//!
//! Accepts TCP clients and runs one [`ConnectionHandler`] task per
//! connection. Stopping first closes the accept loop, then gives open
//! connections a grace period to finish before force-closing them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use emberq_types::{ConnectionId, Error, Result};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::handler::ConnectionHandler;
use crate::manager::SessionManager;

/// Upper bound on waiting for force-closed connections to wind down
const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Listener lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Result of stopping the listener
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOutcome {
    /// Connections still open when the grace period ran out
    pub forced_connections: usize,
}

impl StopOutcome {
    pub fn forced(&self) -> bool {
        self.forced_connections > 0
    }
}

type ActiveConnections = Arc<DashMap<ConnectionId, Arc<Connection>>>;

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    force_tx: watch::Sender<bool>,
    active: ActiveConnections,
    accept_task: JoinHandle<JoinSet<()>>,
}

/// Accepts client connections over TCP
pub struct TransportListener {
    sessions: Arc<SessionManager>,
    state: RwLock<ListenerState>,
    running: Option<Running>,
}

impl TransportListener {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            state: RwLock::new(ListenerState::Stopped),
            running: None,
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.read()
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.write() = state;
    }

    /// Bound address while running (reports the real port when bound to 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Open connections accepted by this listener
    pub fn connection_count(&self) -> usize {
        self.running.as_ref().map_or(0, |r| r.active.len())
    }

    /// Bind and begin accepting connections
    pub async fn start(&mut self, bind_address: &str, port: u16) -> Result<SocketAddr> {
        if self.state() != ListenerState::Stopped {
            return Err(Error::AlreadyRunning);
        }
        self.set_state(ListenerState::Starting);

        let bound = match TcpListener::bind((bind_address, port)).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(err) => Err(err),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.set_state(ListenerState::Stopped);
                return Err(Error::Bind {
                    address: format!("{bind_address}:{port}"),
                    source,
                });
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (force_tx, force_rx) = watch::channel(false);
        let active: ActiveConnections = Arc::new(DashMap::new());

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.sessions),
            shutdown_rx,
            force_rx,
            Arc::clone(&active),
        ));

        self.running = Some(Running {
            local_addr,
            shutdown_tx,
            force_tx,
            active,
            accept_task,
        });
        self.set_state(ListenerState::Running);
        info!(address = %local_addr, "Transport listener started");
        Ok(local_addr)
    }

    /// Stop accepting, drain connections for up to `grace`, then force-close
    /// whatever is left. Stopping a stopped listener is a no-op.
    pub async fn stop(&mut self, grace: Duration) -> StopOutcome {
        let Some(running) = self.running.take() else {
            return StopOutcome::default();
        };
        self.set_state(ListenerState::Stopping);
        running.shutdown_tx.send_replace(true);

        let mut connections = match running.accept_task.await {
            Ok(connections) => connections,
            Err(err) => {
                error!(error = %err, "Accept loop terminated abnormally");
                JoinSet::new()
            }
        };

        if !connections.is_empty() {
            info!(
                connections = connections.len(),
                grace_ms = grace.as_millis() as u64,
                "Draining connections"
            );
        }
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        let mut outcome = StopOutcome::default();
        if !drained {
            outcome.forced_connections = running.active.len().max(1);
            warn!(
                connections = outcome.forced_connections,
                "Grace period expired, force-closing connections"
            );

            running.force_tx.send_replace(true);
            let stragglers: Vec<Arc<Connection>> = running
                .active
                .iter()
                .map(|c| Arc::clone(c.value()))
                .collect();
            for connection in stragglers {
                self.sessions.disconnect(&connection);
            }

            let finished = tokio::time::timeout(FORCE_CLOSE_TIMEOUT, async {
                while connections.join_next().await.is_some() {}
            })
            .await
            .is_ok();
            if !finished {
                connections.abort_all();
                while connections.join_next().await.is_some() {}
            }
        }

        self.set_state(ListenerState::Stopped);
        info!(address = %running.local_addr, "Transport listener stopped");
        outcome
    }
}

async fn accept_loop(
    listener: TcpListener,
    sessions: Arc<SessionManager>,
    mut shutdown_rx: watch::Receiver<bool>,
    force_rx: watch::Receiver<bool>,
    active: ActiveConnections,
) -> JoinSet<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!(error = %err, "Error accepting connection");
                        // Brief delay to prevent tight error loop
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                if let Err(err) = stream.set_nodelay(true) {
                    debug!(%peer, error = %err, "Failed to set TCP_NODELAY");
                }
                let connection = match sessions.connect(Some(peer)) {
                    Ok(connection) => connection,
                    Err(err) => {
                        warn!(%peer, error = %err, "Rejecting connection");
                        continue;
                    }
                };

                let id = connection.id();
                active.insert(id, Arc::clone(&connection));
                info!(connection = %id, %peer, "Accepted connection");

                let handler =
                    ConnectionHandler::new(connection, Arc::clone(&sessions), force_rx.clone());
                let active = Arc::clone(&active);
                connections.spawn(async move {
                    handler.run(stream).await;
                    active.remove(&id);
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => {
                info!("Received shutdown signal, stopping accept loop");
                break;
            }
        }
    }

    connections
}
