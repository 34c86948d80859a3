//! Session manager
//!
//! Tracks live connections and hands out sessions, producers and consumers
//! bound to queues of the registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use emberq_storage::{QueueRegistry, Wait};
use emberq_types::{AckMode, ConnectionId, Error, Message, MessageId, Result, SessionId};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::session::{Consumer, Producer, Session};

/// Creates and tears down connections and their sessions
pub struct SessionManager {
    registry: Arc<QueueRegistry>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_session: AtomicU64,
    closed: AtomicBool,
    idle: Notify,
}

impl SessionManager {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self {
            registry,
            connections: DashMap::new(),
            next_session: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    /// The queue registry sessions operate on
    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    // ==================== Connections ====================

    /// Register a new connection
    pub fn connect(&self, peer: Option<SocketAddr>) -> Result<Arc<Connection>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }

        let connection = Arc::new(Connection::new(peer));
        self.connections
            .insert(connection.id(), Arc::clone(&connection));
        debug!(connection = %connection.id(), peer = ?peer, "Connection registered");
        Ok(connection)
    }

    /// Close a connection and every session it owns
    ///
    /// Unacknowledged deliveries of its consumers return to their queues.
    pub fn disconnect(&self, connection: &Connection) -> usize {
        self.connections.remove(&connection.id());
        let redelivered = connection.close();
        if self.connections.is_empty() {
            self.idle.notify_waiters();
        }
        redelivered
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Wait up to `timeout` for every connection to disconnect
    ///
    /// Returns true if no connections remain.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.connections.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.connections.is_empty();
            }
        }
    }

    /// Close every connection and refuse new ones
    pub fn close_all(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| *c.key()).collect();

        let mut closed = 0;
        for id in ids {
            if let Some((_, connection)) = self.connections.remove(&id) {
                connection.close();
                closed += 1;
            }
        }
        self.idle.notify_waiters();
        if closed > 0 {
            info!(connections = closed, "Closed remaining connections");
        }
        closed
    }

    // ==================== Sessions ====================

    /// Open a session on `connection`
    pub fn open_session(&self, connection: &Connection, ack_mode: AckMode) -> Result<Arc<Session>> {
        if connection.is_closed() {
            return Err(Error::SessionClosed);
        }

        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(id, connection.id(), ack_mode));
        connection.add_session(Arc::clone(&session))?;
        debug!(connection = %connection.id(), session = %id, ?ack_mode, "Session opened");
        Ok(session)
    }

    /// Close a session, returning its unacknowledged messages to pending
    pub fn close_session(&self, session: &Session) -> usize {
        if let Some(connection) = self.connections.get(&session.connection_id()) {
            connection.remove_session(session.id());
        }
        session.close()
    }

    /// Redeliver every unacknowledged message held by the session
    pub fn recover(&self, session: &Session) -> Result<usize> {
        session.recover()
    }

    // ==================== Producers / Consumers ====================

    pub fn create_producer(&self, session: &Arc<Session>, queue: &str) -> Result<Producer> {
        let queue = self.registry.get_queue(queue)?;
        session.create_producer(queue)
    }

    /// Send a message through `producer`, returning its queue-assigned id
    pub fn send(&self, producer: &Producer, message: Message) -> Result<MessageId> {
        producer.send(message)
    }

    pub fn create_consumer(&self, session: &Arc<Session>, queue: &str) -> Result<Consumer> {
        let queue = self.registry.get_queue(queue)?;
        session.create_consumer(&self.registry, queue)
    }

    /// Receive the next message, waiting according to `wait`
    ///
    /// `Ok(None)` is a timeout. A receive blocked when its session closes
    /// fails with `SessionClosed`.
    pub async fn receive(&self, consumer: &Consumer, wait: Wait) -> Result<Option<Message>> {
        consumer.receive(wait).await
    }

    /// Acknowledge a delivered message; a no-op in `Auto` mode
    pub fn acknowledge(&self, consumer: &Consumer, id: MessageId) -> Result<()> {
        consumer.acknowledge(id)
    }

    /// Detach a consumer, returning its unacknowledged messages to pending
    pub fn close_consumer(&self, consumer: &Consumer) -> usize {
        consumer.close()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
