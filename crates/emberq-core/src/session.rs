//! Sessions, producers and consumers
//!
//! A session is the scope that owns producers and consumers. Closing it
//! wakes any receive blocked on one of its consumers and hands every
//! unacknowledged delivery back to its queue.

use std::collections::HashMap;
use std::sync::Arc;

use emberq_storage::{ConsumerTag, QueueHandle, QueueRegistry, Wait};
use emberq_types::{AckMode, ConnectionId, Error, Message, MessageId, Result, SessionId};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

#[derive(Default)]
struct SessionState {
    closed: bool,
    consumers: HashMap<ConsumerTag, QueueHandle>,
}

/// Scoped context for producers and consumers on one connection
pub struct Session {
    id: SessionId,
    connection_id: ConnectionId,
    ack_mode: AckMode,
    state: Mutex<SessionState>,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn new(id: SessionId, connection_id: ConnectionId, ack_mode: AckMode) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id,
            connection_id,
            ack_mode,
            state: Mutex::new(SessionState::default()),
            closed_tx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Resolves once the session is closed
    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub(crate) fn create_producer(self: &Arc<Self>, queue: QueueHandle) -> Result<Producer> {
        self.ensure_open()?;
        debug!(session = %self.id, queue = %queue.name(), "Producer created");
        Ok(Producer {
            session: Arc::clone(self),
            queue,
        })
    }

    pub(crate) fn create_consumer(
        self: &Arc<Self>,
        registry: &QueueRegistry,
        queue: QueueHandle,
    ) -> Result<Consumer> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::SessionClosed);
        }
        let tag = registry.attach_consumer(&queue);
        state.consumers.insert(tag, Arc::clone(&queue));
        debug!(session = %self.id, queue = %queue.name(), consumer = %tag, "Consumer created");
        Ok(Consumer {
            session: Arc::clone(self),
            queue,
            tag,
        })
    }

    /// Redeliver everything this session's consumers hold unacknowledged
    pub fn recover(&self) -> Result<usize> {
        let consumers: Vec<(ConsumerTag, QueueHandle)> = {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::SessionClosed);
            }
            state
                .consumers
                .iter()
                .map(|(tag, queue)| (*tag, Arc::clone(queue)))
                .collect()
        };

        Ok(consumers
            .iter()
            .map(|(tag, queue)| queue.release(*tag))
            .sum())
    }

    /// Close the session
    ///
    /// Returns the number of messages handed back for redelivery. Closing
    /// an already closed session is a no-op.
    pub(crate) fn close(&self) -> usize {
        let consumers = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            std::mem::take(&mut state.consumers)
        };
        self.closed_tx.send_replace(true);

        let redelivered: usize = consumers
            .iter()
            .map(|(tag, queue)| queue.detach_consumer(*tag))
            .sum();
        debug!(session = %self.id, consumers = consumers.len(), redelivered, "Session closed");
        redelivered
    }

    fn remove_consumer(&self, tag: ConsumerTag) -> Option<QueueHandle> {
        self.state.lock().consumers.remove(&tag)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("ack_mode", &self.ack_mode)
            .finish_non_exhaustive()
    }
}

/// Sends messages to one queue on behalf of one session
#[derive(Debug, Clone)]
pub struct Producer {
    session: Arc<Session>,
    queue: QueueHandle,
}

impl Producer {
    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// True once the target queue has been deleted
    pub fn is_stale(&self) -> bool {
        self.queue.is_closed()
    }

    pub(crate) fn send(&self, message: Message) -> Result<MessageId> {
        self.session.ensure_open()?;
        if self.queue.is_closed() {
            return Err(Error::NotFound(self.queue.name().to_string()));
        }
        self.queue.enqueue(message)
    }
}

/// Receives messages from one queue on behalf of one session
#[derive(Debug, Clone)]
pub struct Consumer {
    session: Arc<Session>,
    queue: QueueHandle,
    tag: ConsumerTag,
}

impl Consumer {
    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn tag(&self) -> ConsumerTag {
        self.tag
    }

    /// True once the source queue has been deleted
    pub fn is_stale(&self) -> bool {
        self.queue.is_closed()
    }

    pub(crate) async fn receive(&self, wait: Wait) -> Result<Option<Message>> {
        self.session.ensure_open()?;
        if self.queue.is_closed() {
            return Err(Error::NotFound(self.queue.name().to_string()));
        }

        let received = self
            .queue
            .dequeue_or_cancel(self.tag, wait, self.session.closed())
            .await?;

        let Some(mut message) = received else {
            return Ok(None);
        };

        // The session may have closed while the delivery was in progress;
        // its release pass could have run before we took the message.
        if self.session.is_closed() {
            self.queue.release(self.tag);
            return Err(Error::SessionClosed);
        }

        if self.session.ack_mode == AckMode::Auto {
            self.queue.acknowledge(self.tag, message.id)?;
            message.state = emberq_types::MessageState::Acknowledged;
        }
        Ok(Some(message))
    }

    pub(crate) fn acknowledge(&self, id: MessageId) -> Result<()> {
        self.session.ensure_open()?;
        match self.session.ack_mode {
            AckMode::Auto => Ok(()),
            AckMode::Manual => self.queue.acknowledge(self.tag, id),
        }
    }

    pub(crate) fn close(&self) -> usize {
        match self.session.remove_consumer(self.tag) {
            Some(queue) => queue.detach_consumer(self.tag),
            None => 0,
        }
    }
}
