//! A single named queue
//!
//! All message state of one queue lives behind one mutex. Pending messages
//! are kept ordered by id so that redelivered messages go back to their
//! original position instead of the tail.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use emberq_types::{Error, Message, MessageId, MessageState, QueueStats, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Shared handle to a queue
pub type QueueHandle = Arc<Queue>;

/// Identifies the consumer holding an in-flight message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerTag(pub u64);

impl std::fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How long a dequeue may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Return immediately when nothing is pending
    Immediate,
    /// Block up to the given duration
    For(Duration),
    /// Block until a message arrives or the wait is cancelled
    Forever,
}

impl Wait {
    /// Millisecond timeout: 0 = no block, negative = infinite
    pub fn from_millis(timeout_ms: i64) -> Self {
        match u64::try_from(timeout_ms) {
            Ok(0) => Self::Immediate,
            Ok(ms) => Self::For(Duration::from_millis(ms)),
            Err(_) => Self::Forever,
        }
    }
}

struct InFlight {
    message: Message,
    owner: ConsumerTag,
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<MessageId, Message>,
    in_flight: HashMap<MessageId, InFlight>,
    last_id: u64,
    closed: bool,
    consumers: u64,
    enqueued_total: u64,
    acknowledged_total: u64,
    expired_total: u64,
}

impl QueueState {
    fn message_count(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }
}

/// Named FIFO message container
pub struct Queue {
    name: String,
    durable: bool,
    created_at: DateTime<Utc>,
    state: Mutex<QueueState>,
    available: Notify,
}

impl Queue {
    pub(crate) fn new(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            durable,
            created_at: Utc::now(),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Pending plus in-flight messages
    pub fn len(&self) -> usize {
        self.state.lock().message_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn closed_error(&self) -> Error {
        Error::QueueClosed(self.name.clone())
    }

    /// Append a message, assigning the next id
    pub fn enqueue(&self, mut message: Message) -> Result<MessageId> {
        let id = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(self.closed_error());
            }
            state.last_id += 1;
            let id = MessageId(state.last_id);
            message.id = id;
            message.state = MessageState::Pending;
            state.pending.insert(id, message);
            state.enqueued_total += 1;
            id
        };

        self.available.notify_waiters();
        debug!(queue = %self.name, message_id = %id, "Message enqueued");
        Ok(id)
    }

    /// Take the oldest pending message without blocking
    ///
    /// The message moves to in-flight, held by `owner` until acknowledged
    /// or released.
    pub fn try_dequeue(&self, owner: ConsumerTag) -> Result<Option<Message>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(self.closed_error());
        }

        while let Some((id, mut message)) = state.pending.pop_first() {
            if message.is_expired() {
                state.expired_total += 1;
                debug!(queue = %self.name, message_id = %id, "Skipping expired message");
                continue;
            }

            message.state = MessageState::Delivered;
            message.delivery_count += 1;
            let delivered = message.clone();
            state.in_flight.insert(id, InFlight { message, owner });

            debug!(
                queue = %self.name,
                message_id = %id,
                consumer = %owner,
                delivery_count = delivered.delivery_count,
                "Message delivered"
            );
            return Ok(Some(delivered));
        }

        Ok(None)
    }

    /// Take the oldest pending message, blocking according to `wait`
    ///
    /// `Ok(None)` means the wait elapsed with nothing to deliver.
    pub async fn dequeue(&self, owner: ConsumerTag, wait: Wait) -> Result<Option<Message>> {
        self.dequeue_or_cancel(owner, wait, std::future::pending())
            .await
    }

    /// Like [`Queue::dequeue`], but gives up with `SessionClosed` as soon as
    /// `cancel` resolves.
    pub async fn dequeue_or_cancel<C>(
        &self,
        owner: ConsumerTag,
        wait: Wait,
        cancel: C,
    ) -> Result<Option<Message>>
    where
        C: Future<Output = ()>,
    {
        let deadline = match wait {
            Wait::For(timeout) => Some(Instant::now() + timeout),
            Wait::Immediate | Wait::Forever => None,
        };
        tokio::pin!(cancel);

        loop {
            // Register interest before looking, so an enqueue between the
            // check and the await still wakes us.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_dequeue(owner)? {
                return Ok(Some(message));
            }

            match (wait, deadline) {
                (Wait::Immediate, _) => return Ok(None),
                (_, Some(deadline)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = &mut cancel => return Err(Error::SessionClosed),
                        _ = tokio::time::sleep_until(deadline) => {
                            return self.try_dequeue(owner);
                        }
                    }
                }
                (_, None) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = &mut cancel => return Err(Error::SessionClosed),
                    }
                }
            }
        }
    }

    /// Acknowledge an in-flight message held by `owner`
    pub fn acknowledge(&self, owner: ConsumerTag, id: MessageId) -> Result<()> {
        let mut state = self.state.lock();
        match state.in_flight.get(&id) {
            Some(entry) if entry.owner == owner => {
                state.in_flight.remove(&id);
                state.acknowledged_total += 1;
                debug!(queue = %self.name, message_id = %id, "Message acknowledged");
                Ok(())
            }
            _ => Err(Error::MessageNotFound(format!("{id} on {}", self.name))),
        }
    }

    /// Return every message held by `owner` to pending
    ///
    /// Runs under the queue lock, so a concurrent dequeue sees each message
    /// either in flight or pending, never both.
    pub fn release(&self, owner: ConsumerTag) -> usize {
        let released = {
            let mut state = self.state.lock();
            let ids: Vec<MessageId> = state
                .in_flight
                .iter()
                .filter(|(_, entry)| entry.owner == owner)
                .map(|(id, _)| *id)
                .collect();

            for id in &ids {
                if let Some(InFlight { mut message, .. }) = state.in_flight.remove(id) {
                    message.state = MessageState::Pending;
                    state.pending.insert(*id, message);
                }
            }
            ids.len()
        };

        if released > 0 {
            self.available.notify_waiters();
            debug!(queue = %self.name, consumer = %owner, count = released, "Messages returned for redelivery");
        }
        released
    }

    pub(crate) fn attach_consumer(&self) {
        self.state.lock().consumers += 1;
    }

    /// Detach a consumer, redelivering whatever it still holds
    pub fn detach_consumer(&self, owner: ConsumerTag) -> usize {
        {
            let mut state = self.state.lock();
            state.consumers = state.consumers.saturating_sub(1);
        }
        self.release(owner)
    }

    /// Drop all pending messages; in-flight messages are kept
    pub fn purge(&self) -> u64 {
        let mut state = self.state.lock();
        let count = state.pending.len() as u64;
        state.pending.clear();
        count
    }

    /// Drop expired pending messages
    pub fn purge_expired(&self) -> u64 {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|_, m| !m.is_expired());
        let removed = (before - state.pending.len()) as u64;
        state.expired_total += removed;
        removed
    }

    /// Close the queue if it is empty (or `force` is set)
    ///
    /// Returns the number of discarded messages. Blocked dequeues wake with
    /// `QueueClosed`.
    pub(crate) fn close(&self, force: bool) -> Result<usize> {
        let discarded = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(self.closed_error());
            }
            let count = state.message_count();
            if count > 0 && !force {
                return Err(Error::QueueNotEmpty(self.name.clone()));
            }
            state.closed = true;
            state.pending.clear();
            state.in_flight.clear();
            count
        };

        self.available.notify_waiters();
        Ok(discarded)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let pending_count = state.pending.len() as u64;
        let in_flight_count = state.in_flight.len() as u64;

        QueueStats {
            message_count: pending_count + in_flight_count,
            pending_count,
            in_flight_count,
            consumer_count: state.consumers,
            enqueued_total: state.enqueued_total,
            acknowledged_total: state.acknowledged_total,
            expired_total: state.expired_total,
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: ConsumerTag = ConsumerTag(1);

    #[test]
    fn test_wait_from_millis() {
        assert_eq!(Wait::from_millis(0), Wait::Immediate);
        assert_eq!(Wait::from_millis(250), Wait::For(Duration::from_millis(250)));
        assert_eq!(Wait::from_millis(-1), Wait::Forever);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let queue = Queue::new("q", false);
        let a = queue.enqueue(Message::text("a")).unwrap();
        let b = queue.enqueue(Message::text("b")).unwrap();
        assert_eq!(a, MessageId(1));
        assert_eq!(b, MessageId(2));
    }

    #[test]
    fn test_fifo_order() {
        let queue = Queue::new("q", false);
        for i in 0..20 {
            queue.enqueue(Message::text(format!("m{i}"))).unwrap();
        }
        for i in 0..20 {
            let msg = queue.try_dequeue(OWNER).unwrap().unwrap();
            assert_eq!(msg.body_as_str(), Some(format!("m{i}").as_str()));
            assert_eq!(msg.state, MessageState::Delivered);
        }
        assert!(queue.try_dequeue(OWNER).unwrap().is_none());
    }

    #[test]
    fn test_release_restores_original_position() {
        let queue = Queue::new("q", false);
        queue.enqueue(Message::text("first")).unwrap();
        queue.enqueue(Message::text("second")).unwrap();

        let first = queue.try_dequeue(OWNER).unwrap().unwrap();
        assert_eq!(queue.release(OWNER), 1);

        let again = queue.try_dequeue(ConsumerTag(2)).unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.delivery_count, 2);
        assert!(again.redelivered());
    }

    #[test]
    fn test_acknowledge_requires_owner() {
        let queue = Queue::new("q", false);
        queue.enqueue(Message::text("x")).unwrap();
        let msg = queue.try_dequeue(OWNER).unwrap().unwrap();

        assert!(matches!(
            queue.acknowledge(ConsumerTag(9), msg.id),
            Err(Error::MessageNotFound(_))
        ));
        queue.acknowledge(OWNER, msg.id).unwrap();
        assert!(queue.is_empty());
        assert!(matches!(
            queue.acknowledge(OWNER, msg.id),
            Err(Error::MessageNotFound(_))
        ));
        assert_eq!(queue.stats().acknowledged_total, 1);
    }

    #[test]
    fn test_expired_messages_are_skipped() {
        let queue = Queue::new("q", false);
        queue
            .enqueue(Message::text("stale").with_expiry(Utc::now() - chrono::Duration::seconds(5)))
            .unwrap();
        queue.enqueue(Message::text("live")).unwrap();

        let msg = queue.try_dequeue(OWNER).unwrap().unwrap();
        assert_eq!(msg.body_as_str(), Some("live"));
        assert_eq!(queue.stats().expired_total, 1);
    }

    #[test]
    fn test_close_refuses_non_empty_unless_forced() {
        let queue = Queue::new("q", false);
        queue.enqueue(Message::text("x")).unwrap();

        assert!(matches!(queue.close(false), Err(Error::QueueNotEmpty(_))));
        assert_eq!(queue.close(true).unwrap(), 1);
        assert!(matches!(
            queue.enqueue(Message::text("late")),
            Err(Error::QueueClosed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out() {
        let queue = Queue::new("q", false);
        let started = Instant::now();

        let result = queue
            .dequeue(OWNER, Wait::For(Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(Queue::new("q", false));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(OWNER, Wait::Forever).await })
        };

        tokio::task::yield_now().await;
        queue.enqueue(Message::text("wake")).unwrap();

        let msg = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(msg.body_as_str(), Some("wake"));
    }

    #[tokio::test]
    async fn test_cancel_wakes_blocked_dequeue() {
        let queue = Queue::new("q", false);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let cancel = async move {
            let _ = rx.await;
        };
        let (result, _) = tokio::join!(
            queue.dequeue_or_cancel(OWNER, Wait::Forever, cancel),
            async move {
                tokio::task::yield_now().await;
                let _ = tx.send(());
            }
        );

        assert!(matches!(result, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_dequeue() {
        let queue = Arc::new(Queue::new("q", false));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(OWNER, Wait::Forever).await })
        };

        tokio::task::yield_now().await;
        queue.close(true).unwrap();

        assert!(matches!(waiter.await.unwrap(), Err(Error::QueueClosed(_))));
    }
}
