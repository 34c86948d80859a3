//! Queue registry
//!
//! Owns the name-to-queue mapping. The map has its own lock, separate from
//! the per-queue locks, so lookups never wait on message traffic.
//! Storage is in-memory only: the `durable` flag is recorded but messages
//! do not outlive the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use emberq_types::{validate_queue_name, Error, Message, MessageId, QueueStats, Result};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::queue::{ConsumerTag, Queue, QueueHandle, Wait};

/// Registry of named queues
pub struct QueueRegistry {
    queues: RwLock<HashMap<String, QueueHandle>>,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl QueueRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        info!("Initializing queue registry");
        Self {
            queues: RwLock::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    // ==================== Queue Operations ====================

    /// Create a queue, or return the existing one with the same name
    ///
    /// An existing queue keeps its messages and its original durable flag.
    pub fn create_queue(&self, name: &str, durable: bool) -> Result<QueueHandle> {
        validate_queue_name(name)?;

        if let Some(queue) = self.queues.read().get(name) {
            return Ok(Arc::clone(queue));
        }

        let mut queues = self.queues.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(queue = %name, durable, "Queue created");
                Arc::new(Queue::new(name, durable))
            });
        Ok(Arc::clone(queue))
    }

    /// Look up a queue by name
    pub fn get_queue(&self, name: &str) -> Result<QueueHandle> {
        self.queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// List all queues, ordered by name
    pub fn list_queues(&self) -> Vec<QueueHandle> {
        let mut queues: Vec<QueueHandle> = self.queues.read().values().cloned().collect();
        queues.sort_by(|a, b| a.name().cmp(b.name()));
        queues
    }

    /// Delete a queue
    ///
    /// Fails with `QueueNotEmpty` while the queue holds pending or in-flight
    /// messages, unless `force` is set.
    pub fn delete_queue(&self, name: &str, force: bool) -> Result<()> {
        let mut queues = self.queues.write();
        let queue = queues
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let discarded = queue.close(force)?;
        queues.remove(name);
        info!(queue = %name, discarded, "Queue deleted");
        Ok(())
    }

    /// Get queue statistics
    pub fn queue_stats(&self, name: &str) -> Result<QueueStats> {
        Ok(self.get_queue(name)?.stats())
    }

    /// Drop all pending messages from a queue
    pub fn purge_queue(&self, name: &str) -> Result<u64> {
        let count = self.get_queue(name)?.purge();
        info!(queue = %name, count, "Queue purged");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ==================== Message Operations ====================

    /// Enqueue a message, returning its assigned id
    pub fn enqueue(&self, queue: &Queue, message: Message) -> Result<MessageId> {
        queue.enqueue(message)
    }

    /// Dequeue the oldest pending message on behalf of `owner`
    pub async fn dequeue(
        &self,
        queue: &Queue,
        owner: ConsumerTag,
        wait: Wait,
    ) -> Result<Option<Message>> {
        queue.dequeue(owner, wait).await
    }

    /// Allocate a tag for a new consumer of `queue`
    pub fn attach_consumer(&self, queue: &Queue) -> ConsumerTag {
        queue.attach_consumer();
        ConsumerTag(self.next_tag.fetch_add(1, Ordering::Relaxed))
    }

    // ==================== Maintenance ====================

    /// Drop expired pending messages from every queue
    pub fn purge_expired(&self) -> u64 {
        let total: u64 = self
            .list_queues()
            .iter()
            .map(|queue| queue.purge_expired())
            .sum();

        if total > 0 {
            debug!(count = total, "Cleaned up expired messages");
        }
        total
    }

    /// Close every queue and refuse new ones
    ///
    /// Remaining messages are discarded; blocked dequeues wake with
    /// `QueueClosed`.
    pub fn close_all(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let queues: Vec<QueueHandle> = self.queues.write().drain().map(|(_, q)| q).collect();

        let discarded: usize = queues
            .iter()
            .filter_map(|queue| queue.close(true).ok())
            .sum();
        info!(queues = queues.len(), discarded, "Queue registry closed");
        discarded
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}
