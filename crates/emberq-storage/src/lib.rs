//! EmberQ Storage - Queue registry for the embedded message broker
//!
//! This crate owns queues and their messages:
//! - `QueueRegistry`: name-to-queue mapping
//! - `Queue`: per-queue FIFO storage with blocking dequeue
//!
//! Storage is in-memory; the per-queue durable flag is carried through the
//! interface for a later persistent backend.

pub mod queue;
pub mod registry;

// Re-exports
pub use queue::{ConsumerTag, Queue, QueueHandle, Wait};
pub use registry::QueueRegistry;
