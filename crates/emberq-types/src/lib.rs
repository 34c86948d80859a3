//! EmberQ Types - Core domain types for the embedded message broker
//!
//! This crate contains all shared types used across EmberQ components.

pub mod error;
pub mod message;
pub mod protocol;
pub mod queue;
pub mod session;

// Re-export commonly used types
pub use error::{Error, Result, StartupStage};
pub use message::{Message, MessageId, MessageState, PropertyValue};
pub use protocol::{Request, Response, Status};
pub use queue::{validate_queue_name, QueueDecl, QueueStats};
pub use session::{AckMode, ConnectionId, SessionId};
