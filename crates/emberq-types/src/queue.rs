//! Queue types for EmberQ
//!
//! Queue declarations, name validation and statistics.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted queue name, in bytes
pub const MAX_QUEUE_NAME_LEN: usize = 255;

/// Check that `name` is a usable queue name
///
/// Names are 1..=255 ASCII alphanumerics or `.`, `_`, `-`, `/`, and may not
/// start or end with `.` or `/`.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let well_formed = !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
        && !name.starts_with(['.', '/'])
        && !name.ends_with(['.', '/']);

    if well_formed {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// Queue declaration, as found in broker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDecl {
    /// Queue name (unique)
    pub name: String,

    /// Whether messages should survive a broker restart
    #[serde(default)]
    pub durable: bool,
}

impl QueueDecl {
    /// Create a new declaration
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            durable,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending plus in-flight messages
    pub message_count: u64,

    /// Messages waiting for a consumer
    pub pending_count: u64,

    /// Messages delivered but not yet acknowledged
    pub in_flight_count: u64,

    /// Consumers currently attached
    pub consumer_count: u64,

    /// Messages enqueued since the queue was created
    pub enqueued_total: u64,

    /// Messages acknowledged since the queue was created
    pub acknowledged_total: u64,

    /// Messages dropped because they expired
    pub expired_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["exampleQueue", "orders.eu-west", "jms/queue/a_b", "q1"] {
            assert!(validate_queue_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_names() {
        let too_long = "q".repeat(MAX_QUEUE_NAME_LEN + 1);
        for name in ["", " ", "with space", ".hidden", "trailing/", "tab\tq", "ünïcode", &too_long] {
            assert!(
                matches!(validate_queue_name(name), Err(Error::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }
}
