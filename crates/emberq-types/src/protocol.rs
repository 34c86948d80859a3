//! Client protocol messages
//!
//! Requests and responses exchanged over the transport listener. Framing
//! lives in `emberq-core`; this module only defines the JSON documents.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::{bytes_serde, Message, MessageId, PropertyValue};
use crate::session::{AckMode, ConnectionId, SessionId};

/// Client command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    /// Handshake; must be the first frame on a connection
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    OpenSession {
        #[serde(default)]
        ack_mode: AckMode,
    },
    CloseSession {
        session: SessionId,
    },
    CreateQueue {
        name: String,
        #[serde(default)]
        durable: bool,
    },
    DeleteQueue {
        name: String,
        #[serde(default)]
        force: bool,
    },
    Send {
        session: SessionId,
        queue: String,
        #[serde(with = "bytes_serde")]
        payload: Bytes,
        #[serde(default)]
        properties: HashMap<String, PropertyValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },
    /// `timeout_ms`: 0 returns immediately, negative waits forever
    Receive {
        session: SessionId,
        queue: String,
        timeout_ms: i64,
    },
    Ack {
        session: SessionId,
        queue: String,
        message_id: MessageId,
    },
    /// Redeliver every unacknowledged message of the session
    Recover {
        session: SessionId,
    },
    /// Close the connection and all of its sessions
    Close,
}

impl Request {
    /// Command name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "CONNECT",
            Self::OpenSession { .. } => "OPEN_SESSION",
            Self::CloseSession { .. } => "CLOSE_SESSION",
            Self::CreateQueue { .. } => "CREATE_QUEUE",
            Self::DeleteQueue { .. } => "DELETE_QUEUE",
            Self::Send { .. } => "SEND",
            Self::Receive { .. } => "RECEIVE",
            Self::Ack { .. } => "ACK",
            Self::Recover { .. } => "RECOVER",
            Self::Close => "CLOSE",
        }
    }
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    /// `RECEIVE` found no message in time
    Timeout,
    InvalidName,
    NotFound,
    QueueNotEmpty,
    QueueClosed,
    SessionClosed,
    MessageNotFound,
    Protocol,
    Internal,
}

impl Status {
    /// Numeric status code
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 0,
            Self::Timeout => 1,
            Self::InvalidName => 10,
            Self::NotFound => 11,
            Self::QueueNotEmpty => 12,
            Self::QueueClosed => 13,
            Self::SessionClosed => 14,
            Self::MessageNotFound => 15,
            Self::Protocol => 20,
            Self::Internal => 50,
        }
    }

    /// Status reported for a failed request
    pub fn of(err: &Error) -> Self {
        match err {
            Error::InvalidName(_) => Self::InvalidName,
            Error::NotFound(_) => Self::NotFound,
            Error::QueueNotEmpty(_) => Self::QueueNotEmpty,
            Error::QueueClosed(_) => Self::QueueClosed,
            Error::SessionClosed => Self::SessionClosed,
            Error::MessageNotFound(_) => Self::MessageNotFound,
            Error::Protocol(_) | Error::Serialization(_) => Self::Protocol,
            _ => Self::Internal,
        }
    }
}

/// Server reply to one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,

    /// Numeric form of `status`
    pub code: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,

    /// Delivered message, for `RECEIVE`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,

    /// Failure detail: the offending name or id, or a description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn with_status(status: Status) -> Self {
        Self {
            status,
            code: status.code(),
            connection: None,
            session: None,
            message_id: None,
            message: None,
            error: None,
        }
    }

    pub fn ok() -> Self {
        Self::with_status(Status::Ok)
    }

    pub fn timeout() -> Self {
        Self::with_status(Status::Timeout)
    }

    pub fn connected(connection: ConnectionId) -> Self {
        Self {
            connection: Some(connection),
            ..Self::ok()
        }
    }

    pub fn session(session: SessionId) -> Self {
        Self {
            session: Some(session),
            ..Self::ok()
        }
    }

    pub fn sent(message_id: MessageId) -> Self {
        Self {
            message_id: Some(message_id),
            ..Self::ok()
        }
    }

    pub fn delivered(message: Message) -> Self {
        Self {
            message_id: Some(message.id),
            message: Some(message),
            ..Self::ok()
        }
    }

    pub fn from_error(err: &Error) -> Self {
        let detail = match err {
            Error::InvalidName(s)
            | Error::NotFound(s)
            | Error::QueueNotEmpty(s)
            | Error::QueueClosed(s)
            | Error::MessageNotFound(s)
            | Error::Protocol(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            error: Some(detail),
            ..Self::with_status(Status::of(err))
        }
    }

    /// True for `OK` and `TIMEOUT`
    pub fn is_success(&self) -> bool {
        matches!(self.status, Status::Ok | Status::Timeout)
    }

    /// Turn a failure status back into the error it was produced from
    pub fn into_result(self) -> Result<Self, Error> {
        let detail = self.error.clone().unwrap_or_default();
        match self.status {
            Status::Ok | Status::Timeout => Ok(self),
            Status::InvalidName => Err(Error::InvalidName(detail)),
            Status::NotFound => Err(Error::NotFound(detail)),
            Status::QueueNotEmpty => Err(Error::QueueNotEmpty(detail)),
            Status::QueueClosed => Err(Error::QueueClosed(detail)),
            Status::SessionClosed => Err(Error::SessionClosed),
            Status::MessageNotFound => Err(Error::MessageNotFound(detail)),
            Status::Protocol => Err(Error::Protocol(detail)),
            Status::Internal => Err(Error::Protocol(format!("server error: {detail}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_names() {
        let json = serde_json::to_value(Request::OpenSession {
            ack_mode: AckMode::Manual,
        })
        .unwrap();
        assert_eq!(json["command"], "OPEN_SESSION");
        assert_eq!(json["ack_mode"], "MANUAL");

        let parsed: Request =
            serde_json::from_str(r#"{"command":"RECEIVE","session":3,"queue":"q","timeout_ms":-1}"#)
                .unwrap();
        match parsed {
            Request::Receive {
                session,
                queue,
                timeout_ms,
            } => {
                assert_eq!(session, SessionId(3));
                assert_eq!(queue, "q");
                assert_eq!(timeout_ms, -1);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_send_payload_is_base64() {
        let json = serde_json::to_value(Request::Send {
            session: SessionId(1),
            queue: "q".into(),
            payload: Bytes::from_static(b"hi"),
            properties: HashMap::new(),
            ttl_ms: None,
        })
        .unwrap();
        assert_eq!(json["payload"], "aGk=");
        assert!(json.get("ttl_ms").is_none());
    }

    #[test]
    fn test_error_response_round_trips_to_error() {
        let response = Response::from_error(&Error::NotFound("orders".into()));
        assert_eq!(response.code, 11);
        assert!(!response.is_success());
        assert!(matches!(response.into_result(), Err(Error::NotFound(name)) if name == "orders"));

        let response = Response::from_error(&Error::SessionClosed);
        assert_eq!(response.status, Status::SessionClosed);
        assert!(matches!(response.into_result(), Err(Error::SessionClosed)));
    }

    #[test]
    fn test_timeout_is_not_a_failure() {
        let response = Response::timeout();
        assert_eq!(response.code, 1);
        assert!(response.into_result().is_ok());
    }
}
