//! Minimal TCP client for the broker protocol
//!
//! One request in flight at a time; every call waits for its response.

use std::net::SocketAddr;
use std::time::Duration;

use emberq_types::{
    AckMode, ConnectionId, Error, Message, MessageId, Request, Response, Result, SessionId, Status,
};
use tokio::net::TcpStream;
use tracing::debug;

use crate::codec::FramedStream;

/// A connected protocol client
pub struct Client {
    framed: FramedStream<TcpStream>,
    connection: ConnectionId,
}

impl Client {
    /// Open a TCP connection and perform the `CONNECT` handshake
    pub async fn connect(addr: SocketAddr, client_id: Option<&str>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut framed = FramedStream::new(stream);

        let response = call(
            &mut framed,
            &Request::Connect {
                client_id: client_id.map(str::to_string),
            },
        )
        .await?;
        let connection = response
            .connection
            .ok_or_else(|| Error::Protocol("CONNECT response without connection id".into()))?;
        debug!(%connection, %addr, "Client connected");

        Ok(Self { framed, connection })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        call(&mut self.framed, &request).await
    }

    pub async fn open_session(&mut self, ack_mode: AckMode) -> Result<SessionId> {
        self.call(Request::OpenSession { ack_mode })
            .await?
            .session
            .ok_or_else(|| Error::Protocol("OPEN_SESSION response without session id".into()))
    }

    pub async fn close_session(&mut self, session: SessionId) -> Result<()> {
        self.call(Request::CloseSession { session }).await?;
        Ok(())
    }

    pub async fn create_queue(&mut self, name: &str, durable: bool) -> Result<()> {
        self.call(Request::CreateQueue {
            name: name.to_string(),
            durable,
        })
        .await?;
        Ok(())
    }

    pub async fn delete_queue(&mut self, name: &str, force: bool) -> Result<()> {
        self.call(Request::DeleteQueue {
            name: name.to_string(),
            force,
        })
        .await?;
        Ok(())
    }

    /// Send `message` to `queue`; only its body, properties and expiry travel
    pub async fn send(
        &mut self,
        session: SessionId,
        queue: &str,
        message: Message,
    ) -> Result<MessageId> {
        let ttl_ms = message.expires_at.map(|at| {
            (at - chrono::Utc::now()).num_milliseconds().max(1) as u64
        });
        self.call(Request::Send {
            session,
            queue: queue.to_string(),
            payload: message.body,
            properties: message.properties,
            ttl_ms,
        })
        .await?
        .message_id
        .ok_or_else(|| Error::Protocol("SEND response without message id".into()))
    }

    /// Receive from `queue`; `None` on timeout
    ///
    /// `None` as the timeout waits until a message arrives.
    pub async fn receive(
        &mut self,
        session: SessionId,
        queue: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>> {
        let timeout_ms = match timeout {
            Some(timeout) => timeout.as_millis().try_into().unwrap_or(i64::MAX),
            None => -1,
        };
        let response = self
            .call(Request::Receive {
                session,
                queue: queue.to_string(),
                timeout_ms,
            })
            .await?;
        match response.status {
            Status::Timeout => Ok(None),
            _ => response
                .message
                .map(Some)
                .ok_or_else(|| Error::Protocol("RECEIVE response without message".into())),
        }
    }

    pub async fn ack(&mut self, session: SessionId, queue: &str, message_id: MessageId) -> Result<()> {
        self.call(Request::Ack {
            session,
            queue: queue.to_string(),
            message_id,
        })
        .await?;
        Ok(())
    }

    pub async fn recover(&mut self, session: SessionId) -> Result<()> {
        self.call(Request::Recover { session }).await?;
        Ok(())
    }

    /// Close the connection; the broker releases all of its sessions
    pub async fn close(mut self) -> Result<()> {
        self.call(Request::Close).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection)
            .field("peer", &self.framed.get_ref().peer_addr().ok())
            .finish()
    }
}

async fn call(framed: &mut FramedStream<TcpStream>, request: &Request) -> Result<Response> {
    framed.write_frame(request).await?;
    let frame = framed
        .read_frame()
        .await?
        .ok_or_else(|| Error::Protocol(format!("connection closed during {}", request.name())))?;
    let response: Response = serde_json::from_slice(&frame)?;
    response.into_result()
}
