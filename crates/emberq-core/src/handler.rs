//! Per-connection protocol worker
//!
//! Reads request frames, runs them against the session manager one at a
//! time and writes one response per request. Producers and consumers are
//! created lazily per (session, queue) pair.
//!
//! Frames are read on a separate task, so a request blocked in `RECEIVE`
//! still notices when the peer goes away.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use emberq_storage::Wait;
use emberq_types::{AckMode, Error, Message, Request, Response, Result, SessionId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn, Instrument};

use crate::codec::FramedStream;
use crate::connection::Connection;
use crate::manager::SessionManager;
use crate::session::{Consumer, Producer, Session};

/// Frames read ahead of the request being processed
const FRAME_BACKLOG: usize = 32;

type Binding = (SessionId, String);

pub(crate) struct ConnectionHandler {
    connection: Arc<Connection>,
    sessions: Arc<SessionManager>,
    force_close: watch::Receiver<bool>,
    producers: HashMap<Binding, Producer>,
    consumers: HashMap<Binding, Consumer>,
    connected: bool,
}

impl ConnectionHandler {
    pub(crate) fn new(
        connection: Arc<Connection>,
        sessions: Arc<SessionManager>,
        force_close: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connection,
            sessions,
            force_close,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            connected: false,
        }
    }

    /// Serve `stream` until the client closes it, goes away or the listener
    /// forces it shut. Always releases the connection's sessions.
    pub(crate) async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let span = tracing::info_span!(
            "connection",
            id = %self.connection.id(),
            peer = ?self.connection.peer()
        );

        async {
            let (read_half, write_half) = tokio::io::split(stream);
            let (frames_tx, frames) = mpsc::channel(FRAME_BACKLOG);
            let (gone_tx, gone) = watch::channel(false);
            let reader = tokio::spawn(
                read_frames(FramedStream::new(read_half), frames_tx, gone_tx).in_current_span(),
            );

            let mut writer = FramedStream::new(write_half);
            if let Err(err) = self.serve(frames, gone, &mut writer).await {
                warn!(error = %err, "Connection terminated with error");
            }
            reader.abort();

            let redelivered = self.sessions.disconnect(&self.connection);
            debug!(redelivered, "Connection released");
        }
        .instrument(span)
        .await
    }

    async fn serve<W>(
        &mut self,
        mut frames: mpsc::Receiver<Result<Bytes>>,
        mut gone: watch::Receiver<bool>,
        writer: &mut FramedStream<W>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut force_close = self.force_close.clone();

        loop {
            let next = tokio::select! {
                next = frames.recv() => next,
                _ = signalled(&mut force_close) => {
                    debug!("Connection force-closed");
                    return Ok(());
                }
            };

            let Some(frame) = next else {
                return Ok(());
            };

            let request: Request = match serde_json::from_slice(&frame?) {
                Ok(request) => request,
                Err(err) => {
                    let response = Response::from_error(&Error::Protocol(err.to_string()));
                    writer.write_frame(&response).await?;
                    continue;
                }
            };

            let command = request.name();
            let closing = matches!(request, Request::Close);
            let outcome = tokio::select! {
                biased;
                outcome = self.handle(request) => outcome,
                _ = signalled(&mut gone) => {
                    debug!(command, "Peer went away during request");
                    return Ok(());
                }
                _ = signalled(&mut force_close) => {
                    debug!(command, "Connection force-closed during request");
                    return Ok(());
                }
            };

            let response = match outcome {
                Ok(response) => response,
                Err(err) => {
                    debug!(command, error = %err, "Request failed");
                    Response::from_error(&err)
                }
            };
            writer.write_frame(&response).await?;

            if closing {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, request: Request) -> Result<Response> {
        if !self.connected {
            return match request {
                Request::Connect { client_id } => {
                    if let Some(client_id) = client_id {
                        self.connection.set_client_id(client_id);
                    }
                    self.connected = true;
                    Ok(Response::connected(self.connection.id()))
                }
                Request::Close => Ok(Response::ok()),
                other => Err(Error::Protocol(format!(
                    "CONNECT required before {}",
                    other.name()
                ))),
            };
        }

        match request {
            Request::Connect { .. } => Err(Error::Protocol("already connected".into())),

            Request::OpenSession { ack_mode } => {
                let session = self.sessions.open_session(&self.connection, ack_mode)?;
                Ok(Response::session(session.id()))
            }

            Request::CloseSession { session } => {
                let session = self.connection.session(session)?;
                self.forget_session(session.id());
                self.sessions.close_session(&session);
                Ok(Response::ok())
            }

            Request::CreateQueue { name, durable } => {
                self.sessions.registry().create_queue(&name, durable)?;
                Ok(Response::ok())
            }

            Request::DeleteQueue { name, force } => {
                self.sessions.registry().delete_queue(&name, force)?;
                Ok(Response::ok())
            }

            Request::Send {
                session,
                queue,
                payload,
                properties,
                ttl_ms,
            } => {
                let producer = self.producer(session, queue)?;
                let mut message = Message::new(payload);
                message.properties = properties;
                if let Some(ttl_ms) = ttl_ms {
                    message = message.with_ttl(std::time::Duration::from_millis(ttl_ms));
                }
                let id = self.sessions.send(&producer, message)?;
                Ok(Response::sent(id))
            }

            Request::Receive {
                session,
                queue,
                timeout_ms,
            } => {
                let consumer = self.consumer(session, queue)?;
                let received = self
                    .sessions
                    .receive(&consumer, Wait::from_millis(timeout_ms))
                    .await?;
                Ok(match received {
                    Some(message) => Response::delivered(message),
                    None => Response::timeout(),
                })
            }

            Request::Ack {
                session,
                queue,
                message_id,
            } => {
                if self.open_session(session)?.ack_mode() == AckMode::Auto {
                    return Ok(Response::ok());
                }
                let consumer = self
                    .consumers
                    .get(&(session, queue))
                    .ok_or_else(|| Error::MessageNotFound(message_id.to_string()))?;
                self.sessions.acknowledge(consumer, message_id)?;
                Ok(Response::ok())
            }

            Request::Recover { session } => {
                let session = self.connection.session(session)?;
                self.sessions.recover(&session)?;
                Ok(Response::ok())
            }

            Request::Close => Ok(Response::ok()),
        }
    }

    fn open_session(&self, id: SessionId) -> Result<Arc<Session>> {
        let session = self.connection.session(id)?;
        if session.is_closed() {
            return Err(Error::SessionClosed);
        }
        Ok(session)
    }

    fn producer(&mut self, session: SessionId, queue: String) -> Result<Producer> {
        let key = (session, queue);
        if let Some(producer) = self.producers.get(&key) {
            if !producer.is_stale() {
                return Ok(producer.clone());
            }
            self.producers.remove(&key);
        }

        let handle = self.open_session(session)?;
        let producer = self.sessions.create_producer(&handle, &key.1)?;
        self.producers.insert(key, producer.clone());
        Ok(producer)
    }

    fn consumer(&mut self, session: SessionId, queue: String) -> Result<Consumer> {
        let key = (session, queue);
        if let Some(consumer) = self.consumers.get(&key) {
            if !consumer.is_stale() {
                return Ok(consumer.clone());
            }
            if let Some(stale) = self.consumers.remove(&key) {
                self.sessions.close_consumer(&stale);
            }
        }

        let handle = self.open_session(session)?;
        let consumer = self.sessions.create_consumer(&handle, &key.1)?;
        self.consumers.insert(key, consumer.clone());
        Ok(consumer)
    }

    fn forget_session(&mut self, session: SessionId) {
        self.producers.retain(|(id, _), _| *id != session);
        self.consumers.retain(|(id, _), _| *id != session);
    }
}

/// Forward frames from the peer until it closes, then raise `gone`
async fn read_frames<R>(
    mut reader: FramedStream<R>,
    frames: mpsc::Sender<Result<Bytes>>,
    gone: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                if frames.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = frames.send(Err(err)).await;
                break;
            }
        }
    }
    gone.send_replace(true);
}

/// Resolves once `flag` is set; never resolves if its sender is gone
/// without setting it
async fn signalled(flag: &mut watch::Receiver<bool>) {
    if flag.wait_for(|set| *set).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberq_storage::QueueRegistry;
    use emberq_types::Status;

    struct Harness {
        client: FramedStream<tokio::io::DuplexStream>,
        force_tx: watch::Sender<bool>,
        sessions: Arc<SessionManager>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn start() -> Self {
            let sessions = Arc::new(SessionManager::new(Arc::new(QueueRegistry::new())));
            let connection = sessions.connect(None).unwrap();
            let (client, server) = tokio::io::duplex(64 * 1024);
            let (force_tx, force_rx) = watch::channel(false);
            let handler = ConnectionHandler::new(connection, Arc::clone(&sessions), force_rx);
            Self {
                client: FramedStream::new(client),
                force_tx,
                sessions,
                task: tokio::spawn(handler.run(server)),
            }
        }

        /// Connect, create `queue` and open a session in `ack_mode`
        async fn session_on(&mut self, queue: &str, ack_mode: AckMode) -> SessionId {
            self.call(Request::Connect { client_id: None }).await;
            self.call(Request::CreateQueue {
                name: queue.into(),
                durable: false,
            })
            .await;
            self.call(Request::OpenSession { ack_mode })
                .await
                .session
                .unwrap()
        }

        async fn send_text(&mut self, session: SessionId, queue: &str, text: &'static str) {
            let sent = self
                .call(Request::Send {
                    session,
                    queue: queue.into(),
                    payload: Bytes::from_static(text.as_bytes()),
                    properties: HashMap::new(),
                    ttl_ms: None,
                })
                .await;
            assert_eq!(sent.status, Status::Ok);
        }

        async fn call(&mut self, request: Request) -> Response {
            self.client.write_frame(&request).await.unwrap();
            let frame = self.client.read_frame().await.unwrap().unwrap();
            serde_json::from_slice(&frame).unwrap()
        }
    }

    #[tokio::test]
    async fn test_connect_is_required_first() {
        let mut h = Harness::start();
        let response = h
            .call(Request::OpenSession {
                ack_mode: AckMode::Auto,
            })
            .await;
        assert_eq!(response.status, Status::Protocol);

        let response = h.call(Request::Connect { client_id: Some("demo".into()) }).await;
        assert_eq!(response.status, Status::Ok);
        assert!(response.connection.is_some());

        let response = h.call(Request::Connect { client_id: None }).await;
        assert_eq!(response.status, Status::Protocol);
    }

    #[tokio::test]
    async fn test_send_receive_ack_over_protocol() {
        let mut h = Harness::start();
        h.call(Request::Connect { client_id: None }).await;
        h.call(Request::CreateQueue {
            name: "orders".into(),
            durable: false,
        })
        .await;
        let session = h
            .call(Request::OpenSession {
                ack_mode: AckMode::Manual,
            })
            .await
            .session
            .unwrap();

        let sent = h
            .call(Request::Send {
                session,
                queue: "orders".into(),
                payload: bytes::Bytes::from_static(b"payload"),
                properties: HashMap::from([("n".to_string(), 7.into())]),
                ttl_ms: None,
            })
            .await;
        assert_eq!(sent.status, Status::Ok);

        let received = h
            .call(Request::Receive {
                session,
                queue: "orders".into(),
                timeout_ms: 1000,
            })
            .await;
        let message = received.message.unwrap();
        assert_eq!(message.body.as_ref(), b"payload");
        assert_eq!(message.id, sent.message_id.unwrap());

        let ack = h
            .call(Request::Ack {
                session,
                queue: "orders".into(),
                message_id: message.id,
            })
            .await;
        assert_eq!(ack.status, Status::Ok);

        let empty = h
            .call(Request::Receive {
                session,
                queue: "orders".into(),
                timeout_ms: 0,
            })
            .await;
        assert_eq!(empty.status, Status::Timeout);
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let mut h = Harness::start();
        h.call(Request::Connect { client_id: None }).await;

        let bad_name = h
            .call(Request::CreateQueue {
                name: "".into(),
                durable: false,
            })
            .await;
        assert_eq!(bad_name.code, Status::InvalidName.code());

        let session = h
            .call(Request::OpenSession {
                ack_mode: AckMode::Auto,
            })
            .await
            .session
            .unwrap();
        let missing = h
            .call(Request::Receive {
                session,
                queue: "nope".into(),
                timeout_ms: 0,
            })
            .await;
        assert_eq!(missing.status, Status::NotFound);

        h.call(Request::CloseSession { session }).await;
        let closed = h.call(Request::Recover { session }).await;
        assert_eq!(closed.status, Status::SessionClosed);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let mut h = Harness::start();
        h.client
            .write_frame(&serde_json::json!({"command": "FLY"}))
            .await
            .unwrap();
        let frame = h.client.read_frame().await.unwrap().unwrap();
        let response: Response = serde_json::from_slice(&frame).unwrap();
        assert_eq!(response.status, Status::Protocol);

        let response = h.call(Request::Connect { client_id: None }).await;
        assert_eq!(response.status, Status::Ok);
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let mut h = Harness::start();
        h.call(Request::Connect { client_id: None }).await;
        h.call(Request::OpenSession {
            ack_mode: AckMode::Auto,
        })
        .await;

        let response = h.call(Request::Close).await;
        assert_eq!(response.status, Status::Ok);
        h.task.await.unwrap();
        assert_eq!(h.sessions.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_force_close_ends_handler() {
        let mut h = Harness::start();
        h.call(Request::Connect { client_id: None }).await;

        h.force_tx.send_replace(true);
        h.task.await.unwrap();
        assert_eq!(h.sessions.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_ack_on_auto_session_is_noop() {
        let mut h = Harness::start();
        let session = h.session_on("orders", AckMode::Auto).await;

        // No consumer on this queue yet
        let ack = h
            .call(Request::Ack {
                session,
                queue: "orders".into(),
                message_id: emberq_types::MessageId(42),
            })
            .await;
        assert_eq!(ack.status, Status::Ok);
    }

    #[tokio::test]
    async fn test_ack_without_delivery_on_manual_session() {
        let mut h = Harness::start();
        let session = h.session_on("orders", AckMode::Manual).await;

        let ack = h
            .call(Request::Ack {
                session,
                queue: "orders".into(),
                message_id: emberq_types::MessageId(1),
            })
            .await;
        assert_eq!(ack.status, Status::MessageNotFound);
    }

    #[tokio::test]
    async fn test_peer_drop_during_blocked_receive_releases_delivery() {
        let mut h = Harness::start();
        let session = h.session_on("orders", AckMode::Manual).await;
        h.send_text(session, "orders", "held").await;

        let delivered = h
            .call(Request::Receive {
                session,
                queue: "orders".into(),
                timeout_ms: 1000,
            })
            .await
            .message
            .unwrap();

        // Block on an empty queue, then go away without CLOSE
        h.client
            .write_frame(&Request::Receive {
                session,
                queue: "orders".into(),
                timeout_ms: -1,
            })
            .await
            .unwrap();
        let Harness {
            client,
            sessions,
            task,
            ..
        } = h;
        drop(client);

        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("handler should notice the peer is gone")
            .unwrap();
        assert_eq!(sessions.connection_count(), 0);

        let queue = sessions.registry().get_queue("orders").unwrap();
        let stats = queue.stats();
        assert_eq!(stats.pending_count, 1);
        assert_eq!(stats.in_flight_count, 0);

        let redelivered = queue
            .try_dequeue(emberq_storage::ConsumerTag(u64::MAX))
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.id, delivered.id);
        assert!(redelivered.redelivered());
    }

    #[tokio::test]
    async fn test_force_close_during_blocked_receive() {
        let mut h = Harness::start();
        let session = h.session_on("orders", AckMode::Auto).await;

        h.client
            .write_frame(&Request::Receive {
                session,
                queue: "orders".into(),
                timeout_ms: -1,
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        h.force_tx.send_replace(true);
        tokio::time::timeout(std::time::Duration::from_secs(2), h.task)
            .await
            .expect("handler should stop when forced")
            .unwrap();
        assert_eq!(h.sessions.connection_count(), 0);
    }
}
