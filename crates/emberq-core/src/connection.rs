//! Client connections
//!
//! A connection owns its sessions; closing it closes every one of them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use emberq_types::{ConnectionId, Error, Result, SessionId};
use parking_lot::RwLock;
use tracing::debug;

use crate::session::Session;

/// One client's link to the broker
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    client_id: RwLock<Option<String>>,
    sessions: DashMap<SessionId, Arc<Session>>,
    closed: AtomicBool,
    connected_at: DateTime<Utc>,
}

impl Connection {
    pub(crate) fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            client_id: RwLock::new(None),
            sessions: DashMap::new(),
            closed: AtomicBool::new(false),
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address, `None` for in-process connections
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    pub fn set_client_id(&self, client_id: impl Into<String>) {
        *self.client_id.write() = Some(client_id.into());
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Look up one of this connection's open sessions
    pub fn session(&self, id: SessionId) -> Result<Arc<Session>> {
        self.sessions
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(Error::SessionClosed)
    }

    pub(crate) fn add_session(&self, session: Arc<Session>) -> Result<()> {
        self.sessions.insert(session.id(), Arc::clone(&session));
        // Re-check after inserting so a concurrent close cannot miss it.
        if self.is_closed() {
            self.sessions.remove(&session.id());
            session.close();
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    pub(crate) fn remove_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    /// Close the connection and all of its sessions
    ///
    /// Returns the number of messages handed back for redelivery.
    pub(crate) fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let ids: Vec<SessionId> = self.sessions.iter().map(|s| *s.key()).collect();
        let redelivered: usize = ids
            .into_iter()
            .filter_map(|id| self.remove_session(id))
            .map(|session| session.close())
            .sum();

        debug!(connection = %self.id, redelivered, "Connection closed");
        redelivered
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
