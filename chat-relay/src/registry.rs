use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, Ordering},
};

use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    error::{RelayError, Result},
    session::{Mailbox, Session, SessionId},
};

/// Identity -> mailbox map shared by every listener and router.
///
/// Routing lookups take the read lock and may run concurrently; registration and
/// deregistration take the write lock. Mailboxes are cloned out so no lock is
/// held while a delivery waits on a full queue.
#[derive(Debug)]
pub struct Registry {
    sessions: RwLock<HashMap<SessionId, Mailbox>>,
    next_id: AtomicU32,
    mailbox_capacity: usize,
}

impl Registry {
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            mailbox_capacity: mailbox_capacity.max(1),
        }
    }

    fn next_id(&self) -> SessionId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return SessionId::new(id);
            }
        }
    }

    /// Allocates a fresh identity and registers an empty session under it.
    pub async fn register(&self) -> Result<Session> {
        let id = self.next_id();
        self.register_as(id).await
    }

    /// Registers a session under a caller-chosen identity. Fails if that
    /// identity is already live.
    pub(crate) async fn register_as(&self, id: SessionId) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(RelayError::IdentityCollision(id));
        }

        let (session, mailbox) = Session::new(id, self.mailbox_capacity);
        sessions.insert(id, mailbox);
        debug!(session = %id, live = sessions.len(), "session registered");
        Ok(session)
    }

    /// Removes `id`. Returns whether it was present; removing an absent identity is a no-op.
    pub async fn deregister(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(&id).is_some();
        if removed {
            debug!(session = %id, live = sessions.len(), "session deregistered");
        }
        removed
    }

    pub async fn lookup(&self, id: SessionId) -> Option<Mailbox> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Every live mailbox at the time of the call, in no particular order.
    pub async fn snapshot(&self) -> Vec<Mailbox> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
