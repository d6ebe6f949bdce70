use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError},
    watch,
};

use crate::{
    error::{RelayError, Result},
    message::Outbound,
};

/// Identity of one connected client. Zero is never handed out.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(u32);

impl SessionId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Producer handle onto a session's bounded outbound queue.
///
/// Cloned out of the registry by routers; the session's writer loop owns the
/// only receiver.
#[derive(Debug, Clone)]
pub struct Mailbox {
    id: SessionId,
    tx: mpsc::Sender<Outbound>,
}

impl Mailbox {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Enqueues `message`, waiting for space while the mailbox is full.
    pub async fn send(&self, message: Outbound) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| RelayError::MailboxClosed(self.id))
    }

    /// Like [`Mailbox::send`], but gives up once the mailbox has stayed full for `timeout`.
    pub async fn deliver(&self, message: Outbound, timeout: Duration) -> Result<()> {
        match self.tx.send_timeout(message, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(RelayError::DeliveryTimeout(self.id)),
            Err(SendTimeoutError::Closed(_)) => Err(RelayError::MailboxClosed(self.id)),
        }
    }
}

/// Shared "this session is over" flag.
///
/// Whichever loop notices termination first flips it; the other loop observes
/// the change through [`Lifecycle::closed`].
#[derive(Debug, Clone)]
pub struct Lifecycle {
    closed: Arc<watch::Sender<bool>>,
}

impl Lifecycle {
    fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            closed: Arc::new(closed),
        }
    }

    /// Marks the session closed. Returns `true` only for the first caller.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`Lifecycle::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Server-side state for one connection: its identity, the receiving end of its
/// mailbox and its lifecycle flag.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    inbox: mpsc::Receiver<Outbound>,
    lifecycle: Lifecycle,
}

impl Session {
    pub(crate) fn new(id: SessionId, capacity: usize) -> (Self, Mailbox) {
        let (tx, inbox) = mpsc::channel(capacity);
        let session = Self {
            id,
            inbox,
            lifecycle: Lifecycle::new(),
        };
        (session, Mailbox { id, tx })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub async fn recv(&mut self) -> Option<Outbound> {
        self.inbox.recv().await
    }

    /// Takes a queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.inbox.try_recv().ok()
    }

    pub fn into_parts(self) -> (SessionId, mpsc::Receiver<Outbound>, Lifecycle) {
        (self.id, self.inbox, self.lifecycle)
    }
}
