use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::{
    frame::MAX_PAYLOAD_SIZE,
    message::{self, Envelope, Operation, Outbound},
    registry::Registry,
    session::{Mailbox, SessionId},
};

/// Dispatches inbound application messages into destination mailboxes.
///
/// One router runs on each session's reader task; they share nothing but the
/// registry.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<Registry>,
    delivery_timeout: Duration,
}

impl Router {
    pub fn new(registry: Arc<Registry>, delivery_timeout: Duration) -> Self {
        Self {
            registry,
            delivery_timeout,
        }
    }

    /// Routes a message that arrived on session `from`.
    ///
    /// The sender identity is taken from `from`, never from the envelope.
    /// Returns how many mailboxes accepted a copy.
    pub async fn route(&self, from: SessionId, mut envelope: Envelope) -> usize {
        envelope.sender_id = from;

        match envelope.op {
            Operation::Heartbeat => 0,
            Operation::Unicast => self.unicast(&envelope).await,
            Operation::Broadcast => self.broadcast(&envelope).await,
        }
    }

    async fn unicast(&self, envelope: &Envelope) -> usize {
        let Some(mailbox) = self.registry.lookup(envelope.recipient_id).await else {
            debug!(
                from = %envelope.sender_id,
                to = %envelope.recipient_id,
                "dropping private message for unknown session"
            );
            return 0;
        };

        let message = Outbound {
            op: Operation::Unicast,
            body: format!("[private] From {}: {}", envelope.sender_id, envelope.body),
        };
        if !fits_in_frame(&message, envelope.sender_id) {
            return 0;
        }
        usize::from(self.deliver(&mailbox, message).await)
    }

    async fn broadcast(&self, envelope: &Envelope) -> usize {
        let recipients = self.registry.snapshot().await;
        let message = Outbound {
            op: Operation::Broadcast,
            body: format!("[broadcast] From {}: {}", envelope.sender_id, envelope.body),
        };
        if !fits_in_frame(&message, envelope.sender_id) {
            return 0;
        }

        // Deliveries run side by side so one full mailbox only delays its own copy.
        let deliveries = recipients
            .iter()
            .map(|mailbox| self.deliver(mailbox, message.clone()));
        join_all(deliveries)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    async fn deliver(&self, mailbox: &Mailbox, message: Outbound) -> bool {
        match mailbox.deliver(message, self.delivery_timeout).await {
            Ok(()) => true,
            Err(err) => {
                warn!(session = %mailbox.id(), error = %err, "dropping outbound message");
                false
            }
        }
    }
}

/// The body prefix can push a message that arrived in a full frame past the
/// frame limit; such a message is dropped here instead of failing every
/// recipient's writer.
fn fits_in_frame(outbound: &Outbound, from: SessionId) -> bool {
    let size = match message::encode(outbound) {
        Ok(payload) => payload.len(),
        Err(err) => {
            warn!(from = %from, error = %err, "cannot encode outbound message");
            return false;
        }
    };
    if size > MAX_PAYLOAD_SIZE {
        warn!(from = %from, size, "dropping message too large to frame");
        return false;
    }
    true
}
