//! Per-session reader and writer loops, shared by both transports.
//!
//! A transport only has to provide the [`FrameSource`] / [`FrameSink`]
//! capabilities; everything above that (decoding, routing, heartbeats,
//! termination and deregistration) lives here and behaves identically for TCP
//! and WebSocket connections.

pub mod tcp;
pub mod ws;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    error::{RelayError, Result},
    message::{self, Envelope, Outbound},
    registry::Registry,
    router::Router,
    session::{Lifecycle, SessionId},
};

/// Consecutive malformed frames a reader tolerates before giving up on the connection.
pub const MAX_MALFORMED_FRAMES: u32 = 3;

/// Inbound half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next serialized application message, or `Ok(None)` once the peer has closed.
    async fn read_frame(&mut self) -> Result<Option<Bytes>>;
}

/// Outbound half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn write_frame(&mut self, payload: Bytes) -> Result<()>;

    /// Keep-alive traffic: a heartbeat frame on TCP, a ping on WebSocket.
    async fn write_heartbeat(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Handles to the two tasks serving one session.
#[derive(Debug)]
pub struct SessionTasks {
    pub id: SessionId,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

impl SessionTasks {
    /// Waits until both loops have finished.
    pub async fn join(self) {
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

/// Registers a new session for an accepted connection and spawns its loops.
pub async fn spawn_session<S, K>(
    registry: &Arc<Registry>,
    config: &RelayConfig,
    source: S,
    sink: K,
) -> Result<SessionTasks>
where
    S: FrameSource + 'static,
    K: FrameSink + 'static,
{
    let session = registry.register().await?;
    let (id, inbox, lifecycle) = session.into_parts();
    let router = Router::new(Arc::clone(registry), config.delivery_timeout);

    let reader = tokio::spawn(run_reader(
        id,
        source,
        router,
        lifecycle.clone(),
        Arc::clone(registry),
    ));
    let writer = tokio::spawn(run_writer(
        id,
        sink,
        inbox,
        WriterTiming {
            heartbeat: config.heartbeat_interval,
            write_timeout: config.write_timeout,
        },
        lifecycle,
        Arc::clone(registry),
    ));

    Ok(SessionTasks { id, reader, writer })
}

async fn run_reader<S: FrameSource>(
    id: SessionId,
    mut source: S,
    router: Router,
    lifecycle: Lifecycle,
    registry: Arc<Registry>,
) {
    let outcome = read_until_terminated(id, &mut source, &router, &lifecycle).await;
    finish(id, "reader", outcome, &lifecycle, &registry).await;
}

async fn read_until_terminated<S: FrameSource>(
    id: SessionId,
    source: &mut S,
    router: &Router,
    lifecycle: &Lifecycle,
) -> Result<()> {
    let mut malformed = 0;

    loop {
        let next = select! {
            _ = lifecycle.closed() => return Ok(()),
            next = source.read_frame() => next,
        };

        match next {
            Ok(Some(payload)) => {
                malformed = 0;
                let envelope: Envelope = message::decode(&payload)?;
                router.route(id, envelope).await;
            }
            Ok(None) => return Ok(()),
            Err(err) if err.is_recoverable() => {
                malformed += 1;
                warn!(session = %id, attempt = malformed, error = %err, "bad frame from client");
                if malformed >= MAX_MALFORMED_FRAMES {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

struct WriterTiming {
    heartbeat: Duration,
    write_timeout: Duration,
}

async fn run_writer<K: FrameSink>(
    id: SessionId,
    mut sink: K,
    mut inbox: mpsc::Receiver<Outbound>,
    timing: WriterTiming,
    lifecycle: Lifecycle,
    registry: Arc<Registry>,
) {
    let outcome = write_until_terminated(&mut sink, &mut inbox, &timing, &lifecycle).await;
    finish(id, "writer", outcome, &lifecycle, &registry).await;

    // The writer owns the outbound half, so the transport is closed here and only here.
    if let Err(err) = bounded(timing.write_timeout, sink.close()).await {
        debug!(session = %id, error = %err, "transport close failed");
    }
}

async fn write_until_terminated<K: FrameSink>(
    sink: &mut K,
    inbox: &mut mpsc::Receiver<Outbound>,
    timing: &WriterTiming,
    lifecycle: &Lifecycle,
) -> Result<()> {
    let mut heartbeat = interval_at(Instant::now() + timing.heartbeat, timing.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = lifecycle.closed() => return Ok(()),
            queued = inbox.recv() => {
                let Some(outbound) = queued else {
                    return Ok(());
                };
                let payload = Bytes::from(message::encode(&outbound)?);
                bounded(timing.write_timeout, sink.write_frame(payload)).await?;
            }
            _ = heartbeat.tick() => {
                bounded(timing.write_timeout, sink.write_heartbeat()).await?;
            }
        }
    }
}

async fn bounded<F>(limit: Duration, write: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    timeout(limit, write)
        .await
        .map_err(|_| RelayError::WriteTimeout(limit))?
}

/// Marks the session closed and deregisters it. Only the first loop to get here
/// does the work; the other one finds the lifecycle already closed.
async fn finish(
    id: SessionId,
    side: &'static str,
    outcome: Result<()>,
    lifecycle: &Lifecycle,
    registry: &Registry,
) {
    if !lifecycle.close() {
        return;
    }

    match outcome {
        Ok(()) => debug!(session = %id, side, "session loop ended"),
        Err(err) => warn!(session = %id, side, error = %err, "session loop failed"),
    }
    registry.deregister(id).await;
    info!(session = %id, "session closed");
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

    use super::*;
    use crate::message::Operation;

    /// Scripted inbound traffic. Once the script runs out the source either
    /// reports end of stream or hangs, like an idle peer.
    struct ScriptedSource {
        script: VecDeque<Result<Option<Bytes>>>,
        hang_when_done: bool,
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn read_frame(&mut self) -> Result<Option<Bytes>> {
            match self.script.pop_front() {
                Some(step) => step,
                None if self.hang_when_done => std::future::pending().await,
                None => Ok(None),
            }
        }
    }

    #[derive(Debug, PartialEq)]
    enum Written {
        Frame(Outbound),
        Heartbeat,
        Closed,
    }

    struct RecordingSink {
        tx: UnboundedSender<Written>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn write_frame(&mut self, payload: Bytes) -> Result<()> {
            let outbound: Outbound = message::decode(&payload)?;
            let _ = self.tx.send(Written::Frame(outbound));
            Ok(())
        }

        async fn write_heartbeat(&mut self) -> Result<()> {
            let _ = self.tx.send(Written::Heartbeat);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            let _ = self.tx.send(Written::Closed);
            Ok(())
        }
    }

    fn payload(envelope: &Envelope) -> Result<Option<Bytes>> {
        Ok(Some(Bytes::from(message::encode(envelope).expect("encode"))))
    }

    fn malformed() -> Result<Option<Bytes>> {
        Err(RelayError::MalformedFrame("test".into()))
    }

    fn broadcast(body: &str) -> Envelope {
        Envelope {
            op: Operation::Broadcast,
            sender_id: SessionId::default(),
            sender_name: "tester".into(),
            recipient_id: SessionId::default(),
            body: body.into(),
        }
    }

    async fn start(
        registry: &Arc<Registry>,
        config: &RelayConfig,
        script: Vec<Result<Option<Bytes>>>,
        hang_when_done: bool,
    ) -> (SessionTasks, UnboundedReceiver<Written>) {
        let (tx, rx) = unbounded_channel();
        let source = ScriptedSource {
            script: script.into(),
            hang_when_done,
        };
        let tasks = spawn_session(registry, config, source, RecordingSink { tx })
            .await
            .expect("spawn");
        (tasks, rx)
    }

    async fn collect(mut rx: UnboundedReceiver<Written>) -> Vec<Written> {
        let mut out = Vec::new();
        while let Some(written) = rx.recv().await {
            out.push(written);
        }
        out
    }

    #[tokio::test]
    async fn peer_close_deregisters_and_closes_once() {
        let registry = Arc::new(Registry::new(8));
        let (tasks, rx) = start(&registry, &RelayConfig::default(), vec![], false).await;
        let id = tasks.id;

        tokio::time::timeout(Duration::from_secs(1), tasks.join())
            .await
            .expect("loops end");

        assert!(!registry.contains(id).await);
        assert_eq!(collect(rx).await, vec![Written::Closed]);
    }

    #[tokio::test]
    async fn broadcast_is_echoed_back_to_sender() {
        let registry = Arc::new(Registry::new(8));
        let (tasks, rx) = start(
            &registry,
            &RelayConfig::default(),
            vec![payload(&broadcast("hello"))],
            false,
        )
        .await;
        let id = tasks.id;

        tokio::time::timeout(Duration::from_secs(1), tasks.join())
            .await
            .expect("loops end");

        let written = collect(rx).await;
        assert_eq!(written.last(), Some(&Written::Closed));
        // The writer may be told to stop before it drains the echo; when it
        // does get out, it has the expected shape.
        for w in &written[..written.len() - 1] {
            assert_eq!(
                w,
                &Written::Frame(Outbound {
                    op: Operation::Broadcast,
                    body: format!("[broadcast] From {id}: hello"),
                })
            );
        }
    }

    #[tokio::test]
    async fn three_consecutive_malformed_frames_end_the_session() {
        let registry = Arc::new(Registry::new(8));
        let (tasks, rx) = start(
            &registry,
            &RelayConfig::default(),
            vec![malformed(), malformed(), malformed()],
            true,
        )
        .await;
        let id = tasks.id;

        tokio::time::timeout(Duration::from_secs(1), tasks.join())
            .await
            .expect("loops end");

        assert!(!registry.contains(id).await);
        assert_eq!(collect(rx).await, vec![Written::Closed]);
    }

    #[tokio::test]
    async fn a_good_frame_resets_the_malformed_count() {
        let registry = Arc::new(Registry::new(8));
        let (tasks, _rx) = start(
            &registry,
            &RelayConfig::default(),
            vec![
                malformed(),
                malformed(),
                payload(&Envelope::heartbeat()),
                malformed(),
                malformed(),
            ],
            true,
        )
        .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.contains(tasks.id).await);
        assert!(!tasks.reader.is_finished());
    }

    #[tokio::test]
    async fn undecodable_payload_ends_the_session() {
        let registry = Arc::new(Registry::new(8));
        let (tasks, _rx) = start(
            &registry,
            &RelayConfig::default(),
            vec![Ok(Some(Bytes::from_static(b"{not json")))],
            true,
        )
        .await;
        let id = tasks.id;

        tokio::time::timeout(Duration::from_secs(1), tasks.join())
            .await
            .expect("loops end");
        assert!(!registry.contains(id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_writer_emits_heartbeats() {
        let registry = Arc::new(Registry::new(8));
        let config = RelayConfig {
            heartbeat_interval: Duration::from_secs(60),
            ..RelayConfig::default()
        };
        let (tasks, mut rx) = start(&registry, &config, vec![], true).await;

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(rx.recv().await, Some(Written::Heartbeat));
        assert_eq!(rx.recv().await, Some(Written::Heartbeat));
        assert!(registry.contains(tasks.id).await);
    }

    /// Accepts nothing: every write hangs until the caller gives up.
    struct StalledSink {
        closes: UnboundedSender<()>,
    }

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn write_frame(&mut self, _payload: Bytes) -> Result<()> {
            std::future::pending().await
        }

        async fn write_heartbeat(&mut self) -> Result<()> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            let _ = self.closes.send(());
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out_and_ends_the_session() {
        let registry = Arc::new(Registry::new(8));
        let config = RelayConfig {
            write_timeout: Duration::from_secs(5),
            ..RelayConfig::default()
        };
        let (closes, mut closed) = unbounded_channel();
        let source = ScriptedSource {
            script: VecDeque::new(),
            hang_when_done: true,
        };
        let tasks = spawn_session(&registry, &config, source, StalledSink { closes })
            .await
            .expect("spawn");
        let id = tasks.id;

        let mailbox = registry.lookup(id).await.expect("live");
        mailbox
            .send(Outbound {
                op: Operation::Unicast,
                body: "never written".into(),
            })
            .await
            .expect("queued");

        tokio::time::timeout(Duration::from_secs(30), tasks.join())
            .await
            .expect("loops end despite the stalled transport");
        assert!(!registry.contains(id).await);
        assert_eq!(closed.recv().await, Some(()));
    }

    #[tokio::test]
    async fn deregistering_elsewhere_stops_the_writer() {
        let registry = Arc::new(Registry::new(8));
        let (tasks, rx) = start(&registry, &RelayConfig::default(), vec![], true).await;

        // Dropping the last mailbox handle closes the inbox; the writer treats that
        // as termination and brings the reader down with it.
        registry.deregister(tasks.id).await;
        tokio::time::timeout(Duration::from_secs(1), tasks.join())
            .await
            .expect("loops end");
        assert_eq!(collect(rx).await, vec![Written::Closed]);
    }
}
