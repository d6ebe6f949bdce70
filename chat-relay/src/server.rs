use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    config::RelayConfig,
    registry::Registry,
    transport::{tcp, ws},
};

#[derive(Debug, Clone, Copy)]
enum Transport {
    Tcp,
    Ws,
}

impl Transport {
    fn name(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ws => "ws",
        }
    }
}

/// Accepts raw TCP and WebSocket clients into one shared registry, so sessions on
/// either transport can message each other.
pub struct Relay {
    tcp: TcpListener,
    ws: TcpListener,
    registry: Arc<Registry>,
    config: Arc<RelayConfig>,
}

impl Relay {
    pub fn new(tcp: TcpListener, ws: TcpListener, config: RelayConfig) -> Self {
        Self {
            tcp,
            ws,
            registry: Arc::new(Registry::new(config.mailbox_capacity)),
            config: Arc::new(config),
        }
    }

    pub fn tcp_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn ws_addr(&self) -> std::io::Result<SocketAddr> {
        self.ws.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections on both listeners until `shutdown` resolves.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            tcp,
            ws,
            registry,
            config,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    let live_sessions = registry.len().await;
                    info!(live_sessions, "relay shutting down");
                    break;
                }
                accepted = tcp.accept() => {
                    handle_accept_result(Transport::Tcp, accepted, &registry, &config);
                }
                accepted = ws.accept() => {
                    handle_accept_result(Transport::Ws, accepted, &registry, &config);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    transport: Transport,
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
    config: &Arc<RelayConfig>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection(transport, stream, peer, registry, config),
        Err(err) => warn!(transport = transport.name(), error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(
    transport: Transport,
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    config: &Arc<RelayConfig>,
) {
    let registry = Arc::clone(registry);
    let config = Arc::clone(config);
    tokio::spawn(async move {
        let started = match transport {
            Transport::Tcp => tcp::start_session(stream, peer, &registry, &config).await,
            Transport::Ws => ws::start_session(stream, peer, &registry, &config).await,
        };
        if let Err(err) = started {
            warn!(transport = transport.name(), %peer, error = %err, "failed to start session");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn relay_runs_as_a_spawned_task_until_shutdown() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.expect("bind tcp");
        let ws = TcpListener::bind("127.0.0.1:0").await.expect("bind ws");
        let relay = Relay::new(tcp, ws, RelayConfig::default());
        let tcp_addr = relay.tcp_addr().expect("tcp addr");
        let registry = relay.registry();

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let run = relay.run_until(async move {
            let _ = stopped.await;
        });
        assert_send(&run);
        let server = tokio::spawn(run);

        let _client = TcpStream::connect(tcp_addr).await.expect("connect");
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session registered");

        let _ = stop.send(());
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("relay stopped")
            .expect("relay task")
            .expect("relay result");
    }
}
