//! TCP acceptor that bridges every client to the backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{AcceptorConfig, BackendReadMode};
use crate::connection::BridgedConnection;
use crate::endpoint::{ChannelPair, PollingTcpEndpoint, TcpBackend, TcpEndpoint};
use crate::error::{BridgeError, Result};
use crate::observer::{BridgeObserver, ConnectionId, ConnectionInfo};

/// Pause after a failed `accept`, so that persistent failures such as
/// running out of file descriptors do not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts client connections and relays each one to the backend.
///
/// Connection identifiers are assigned from a counter owned by the acceptor,
/// starting at 1.
pub struct BridgeAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<AcceptorConfig>,
    observer: Arc<dyn BridgeObserver>,
    shutdown: CancellationToken,
    connections: TaskTracker,
    next_id: AtomicU64,
}

impl BridgeAcceptor {
    /// Validate `config` and bind the listen address.
    pub async fn bind(config: AcceptorConfig, observer: Arc<dyn BridgeObserver>) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            listen = %local_addr,
            backend = %config.backend_addr,
            read_mode = ?config.backend_read_mode,
            "bridge listening"
        );

        Ok(Self {
            listener,
            local_addr,
            config: Arc::new(config),
            observer,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &AcceptorConfig {
        &self.config
    }

    /// Token that stops the acceptor and every connection it started.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting and cancel all connections.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Number of connections currently being relayed.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Accept clients until shut down, then wait for every connection to
    /// finish.
    pub async fn run(&self) -> Result<()> {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((client, client_addr)) => self.spawn_connection(client, client_addr),
                    Err(e) => {
                        tracing::warn!(error = %e, delay = ?ACCEPT_BACKOFF, "accept failed");
                        if back_off(&self.shutdown, ACCEPT_BACKOFF).await {
                            break;
                        }
                    }
                },
            }
        }

        self.connections.close();
        tracing::info!(
            active = self.connections.len(),
            "bridge shutting down, waiting for connections"
        );
        self.connections.wait().await;
        Ok(())
    }

    fn spawn_connection(&self, client: TcpStream, client_addr: SocketAddr) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let config = Arc::clone(&self.config);
        let observer = Arc::clone(&self.observer);
        let cancel = self.shutdown.child_token();

        tracing::debug!(connection = %id, client = %client_addr, "client accepted");

        self.connections.spawn(async move {
            let backend = match connect_backend(&config).await {
                Ok(backend) => backend,
                Err(e) => {
                    // dropping the client closes it
                    tracing::warn!(connection = %id, client = %client_addr, error = %e, "backend unavailable, closing client");
                    return;
                }
            };

            if config.nodelay {
                if let Err(e) = client.set_nodelay(true).and_then(|()| backend.set_nodelay(true)) {
                    tracing::debug!(connection = %id, error = %e, "failed to set TCP_NODELAY");
                }
            }

            let backend = match config.backend_read_mode {
                BackendReadMode::Blocking => TcpBackend::Blocking(TcpEndpoint::new(backend)),
                BackendReadMode::Polling => TcpBackend::Polling(PollingTcpEndpoint::new(backend)),
            };

            let info = ConnectionInfo::new(id)
                .with_client_addr(client_addr)
                .with_backend_addr(config.backend_addr);

            let summary = BridgedConnection::new(
                info,
                ChannelPair::new(TcpEndpoint::new(client), backend),
                observer,
                config.bridge.clone(),
            )
            .with_cancellation(cancel)
            .run()
            .await;

            tracing::info!(
                connection = %id,
                ingress = %summary.ingress.reason,
                egress = %summary.egress.reason,
                bytes_in = summary.ingress.stats.bytes_forwarded,
                bytes_out = summary.egress.stats.bytes_forwarded,
                "connection finished"
            );
        });
    }
}

impl std::fmt::Debug for BridgeAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeAcceptor")
            .field("local_addr", &self.local_addr)
            .field("config", &self.config)
            .field("active_connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

/// Sleep for `delay` unless shut down first. Returns whether shutdown was
/// requested.
async fn back_off(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

async fn connect_backend(config: &AcceptorConfig) -> Result<TcpStream> {
    let addr = config.backend_addr;
    match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(BridgeError::Connect { addr, source }),
        Err(_) => Err(BridgeError::ConnectTimeout(addr)),
    }
}
