//! Bridged connection lifecycle.
//!
//! A [`BridgedConnection`] owns one [`ChannelPair`] and runs two
//! [`DirectionalLoop`]s over it. A supervisor task tracks the joint state:
//!
//! ```text
//! BothOpen --(one direction closes)--> OneClosed --(other closes)--> BothClosed
//!                                          |
//!                                          +--(grace period expires: cancel)--+
//! ```
//!
//! One direction closing never stops the other on its own. Once the grace
//! period after the first closure has passed, the remaining direction is
//! cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::endpoint::{ChannelPair, Direction, Endpoint};
use crate::observer::{BridgeObserver, ConnectionId, ConnectionInfo};
use crate::relay::{DirectionSummary, DirectionalLoop};

/// Joint state of both directions of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Both directions are relaying.
    BothOpen,
    /// One direction has closed; the other is still running.
    OneClosed,
    /// Both directions have closed.
    BothClosed,
}

/// Final report of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSummary {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Client to backend direction.
    pub ingress: DirectionSummary,
    /// Backend to client direction.
    pub egress: DirectionSummary,
}

impl ConnectionSummary {
    fn new(id: ConnectionId, first: DirectionSummary, second: DirectionSummary) -> Self {
        let (ingress, egress) = if first.direction == Direction::ClientToBackend {
            (first, second)
        } else {
            (second, first)
        };
        Self {
            id,
            ingress,
            egress,
        }
    }

    /// Summary for a given direction.
    #[must_use]
    pub fn direction(&self, direction: Direction) -> &DirectionSummary {
        match direction {
            Direction::ClientToBackend => &self.ingress,
            Direction::BackendToClient => &self.egress,
        }
    }

    /// Whether neither direction ended in an error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.ingress.reason.is_clean() && self.egress.reason.is_clean()
    }
}

/// A client/backend pair waiting to be relayed.
pub struct BridgedConnection<C, B> {
    info: Arc<ConnectionInfo>,
    pair: ChannelPair<C, B>,
    observer: Arc<dyn BridgeObserver>,
    config: BridgeConfig,
    cancel: CancellationToken,
}

impl<C, B> BridgedConnection<C, B>
where
    C: Endpoint,
    B: Endpoint,
{
    /// Create a connection over `pair`, reporting to `observer`.
    pub fn new(
        info: ConnectionInfo,
        pair: ChannelPair<C, B>,
        observer: Arc<dyn BridgeObserver>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            info: Arc::new(info),
            pair,
            observer,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `token` to cancel the connection instead of a private one.
    ///
    /// Passing a child of an acceptor-wide token ties the connection to the
    /// acceptor's shutdown.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    /// Start both directions and the supervisor.
    ///
    /// Must be called from within a tokio runtime. An invalid configuration
    /// is logged; out-of-range sizes are clamped by the relay loops.
    pub fn start(self) -> ConnectionHandle {
        let Self {
            info,
            pair,
            observer,
            config,
            cancel,
        } = self;

        if let Err(e) = config.validate() {
            tracing::warn!(connection = %info.id, error = %e, "starting with invalid configuration");
        }

        let (client_reader, client_writer) = pair.client.split();
        let (backend_reader, backend_writer) = pair.backend.split();

        let ingress = DirectionalLoop::new(
            Direction::ClientToBackend,
            client_reader,
            backend_writer,
            Arc::clone(&info),
            Arc::clone(&observer),
            &config,
            cancel.clone(),
        );
        let egress = DirectionalLoop::new(
            Direction::BackendToClient,
            backend_reader,
            client_writer,
            Arc::clone(&info),
            observer,
            &config,
            cancel.clone(),
        );

        tracing::debug!(connection = %info.id, "starting bridged connection");

        let ingress = tokio::spawn(ingress.run());
        let egress = tokio::spawn(egress.run());

        let (state_tx, state_rx) = watch::channel(ConnectionState::BothOpen);
        let supervisor = tokio::spawn(supervise(
            info.id,
            ingress,
            egress,
            cancel.clone(),
            config.close_grace_period,
            state_tx,
        ));

        ConnectionHandle {
            info,
            cancel,
            state: state_rx,
            supervisor,
        }
    }

    /// Run the connection to completion.
    pub async fn run(self) -> ConnectionSummary {
        self.start().join().await
    }
}

impl<C, B> std::fmt::Debug for BridgedConnection<C, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedConnection")
            .field("info", &self.info)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle to a running connection.
///
/// Dropping the handle detaches the connection; it keeps relaying until both
/// directions close.
#[derive(Debug)]
pub struct ConnectionHandle {
    info: Arc<ConnectionInfo>,
    cancel: CancellationToken,
    state: watch::Receiver<ConnectionState>,
    supervisor: JoinHandle<ConnectionSummary>,
}

impl ConnectionHandle {
    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    /// Connection identity.
    #[must_use]
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Current joint state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Cancel both directions.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until both directions have closed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // an error means the supervisor is gone, which only happens after
        // BothClosed was published or the supervisor itself died
        let _ = state
            .wait_for(|state| *state == ConnectionState::BothClosed)
            .await;
    }

    /// Wait for the connection to finish and return its summary.
    pub async fn join(self) -> ConnectionSummary {
        match self.supervisor.await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(connection = %self.info.id, error = %e, "connection supervisor failed");
                ConnectionSummary {
                    id: self.info.id,
                    ingress: DirectionSummary::failed(Direction::ClientToBackend),
                    egress: DirectionSummary::failed(Direction::BackendToClient),
                }
            }
        }
    }
}

async fn supervise(
    id: ConnectionId,
    mut ingress: JoinHandle<DirectionSummary>,
    mut egress: JoinHandle<DirectionSummary>,
    cancel: CancellationToken,
    grace: Option<Duration>,
    state: watch::Sender<ConnectionState>,
) -> ConnectionSummary {
    let (first, mut remaining) = tokio::select! {
        result = &mut ingress => (settle(id, Direction::ClientToBackend, result), egress),
        result = &mut egress => (settle(id, Direction::BackendToClient, result), ingress),
    };
    let other = first.direction.reverse();

    state.send_replace(ConnectionState::OneClosed);
    tracing::debug!(connection = %id, closed = %first.direction, reason = %first.reason, "one direction closed");

    let second = match grace {
        Some(grace) => match tokio::time::timeout(grace, &mut remaining).await {
            Ok(result) => settle(id, other, result),
            Err(_) => {
                tracing::debug!(connection = %id, direction = %other, ?grace, "grace period expired, cancelling");
                cancel.cancel();
                settle(id, other, remaining.await)
            }
        },
        None => settle(id, other, remaining.await),
    };

    state.send_replace(ConnectionState::BothClosed);

    let summary = ConnectionSummary::new(id, first, second);
    tracing::debug!(
        connection = %id,
        ingress = %summary.ingress.reason,
        egress = %summary.egress.reason,
        "connection closed"
    );
    summary
}

fn settle(
    id: ConnectionId,
    direction: Direction,
    result: Result<DirectionSummary, JoinError>,
) -> DirectionSummary {
    result.unwrap_or_else(|e| {
        tracing::error!(connection = %id, %direction, error = %e, "direction task failed");
        DirectionSummary::failed(direction)
    })
}
