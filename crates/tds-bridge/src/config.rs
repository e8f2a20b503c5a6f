//! Bridge and acceptor configuration.

use std::net::SocketAddr;
use std::time::Duration;

use tds_frame::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

use crate::error::BridgeError;

/// Default back-off between reads when an endpoint reports no data.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default time the surviving direction may run after its peer closed.
pub const DEFAULT_CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Default backend connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default size of the single read issued for an unframed (`0x17`) frame.
pub const DEFAULT_UNFRAMED_CHUNK_SIZE: usize = DEFAULT_PACKET_SIZE - PACKET_HEADER_SIZE;

/// Environment variable holding the listen address.
pub const ENV_LISTEN: &str = "TDS_BRIDGE_LISTEN";
/// Environment variable holding the backend address.
pub const ENV_BACKEND: &str = "TDS_BRIDGE_BACKEND";
/// Environment variable enabling polling reads on the backend.
pub const ENV_POLLING: &str = "TDS_BRIDGE_POLLING";
/// Environment variable holding the close grace period in seconds.
pub const ENV_GRACE_SECS: &str = "TDS_BRIDGE_GRACE_SECS";

/// Per-connection relay configuration.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct BridgeConfig {
    /// Delay before retrying a read that reported `WouldBlock`.
    pub poll_interval: Duration,

    /// How long the remaining direction may keep running once the other
    /// direction has closed. `None` lets it run until it closes on its own.
    pub close_grace_period: Option<Duration>,

    /// Initial size of each direction's scratch buffer. The buffer only
    /// grows, to `length + 1` of the largest frame seen.
    pub min_buffer_size: usize,

    /// Upper bound of the single read issued after an unframed header.
    pub unframed_chunk_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            close_grace_period: Some(DEFAULT_CLOSE_GRACE_PERIOD),
            min_buffer_size: DEFAULT_PACKET_SIZE,
            unframed_chunk_size: DEFAULT_UNFRAMED_CHUNK_SIZE,
        }
    }
}

impl BridgeConfig {
    /// Create a new bridge configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `WouldBlock` retry interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the close grace period, or `None` to disable forced teardown.
    #[must_use]
    pub fn close_grace_period(mut self, grace: Option<Duration>) -> Self {
        self.close_grace_period = grace;
        self
    }

    /// Set the initial scratch buffer size.
    #[must_use]
    pub fn min_buffer_size(mut self, size: usize) -> Self {
        self.min_buffer_size = size;
        self
    }

    /// Set the unframed chunk size.
    #[must_use]
    pub fn unframed_chunk_size(mut self, size: usize) -> Self {
        self.unframed_chunk_size = size;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.poll_interval.is_zero() {
            return Err(BridgeError::Config(
                "poll_interval must be greater than 0".into(),
            ));
        }
        if self.min_buffer_size < PACKET_HEADER_SIZE {
            return Err(BridgeError::Config(format!(
                "min_buffer_size must be at least {PACKET_HEADER_SIZE}"
            )));
        }
        if self.unframed_chunk_size == 0 || self.unframed_chunk_size > MAX_PACKET_SIZE {
            return Err(BridgeError::Config(format!(
                "unframed_chunk_size must be between 1 and {MAX_PACKET_SIZE}"
            )));
        }
        Ok(())
    }
}

/// How the backend-facing endpoint is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendReadMode {
    /// Reads wait until data arrives.
    #[default]
    Blocking,
    /// Reads return immediately; an empty socket is reported as
    /// `WouldBlock` and retried after [`BridgeConfig::poll_interval`].
    Polling,
}

/// Configuration for [`BridgeAcceptor`](crate::acceptor::BridgeAcceptor).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AcceptorConfig {
    /// Address clients connect to.
    pub listen_addr: SocketAddr,

    /// Address of the backend server.
    pub backend_addr: SocketAddr,

    /// Time allowed for connecting to the backend.
    pub connect_timeout: Duration,

    /// Read mode of the backend-facing endpoint.
    pub backend_read_mode: BackendReadMode,

    /// Whether to set `TCP_NODELAY` on both sockets.
    pub nodelay: bool,

    /// Relay configuration applied to every connection.
    pub bridge: BridgeConfig,
}

impl AcceptorConfig {
    /// Create a configuration relaying `listen_addr` to `backend_addr`.
    #[must_use]
    pub fn new(listen_addr: SocketAddr, backend_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            backend_addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backend_read_mode: BackendReadMode::default(),
            nodelay: true,
            bridge: BridgeConfig::default(),
        }
    }

    /// Build a configuration from `TDS_BRIDGE_*` environment variables.
    ///
    /// `TDS_BRIDGE_BACKEND` is required. `TDS_BRIDGE_LISTEN` defaults to
    /// `127.0.0.1:1433`.
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BridgeError> {
        let listen = lookup(ENV_LISTEN).unwrap_or_else(|| "127.0.0.1:1433".to_string());
        let listen_addr = parse_addr(ENV_LISTEN, &listen)?;

        let backend = lookup(ENV_BACKEND)
            .ok_or_else(|| BridgeError::Config(format!("{ENV_BACKEND} is not set")))?;
        let backend_addr = parse_addr(ENV_BACKEND, &backend)?;

        let mut config = Self::new(listen_addr, backend_addr);

        if let Some(polling) = lookup(ENV_POLLING) {
            if parse_bool(ENV_POLLING, &polling)? {
                config.backend_read_mode = BackendReadMode::Polling;
            }
        }

        if let Some(grace) = lookup(ENV_GRACE_SECS) {
            let secs: u64 = grace.trim().parse().map_err(|_| {
                BridgeError::Config(format!("{ENV_GRACE_SECS} must be a number of seconds"))
            })?;
            config.bridge.close_grace_period = if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs))
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the backend connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the backend read mode.
    #[must_use]
    pub fn backend_read_mode(mut self, mode: BackendReadMode) -> Self {
        self.backend_read_mode = mode;
        self
    }

    /// Enable or disable `TCP_NODELAY`.
    #[must_use]
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    /// Set the per-connection relay configuration.
    #[must_use]
    pub fn bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.connect_timeout.is_zero() {
            return Err(BridgeError::Config(
                "connect_timeout must be greater than 0".into(),
            ));
        }
        if self.listen_addr == self.backend_addr {
            return Err(BridgeError::Config(
                "listen_addr and backend_addr must differ".into(),
            ));
        }
        self.bridge.validate()
    }
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr, BridgeError> {
    value
        .trim()
        .parse()
        .map_err(|_| BridgeError::Config(format!("{key}: invalid socket address '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, BridgeError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BridgeError::Config(format!(
            "{key}: expected a boolean, got '{value}'"
        ))),
    }
}
