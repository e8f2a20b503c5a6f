//! # tds-bridge
//!
//! A transparent, intercepting relay for the TDS wire protocol.
//!
//! The bridge sits between a client and a TDS server. Every byte it reads
//! from one side is forwarded, unchanged and in order, to the other side,
//! while the byte stream is parsed into frames and logical messages and
//! reported to a [`BridgeObserver`].
//!
//! ## Architecture
//!
//! ```text
//!  client ──► [client reader] ─ DirectionalLoop (ClientToBackend) ─► [backend writer] ──► server
//!  client ◄── [client writer] ◄─ DirectionalLoop (BackendToClient) ─ [backend reader] ◄── server
//!                                         │
//!                                   BridgeObserver
//! ```
//!
//! - [`endpoint`]: endpoint abstraction with tri-state reads
//! - [`relay`]: the per-direction frame loop
//! - [`connection`]: two loops plus a supervisor with close grace period
//! - [`acceptor`]: TCP front end that bridges each client to the backend
//! - [`observer`] and [`recorder`]: event sinks
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tds_bridge::{AcceptorConfig, BridgeAcceptor, TracingObserver};
//!
//! # async fn example() -> Result<(), tds_bridge::BridgeError> {
//! let config = AcceptorConfig::new(
//!     "127.0.0.1:14330".parse().unwrap(),
//!     "10.0.0.5:1433".parse().unwrap(),
//! );
//! let acceptor = BridgeAcceptor::bind(config, Arc::new(TracingObserver)).await?;
//! acceptor.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod acceptor;
pub mod codec;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod observer;
pub mod packet;
pub mod recorder;
pub mod relay;

pub use acceptor::BridgeAcceptor;
pub use codec::FrameCodec;
pub use config::{AcceptorConfig, BackendReadMode, BridgeConfig};
pub use connection::{BridgedConnection, ConnectionHandle, ConnectionState, ConnectionSummary};
pub use endpoint::{
    ChannelPair, Direction, Endpoint, EndpointReader, EndpointWriter, PollingTcpEndpoint,
    ReadOutcome, StreamEndpoint, TcpBackend, TcpEndpoint,
};
pub use error::{BridgeError, CloseReason, Result};
pub use message::{Message, MessageAssembler};
pub use observer::{
    BridgeObserver, ConnectionId, ConnectionInfo, NoopObserver, ObserverChain, TracingObserver,
};
pub use packet::Packet;
pub use recorder::{
    DEFAULT_RECORDER_CAPACITY, FrameRecorder, RecordedFrame, RecordingWriter, StreamingRecorder,
};
pub use relay::{DirectionStats, DirectionSummary, DirectionalLoop};

pub use tds_frame::{PacketHeader, PacketStatus, PacketType};
pub use tokio_util::sync::CancellationToken;
