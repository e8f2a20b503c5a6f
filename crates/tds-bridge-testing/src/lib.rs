//! # tds-bridge-testing
//!
//! Test infrastructure for the TDS bridge.
//!
//! ## Features
//!
//! - Scripted endpoints that replay a fixed sequence of read outcomes and
//!   capture every write
//! - An observer that records every relay event for assertions
//! - A mock TDS backend that answers each request message over TCP
//! - Frame fixture helpers
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tds_bridge::{BridgeConfig, BridgedConnection, ChannelPair, ConnectionId, ConnectionInfo};
//! use tds_bridge_testing::{fixtures, RecordingObserver, ReadStep, ScriptedEndpoint};
//!
//! #[tokio::test]
//! async fn test_relays_batch() {
//!     let client = ScriptedEndpoint::new([ReadStep::data(fixtures::frame(0x01, 0x01, b"x"))]);
//!     let backend = ScriptedEndpoint::new([ReadStep::Closed]);
//!     let observer = Arc::new(RecordingObserver::new());
//!
//!     let summary = BridgedConnection::new(
//!         ConnectionInfo::new(ConnectionId(1)),
//!         ChannelPair::new(client, backend),
//!         observer.clone(),
//!         BridgeConfig::default(),
//!     )
//!     .run()
//!     .await;
//!     assert!(summary.is_clean());
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_backend;
pub mod observer;
pub mod scripted;

pub use mock_backend::{MockBackend, MockBackendBuilder};
pub use observer::{ObservedError, ObservedEvent, RecordingObserver};
pub use scripted::{ReadStep, ScriptedEndpoint, ScriptedHandle, ScriptedReader, ScriptedWriter};
