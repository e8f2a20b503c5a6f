//! Scripted endpoints.
//!
//! A [`ScriptedEndpoint`] replays a fixed list of [`ReadStep`]s and records
//! every `write_all` call separately, so tests can check both what was
//! forwarded and how it was chunked.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tds_bridge::{Endpoint, EndpointReader, EndpointWriter, ReadOutcome};

/// One scripted read result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStep {
    /// Deliver these bytes. A read with a smaller buffer takes a prefix and
    /// leaves the rest for the next read.
    Data(Vec<u8>),
    /// Report that no data is available.
    WouldBlock,
    /// Report end-of-stream.
    Closed,
    /// Fail with this error kind.
    Error(io::ErrorKind),
    /// Sleep, then continue with the next step.
    Delay(Duration),
    /// Never complete.
    Pending,
}

impl ReadStep {
    /// Shorthand for [`ReadStep::Data`].
    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Data(bytes.into())
    }
}

#[derive(Debug, Default)]
struct Shared {
    writes: Mutex<Vec<Vec<u8>>>,
    shutdown: AtomicBool,
    reads: AtomicUsize,
}

/// Endpoint driven by a script.
///
/// Once the script is exhausted every read reports end-of-stream.
#[derive(Debug)]
pub struct ScriptedEndpoint {
    steps: VecDeque<ReadStep>,
    fail_writes: Option<io::ErrorKind>,
    shared: Arc<Shared>,
}

impl ScriptedEndpoint {
    /// Create an endpoint replaying `steps`.
    pub fn new(steps: impl IntoIterator<Item = ReadStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            fail_writes: None,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Make every write fail with `kind`.
    #[must_use]
    pub fn failing_writes(mut self, kind: io::ErrorKind) -> Self {
        self.fail_writes = Some(kind);
        self
    }

    /// Handle for inspecting the endpoint after it has been moved into a
    /// connection.
    #[must_use]
    pub fn handle(&self) -> ScriptedHandle {
        ScriptedHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Endpoint for ScriptedEndpoint {
    type Reader = ScriptedReader;
    type Writer = ScriptedWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (
            ScriptedReader {
                steps: self.steps,
                shared: Arc::clone(&self.shared),
            },
            ScriptedWriter {
                fail_writes: self.fail_writes,
                connected: true,
                shared: self.shared,
            },
        )
    }
}

/// Read half of a [`ScriptedEndpoint`].
#[derive(Debug)]
pub struct ScriptedReader {
    steps: VecDeque<ReadStep>,
    shared: Arc<Shared>,
}

#[async_trait]
impl EndpointReader for ScriptedReader {
    async fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        self.shared.reads.fetch_add(1, Ordering::Relaxed);
        loop {
            let Some(step) = self.steps.pop_front() else {
                return ReadOutcome::Closed;
            };
            match step {
                ReadStep::Data(mut data) => {
                    if data.is_empty() {
                        continue;
                    }
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.steps.push_front(ReadStep::Data(data.split_off(n)));
                    }
                    return ReadOutcome::Data(n);
                }
                ReadStep::WouldBlock => return ReadOutcome::WouldBlock,
                ReadStep::Closed => return ReadOutcome::Closed,
                ReadStep::Error(kind) => return ReadOutcome::Error(kind.into()),
                ReadStep::Delay(delay) => tokio::time::sleep(delay).await,
                ReadStep::Pending => {
                    self.steps.push_front(ReadStep::Pending);
                    return std::future::pending().await;
                }
            }
        }
    }
}

/// Write half of a [`ScriptedEndpoint`].
#[derive(Debug)]
pub struct ScriptedWriter {
    fail_writes: Option<io::ErrorKind>,
    connected: bool,
    shared: Arc<Shared>,
}

#[async_trait]
impl EndpointWriter for ScriptedWriter {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if let Some(kind) = self.fail_writes {
            self.connected = false;
            return Err(kind.into());
        }
        if !self.connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.shared.writes.lock().push(buf.to_vec());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.connected = false;
        self.shared.shutdown.store(true, Ordering::Release);
        Ok(())
    }
}

/// Inspection handle for a [`ScriptedEndpoint`].
#[derive(Debug, Clone)]
pub struct ScriptedHandle {
    shared: Arc<Shared>,
}

impl ScriptedHandle {
    /// Every `write_all` call, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.writes.lock().clone()
    }

    /// All written bytes, concatenated.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.shared.writes.lock().concat()
    }

    /// Number of `write_all` calls.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.shared.writes.lock().len()
    }

    /// Whether the write side was half-closed.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Number of reads issued.
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.shared.reads.load(Ordering::Relaxed)
    }
}
