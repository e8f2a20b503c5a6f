//! Run a TDS bridge between a listen address and a backend server.
//!
//! Every relayed frame is logged through `tracing`; set `RUST_LOG=trace` to
//! see individual frames.
//!
//! # Running
//!
//! ```bash
//! export TDS_BRIDGE_LISTEN=127.0.0.1:14330
//! export TDS_BRIDGE_BACKEND=127.0.0.1:1433
//! # Optional: poll the backend instead of waiting on reads
//! export TDS_BRIDGE_POLLING=false
//! # Optional: seconds the surviving direction may run (0 disables)
//! export TDS_BRIDGE_GRACE_SECS=30
//! # Optional: append every relayed frame to this file as it is relayed
//! export TDS_BRIDGE_RECORD=/tmp/bridge.rec
//!
//! cargo run --example bridge
//! ```

use std::sync::Arc;

use tds_bridge::{
    AcceptorConfig, BridgeAcceptor, BridgeError, DEFAULT_RECORDER_CAPACITY, ObserverChain,
    StreamingRecorder, TracingObserver,
};

#[tokio::main]
async fn main() -> Result<(), BridgeError> {
    // Initialize tracing for logging
    tracing_subscriber::fmt::init();

    let config = AcceptorConfig::from_env()?;
    let record_path = std::env::var("TDS_BRIDGE_RECORD").ok();

    let mut observer = ObserverChain::new().with(Arc::new(TracingObserver));
    let mut recording = None;
    if let Some(path) = &record_path {
        let (recorder, writer) = StreamingRecorder::create(path, DEFAULT_RECORDER_CAPACITY).await?;
        let recorder = Arc::new(recorder);
        observer = observer.with(recorder.clone());
        recording = Some((recorder, writer));
    }

    let acceptor = Arc::new(BridgeAcceptor::bind(config, Arc::new(observer)).await?);
    println!(
        "Relaying {} -> {} (Ctrl-C to stop)",
        acceptor.local_addr(),
        acceptor.config().backend_addr
    );

    let shutdown = acceptor.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Shutting down...");
        }
        shutdown.cancel();
    });

    acceptor.run().await?;

    if let (Some((recorder, writer)), Some(path)) = (recording, record_path) {
        recorder.close();
        let written = writer.finish().await?;
        println!(
            "Recorded {written} frames to {path} ({} dropped)",
            recorder.dropped()
        );
    }

    Ok(())
}
