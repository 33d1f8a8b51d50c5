//! Counter loopback demo
//!
//! Run the server on one machine (Linux only):
//!
//! ```text
//! cargo run --example counter-loopback -- counter --serve
//! ```
//!
//! and the client on another:
//!
//! ```text
//! cargo run --example counter-loopback -- counter
//! ```
//!
//! The server publishes an 8-byte `CountMessage` once per second; the
//! client prints every broadcast and echoes it straight back on the
//! update path, which the server prints in turn.

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use topic_ble::{BincodeCodec, BleTopicClient, BleTopicConfig};

/// Fixed-layout message: i16 + u8 + u8 + f32, little-endian, 8 bytes.
/// Small enough for the 23-byte baseline MTU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CountMessage {
    id: i16,
    count: u8,
    /// Percentage scaled to 0..=255.
    percent: u8,
    value: f32,
}

#[derive(Parser)]
#[command(about = "BLE topic loopback demo")]
struct Cli {
    /// Topic name
    topic: String,

    /// Run the topic server (Linux only) instead of the client
    #[arg(long)]
    serve: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> topic_ble::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if cli.serve {
        serve(&cli.topic).await
    } else {
        run_client(&cli.topic).await
    }
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();
}

#[cfg(target_os = "linux")]
async fn serve(topic: &str) -> topic_ble::Result<()> {
    use std::time::Duration;
    use topic_ble::BleTopicServer;
    use tracing::warn;

    let config = BleTopicConfig::new();
    let mut server = BleTopicServer::new(topic, config, BincodeCodec::<CountMessage>::new());
    server.start().await?;

    let mut incoming = server.take_incoming()?;
    let echoes = tokio::spawn(async move {
        while let Some(message) = incoming.recv().await {
            info!("Echoed back by client: {message:?}");
        }
    });

    let mut count: u8 = 0;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                let message = CountMessage {
                    id: 0xEF,
                    count,
                    percent: (0.65 * 255.0) as u8,
                    value: 8.598,
                };
                if let Err(e) = server.broadcast(&message).await {
                    warn!("Publish failed: {e}");
                }
                count = count.wrapping_add(1);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server.shutdown().await;
    echoes.abort();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn serve(_topic: &str) -> topic_ble::Result<()> {
    Err(topic_ble::BleTopicError::TransportUnavailable(
        "the peripheral role requires BlueZ on Linux".to_string(),
    ))
}

async fn run_client(topic: &str) -> topic_ble::Result<()> {
    let config = BleTopicConfig::new();
    let mut client = BleTopicClient::new(topic, config, BincodeCodec::<CountMessage>::new());
    client.start().await?;

    let mut incoming = client.take_incoming()?;
    loop {
        tokio::select! {
            message = incoming.recv() => match message {
                Some(message) => {
                    info!("Broadcast: {message:?}");
                    // Straight back out on the update path.
                    client.update(&message).await?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    Ok(())
}
