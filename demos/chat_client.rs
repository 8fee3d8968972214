//! Example: an authenticated chat client that keeps messages across outages
//!
//! Connects to `WS_URL` (default `ws://127.0.0.1:9000/ws`) with the bearer
//! token from `WS_TOKEN`, queues a few messages, then prints whatever the
//! server sends for 30 seconds.
//!
//! Run with: WS_TOKEN=... cargo run --example chat_client

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use ws_resilient_client::{
    AckPolicy, ClientConfig, ConnectionManager, DeliveryGuaranteeTracker, ErrorKind,
    MessageChannel, MessageEnvelope,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    let url = std::env::var("WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:9000/ws".to_string());
    let mut builder = ClientConfig::builder(url)
        .max_retries(5)
        .io_timeout(Duration::from_secs(5));
    if let Ok(token) = std::env::var("WS_TOKEN") {
        builder = builder.auth_token(token);
    }
    let config = builder.build()?;

    let manager = Arc::new(ConnectionManager::new(config));
    let channel = Arc::new(MessageChannel::new(manager.clone()));
    let tracker = DeliveryGuaranteeTracker::new(channel, AckPolicy::OnWrite);

    // Queued until the connection is up, then flushed in order
    for n in 0..3 {
        let envelope = MessageEnvelope::new("chat.send").with_field("text", format!("hello #{}", n));
        let status = tracker.send(envelope).await?;
        info!("Message {} status: {:?}", n, status);
    }

    manager.connect().await?;
    info!("Connected, state: {}", manager.state());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    info!("Listening for 30 seconds...");
    while tokio::time::Instant::now() < deadline {
        match tracker.receive(Some(Duration::from_secs(5))).await {
            Ok(envelope) => info!("Received {}: {:?}", envelope.message_type, envelope.payload),
            Err(e) if e.kind() == ErrorKind::Timeout => continue,
            Err(e) if e.kind() == ErrorKind::MalformedPayload => warn!("Skipping frame: {}", e),
            Err(e) => {
                warn!("Receive failed: {}", e);
                break;
            }
        }
    }

    let report = tracker.detect_loss(3);
    info!("Loss report: {:?}", report);

    // Print final metrics
    let snapshot = manager.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Reconnections: {}", snapshot.reconnections_total);
    info!("  Messages sent: {}", snapshot.messages_sent_total);
    info!("  Messages received: {}", snapshot.messages_received_total);

    // Graceful shutdown
    manager.close().await?;
    info!("Client closed");

    Ok(())
}
