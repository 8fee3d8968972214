//! # ws-resilient-client
//!
//! An authenticated WebSocket client that survives its network.
//!
//! ## Features
//!
//! - **Bearer authentication** on the upgrade request (header, query parameter, or both)
//! - **Auto-reconnection** with exponential backoff and optional bounded jitter
//! - **Explicit state machine** observable through a watch channel
//! - **Timeout-bounded** send and receive of JSON envelopes
//! - **Delivery guarantees**: in-order queuing while disconnected, ack tracking, loss detection
//! - **Health monitoring** via ping/pong
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ws_resilient_client::{ClientConfig, ConnectionManager, MessageChannel, MessageEnvelope};
//!
//! let config = ClientConfig::builder("wss://chat.example.com/ws")
//!     .auth_token(token)
//!     .max_retries(5)
//!     .build()?;
//!
//! let manager = Arc::new(ConnectionManager::new(config));
//! manager.connect().await?;
//!
//! let channel = MessageChannel::new(manager.clone());
//! let reply = channel
//!     .send_and_wait(&MessageEnvelope::new("ping").with_correlation_id("1"), None)
//!     .await?;
//!
//! manager.close().await?;
//! ```

mod auth;
mod channel;
mod config;
mod connection;
mod delivery;
mod envelope;
mod error;
mod health;
mod metrics;
mod state;

pub use auth::{redact_url, AuthHandshake, ConnectionParams, TokenPlacement, TOKEN_QUERY_PARAM};
pub use channel::MessageChannel;
pub use config::{
    BackoffPolicy, ClientConfig, ClientConfigBuilder, ClientOptions, ConfigError, KeepAliveConfig,
};
pub use connection::ConnectionManager;
pub use delivery::{
    AckPolicy, AckRecord, DeliveryGuaranteeTracker, DeliveryStatus, LossReport, PendingMessage,
};
pub use envelope::MessageEnvelope;
pub use error::{Error, ErrorKind};
pub use metrics::{LastError, Metrics, MetricsSnapshot};
pub use state::ConnectionState;

// Re-exported so callers can cancel a connect cycle without a direct dependency
pub use tokio_util::sync::CancellationToken;

/// Result type for ws-resilient-client operations
pub type Result<T> = std::result::Result<T, Error>;
