use crate::connection::{ConnectionManager, Inbound};
use crate::envelope::MessageEnvelope;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::state::ConnectionState;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Envelope-level send/receive over a [`ConnectionManager`].
///
/// Sends fail fast with [`Error::NotConnected`] while the connection is down;
/// use [`DeliveryGuaranteeTracker`](crate::DeliveryGuaranteeTracker) to queue
/// across disconnections.
pub struct MessageChannel {
    manager: Arc<ConnectionManager>,
    metrics: Arc<Metrics>,
    /// Envelopes received while `send_and_wait` looked for a specific reply
    backlog: parking_lot::Mutex<VecDeque<MessageEnvelope>>,
}

impl MessageChannel {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let metrics = manager.metrics();
        Self {
            manager,
            metrics,
            backlog: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// The underlying connection
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Serialize and write `envelope` as one text frame.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidEnvelope`] if `type` is empty
    /// - [`Error::NotConnected`] unless the state is Connected
    /// - [`Error::Timeout`] if the write exceeds `io_timeout`
    pub async fn send(&self, envelope: &MessageEnvelope) -> Result<(), Error> {
        let frame = envelope.to_message()?;
        self.manager.send_frame(frame).await?;
        self.metrics.record_message_sent();
        debug!(
            "[CLIENT-{}] Sent {} message",
            self.manager.id(),
            envelope.message_type
        );
        Ok(())
    }

    /// Wait for the next inbound envelope, up to `timeout` (default `io_timeout`).
    ///
    /// Returns [`Error::MalformedPayload`] for a frame that does not decode;
    /// the connection is unaffected and the next call reads the next frame.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<MessageEnvelope, Error> {
        if self.manager.state() == ConnectionState::Closed {
            return Err(Error::Closed);
        }
        if let Some(envelope) = self.backlog.lock().pop_front() {
            return Ok(envelope);
        }
        let wait = timeout.unwrap_or(self.manager.config().io_timeout);
        self.receive_frame(wait).await
    }

    /// Send `envelope` and wait for the reply.
    ///
    /// With a correlation id, waits for the envelope carrying the same id and
    /// keeps anything else for later `receive` calls. Without one, the next
    /// envelope is the reply. A failed send returns without waiting.
    pub async fn send_and_wait(
        &self,
        envelope: &MessageEnvelope,
        timeout: Option<Duration>,
    ) -> Result<MessageEnvelope, Error> {
        self.send(envelope).await?;

        let wait = timeout.unwrap_or(self.manager.config().io_timeout);
        let Some(expected) = envelope.correlation_id.as_deref() else {
            return self.receive(Some(wait)).await;
        };

        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    operation: "send_and_wait",
                    after: wait,
                });
            }

            let reply = match self.receive_frame(remaining).await {
                Ok(reply) => reply,
                Err(Error::Timeout { .. }) => {
                    return Err(Error::Timeout {
                        operation: "send_and_wait",
                        after: wait,
                    })
                }
                // Not ours to judge; the caller's next receive would have seen it too
                Err(Error::MalformedPayload { .. }) => continue,
                Err(e) => return Err(e),
            };

            if reply.correlation_id.as_deref() == Some(expected) {
                return Ok(reply);
            }
            self.backlog.lock().push_back(reply);
        }
    }

    /// Envelopes held back by `send_and_wait`
    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    async fn receive_frame(&self, wait: Duration) -> Result<MessageEnvelope, Error> {
        let decoded = match self.manager.recv_frame(wait).await? {
            Inbound::Text(text) => MessageEnvelope::from_json(&text),
            Inbound::Binary(data) => MessageEnvelope::from_bytes(&data),
        };

        decoded.map_err(|err| {
            self.metrics.record_malformed();
            self.metrics.record_error(&err);
            warn!(
                "[CLIENT-{}] Discarding malformed inbound frame: {}",
                self.manager.id(),
                err
            );
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::error::ErrorKind;

    fn channel() -> MessageChannel {
        let config = ClientConfig::builder("ws://127.0.0.1:1/ws")
            .io_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        MessageChannel::new(Arc::new(ConnectionManager::new(config)))
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_fast() {
        let channel = channel();
        let err = channel
            .send(&MessageEnvelope::new("ping"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
        assert_eq!(channel.manager().metrics().messages_sent(), 0);
    }

    #[tokio::test]
    async fn test_send_validates_before_state() {
        let channel = channel();
        let err = channel.send(&MessageEnvelope::new("")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_receive_uses_default_timeout() {
        let channel = channel();
        let started = Instant::now();
        let err = channel.receive(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_send_and_wait_short_circuits_on_send_failure() {
        let channel = channel();
        let request = MessageEnvelope::new("ping").with_correlation_id("1");
        let err = channel
            .send_and_wait(&request, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotConnected {
                state: ConnectionState::Disconnected
            }
        ));
    }

    #[tokio::test]
    async fn test_backlog_served_first() {
        let channel = channel();
        channel
            .backlog
            .lock()
            .push_back(MessageEnvelope::new("queued"));

        let envelope = channel.receive(Some(Duration::from_millis(1))).await.unwrap();
        assert_eq!(envelope.message_type, "queued");
        assert_eq!(channel.backlog_len(), 0);
    }
}
