//! Ordered, at-least-once delivery on top of [`MessageChannel`].
//!
//! The tracker numbers every outbound envelope, queues it while the
//! connection is down and flushes the queue strictly in enqueue order once
//! the manager reports Connected again. Each envelope that reaches the
//! transport leaves an [`AckRecord`]; reconciling those records against an
//! expected count yields a [`LossReport`].
//!
//! ```ignore
//! let tracker = DeliveryGuaranteeTracker::new(channel, AckPolicy::OnWrite);
//! for n in 0..10 {
//!     tracker.send(MessageEnvelope::new("tick").with_field("n", n)).await?;
//! }
//! manager.connect().await?;
//! tracker.flush().await?;
//! assert_eq!(tracker.detect_loss(10).lost, 0);
//! ```

use crate::channel::MessageChannel;
use crate::envelope::MessageEnvelope;
use crate::error::Error;
use crate::state::ConnectionState;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// What counts as an acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// A successful write to the transport
    #[default]
    OnWrite,
    /// An inbound envelope of `ack_type` whose correlation id names the message
    Peer { ack_type: String },
}

/// Outcome of [`DeliveryGuaranteeTracker::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Written to the transport
    Sent,
    /// Held in the queue until the next flush
    Queued,
}

/// A message waiting for the transport
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub envelope: MessageEnvelope,
    pub sequence: u64,
    pub enqueued_at: Instant,
    /// Failed write attempts so far
    pub attempts: u32,
}

/// Bookkeeping for a message that reached the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub message_id: String,
    pub sequence: u64,
    pub sent_at: Instant,
    pub acked_at: Option<Instant>,
}

impl AckRecord {
    /// Time from write to acknowledgment
    pub fn latency(&self) -> Option<Duration> {
        self.acked_at
            .map(|acked| acked.saturating_duration_since(self.sent_at))
    }
}

/// Reconciliation of ack records against an expected message count
#[derive(Debug, Clone, PartialEq)]
pub struct LossReport {
    pub expected: u64,
    /// Messages written to the transport
    pub sent: u64,
    /// Messages acknowledged
    pub received: u64,
    pub lost: u64,
    /// `lost / expected`, 0 when nothing was expected
    pub loss_rate: f64,
    /// Repeated acks, repeated inbound ids and repeated writes of one id
    pub duplicates: u64,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<PendingMessage>,
    next_sequence: u64,
    records: Vec<AckRecord>,
    index: HashMap<String, usize>,
    seen_inbound: HashSet<String>,
    duplicates: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            next_sequence: 1,
            records: Vec::new(),
            index: HashMap::new(),
            seen_inbound: HashSet::new(),
            duplicates: 0,
        }
    }

    /// Record a completed write.
    ///
    /// A message id already on record is a duplicate: the existing record
    /// stays and only picks up an acknowledgment it did not have yet.
    fn insert_record(&mut self, record: AckRecord) -> bool {
        if let Some(&position) = self.index.get(&record.message_id) {
            self.duplicates += 1;
            let existing = &mut self.records[position];
            if existing.acked_at.is_none() {
                existing.acked_at = record.acked_at;
            }
            return false;
        }
        self.index
            .insert(record.message_id.clone(), self.records.len());
        self.records.push(record);
        true
    }
}

struct Inner {
    channel: Arc<MessageChannel>,
    policy: AckPolicy,
    capacity: usize,
    /// Never held across an await
    queue: parking_lot::Mutex<QueueState>,
    /// Single writer for the transport
    flush_lock: Mutex<()>,
}

/// Queuing, ordering and loss accounting layered over a [`MessageChannel`].
///
/// # Thread Safety
///
/// `send` may be called concurrently. Sequence numbers are assigned under
/// the queue lock and only one task flushes at a time, so the transport sees
/// messages in enqueue order.
pub struct DeliveryGuaranteeTracker {
    inner: Arc<Inner>,
    watcher: JoinHandle<()>,
}

impl DeliveryGuaranteeTracker {
    /// Create a tracker and start flushing on every transition to Connected.
    ///
    /// Queue capacity comes from the connection's `queue_capacity`.
    /// Must be called within a Tokio runtime.
    pub fn new(channel: Arc<MessageChannel>, policy: AckPolicy) -> Self {
        let manager = channel.manager();
        let capacity = manager.config().queue_capacity;
        let states = manager.subscribe();

        let inner = Arc::new(Inner {
            channel,
            policy,
            capacity,
            queue: parking_lot::Mutex::new(QueueState::new()),
            flush_lock: Mutex::new(()),
        });

        let watcher = tokio::spawn(Arc::clone(&inner).watch_reconnects(states));

        Self { inner, watcher }
    }

    pub fn policy(&self) -> &AckPolicy {
        &self.inner.policy
    }

    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.inner.channel
    }

    /// Number each envelope and deliver it, or queue it while disconnected.
    ///
    /// Never suspends on a disconnected connection. An envelope without a
    /// correlation id gets its sequence number as id.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] when `queue_capacity` messages are pending
    /// - [`Error::Closed`] after the connection was closed
    /// - [`Error::InvalidEnvelope`] if `type` is empty
    pub async fn send(&self, mut envelope: MessageEnvelope) -> Result<DeliveryStatus, Error> {
        envelope.validate()?;

        let manager = self.inner.channel.manager();
        if manager.state().is_closed() {
            return Err(Error::Closed);
        }

        let sequence = {
            let mut queue = self.inner.queue.lock();
            if queue.pending.len() >= self.inner.capacity {
                warn!(
                    "[CLIENT-{}] Delivery queue full, rejecting {} message",
                    manager.id(),
                    envelope.message_type
                );
                return Err(Error::QueueFull {
                    capacity: self.inner.capacity,
                });
            }

            let sequence = queue.next_sequence;
            queue.next_sequence += 1;
            if envelope.correlation_id.is_none() {
                envelope.correlation_id = Some(sequence.to_string());
            }
            queue.pending.push_back(PendingMessage {
                envelope,
                sequence,
                enqueued_at: Instant::now(),
                attempts: 0,
            });
            sequence
        };

        if manager.state() != ConnectionState::Connected {
            debug!(
                "[CLIENT-{}] Queued message #{} while {}",
                manager.id(),
                sequence,
                manager.state()
            );
            return Ok(DeliveryStatus::Queued);
        }

        match self.inner.flush().await {
            Ok(_) => {}
            Err(Error::Closed) => return Err(Error::Closed),
            Err(e) => debug!(
                "[CLIENT-{}] Message #{} stays queued: {}",
                manager.id(),
                sequence,
                e
            ),
        }

        let still_pending = self
            .inner
            .queue
            .lock()
            .pending
            .iter()
            .any(|m| m.sequence == sequence);
        Ok(if still_pending {
            DeliveryStatus::Queued
        } else {
            DeliveryStatus::Sent
        })
    }

    /// Write queued messages in order until the queue is empty or a write fails.
    ///
    /// Returns the number of messages written. A failed message stays at the
    /// front of the queue.
    pub async fn flush(&self) -> Result<usize, Error> {
        self.inner.flush().await
    }

    /// Receive the next envelope, consuming peer acknowledgments on the way.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<MessageEnvelope, Error> {
        let channel = &self.inner.channel;
        let wait = timeout.unwrap_or(channel.manager().config().io_timeout);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let envelope = match channel.receive(Some(remaining)).await {
                Ok(envelope) => envelope,
                Err(Error::Timeout { .. }) => {
                    return Err(Error::Timeout {
                        operation: "receive",
                        after: wait,
                    })
                }
                Err(e) => return Err(e),
            };

            if let AckPolicy::Peer { ack_type } = &self.inner.policy {
                if envelope.message_type == *ack_type {
                    match envelope.correlation_id.as_deref() {
                        Some(id) => {
                            self.record_ack(id);
                        }
                        None => warn!(
                            "[CLIENT-{}] Ack without correlation id ignored",
                            channel.manager().id()
                        ),
                    }
                    continue;
                }
            }

            if let Some(id) = &envelope.correlation_id {
                let mut queue = self.inner.queue.lock();
                if !queue.seen_inbound.insert(id.clone()) {
                    queue.duplicates += 1;
                    debug!(
                        "[CLIENT-{}] Duplicate inbound message {}",
                        channel.manager().id(),
                        id
                    );
                }
            }

            return Ok(envelope);
        }
    }

    /// Mark `message_id` acknowledged.
    ///
    /// Returns `false` for unknown ids and for repeats, which count as duplicates.
    pub fn record_ack(&self, message_id: &str) -> bool {
        let mut guard = self.inner.queue.lock();
        let queue = &mut *guard;

        let Some(&position) = queue.index.get(message_id) else {
            debug!("Ack for unknown message {}", message_id);
            return false;
        };

        let record = &mut queue.records[position];
        if record.acked_at.is_some() {
            queue.duplicates += 1;
            return false;
        }
        record.acked_at = Some(Instant::now());
        true
    }

    /// Records for every message that reached the transport, in send order
    pub fn ack_records(&self) -> Vec<AckRecord> {
        self.inner.queue.lock().records.clone()
    }

    /// Messages still waiting for the transport
    pub fn pending(&self) -> Vec<PendingMessage> {
        self.inner.queue.lock().pending.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.queue.lock().pending.len()
    }

    /// Discard every queued message, returning them.
    pub fn drop_pending(&self) -> Vec<PendingMessage> {
        let dropped: Vec<PendingMessage> = self.inner.queue.lock().pending.drain(..).collect();
        if !dropped.is_empty() {
            info!(
                "[CLIENT-{}] Dropped {} pending message(s)",
                self.inner.channel.manager().id(),
                dropped.len()
            );
        }
        dropped
    }

    /// `true` if `sequence_ids` never decrease.
    pub fn validate_ordering(sequence_ids: &[u64]) -> bool {
        sequence_ids.windows(2).all(|pair| pair[0] <= pair[1])
    }

    /// Reconcile ack records against `expected` messages.
    pub fn detect_loss(&self, expected: u64) -> LossReport {
        let queue = self.inner.queue.lock();

        let sent = queue.records.len() as u64;
        let received = queue
            .records
            .iter()
            .filter(|r| r.acked_at.is_some())
            .count() as u64;
        let lost = expected.saturating_sub(received);
        let loss_rate = if expected == 0 {
            0.0
        } else {
            lost as f64 / expected as f64
        };

        LossReport {
            expected,
            sent,
            received,
            lost,
            loss_rate,
            duplicates: queue.duplicates,
        }
    }
}

impl Drop for DeliveryGuaranteeTracker {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl Inner {
    async fn flush(&self) -> Result<usize, Error> {
        let _writer = self.flush_lock.lock().await;
        let mut flushed = 0;

        loop {
            let next = self
                .queue
                .lock()
                .pending
                .front()
                .map(|m| (m.sequence, m.envelope.clone()));
            let Some((sequence, envelope)) = next else {
                break;
            };

            if let Err(e) = self.channel.send(&envelope).await {
                if let Some(front) = self.queue.lock().pending.front_mut() {
                    if front.sequence == sequence {
                        front.attempts += 1;
                    }
                }
                return Err(e);
            }

            let now = Instant::now();
            let mut queue = self.queue.lock();
            // drop_pending may have emptied the queue during the write
            if queue.pending.front().map(|m| m.sequence) == Some(sequence) {
                queue.pending.pop_front();
            }
            let message_id = envelope
                .correlation_id
                .unwrap_or_else(|| sequence.to_string());
            let fresh = queue.insert_record(AckRecord {
                message_id: message_id.clone(),
                sequence,
                sent_at: now,
                acked_at: matches!(self.policy, AckPolicy::OnWrite).then_some(now),
            });
            if !fresh {
                warn!(
                    "[CLIENT-{}] Message id {} written again",
                    self.channel.manager().id(),
                    message_id
                );
            }
            flushed += 1;
        }

        if flushed > 0 {
            debug!(
                "[CLIENT-{}] Flushed {} message(s)",
                self.channel.manager().id(),
                flushed
            );
        }
        Ok(flushed)
    }

    async fn watch_reconnects(self: Arc<Self>, mut states: watch::Receiver<ConnectionState>) {
        loop {
            if states.changed().await.is_err() {
                return;
            }
            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Connected => {
                    let pending = self.queue.lock().pending.len();
                    if pending == 0 {
                        continue;
                    }
                    info!(
                        "[CLIENT-{}] Connected, flushing {} queued message(s)",
                        self.channel.manager().id(),
                        pending
                    );
                    if let Err(e) = self.flush().await {
                        warn!(
                            "[CLIENT-{}] Flush after reconnect stopped: {}",
                            self.channel.manager().id(),
                            e
                        );
                    }
                }
                ConnectionState::Closed => return,
                _ => {}
            }
        }
    }
}
