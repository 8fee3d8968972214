use crate::auth::{redact_url, AuthHandshake};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::health::KeepAlive;
use crate::metrics::Metrics;
use crate::state::ConnectionState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Data frame handed from the monitor task to receivers
#[derive(Debug)]
pub(crate) enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Write half of the socket. Every state transition happens with this locked.
struct Link {
    sink: Option<WsSink>,
    /// Cancelled by a writer that hit a transport error, so the monitor reconnects
    session: CancellationToken,
}

struct Shared {
    id: u64,
    config: ClientConfig,
    auth: AuthHandshake,
    metrics: Arc<Metrics>,
    state_tx: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
    /// Serializes connect cycles (caller connect vs. monitor reconnect).
    /// Lock order: lifecycle, then link.
    lifecycle: Mutex<()>,
    /// Cancelled once by `close()`
    shutdown: CancellationToken,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: Mutex<mpsc::Receiver<Inbound>>,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Owns a single logical WebSocket connection and its state machine.
///
/// `connect()` dials with the configured credential and retries with backoff.
/// Once connected, a background monitor task watches the socket and
/// reconnects on transport failure without the caller polling. Use
/// [`MessageChannel`](crate::MessageChannel) for structured message exchange.
///
/// # Thread Safety
///
/// All methods take `&self` and may be called from multiple tasks. The write
/// half and the state field are guarded by one `tokio::sync::Mutex`, so at
/// most one transition or frame write is in flight at a time.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a disconnected client. No I/O happens until `connect()`.
    pub fn new(config: ClientConfig) -> Self {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer);

        Self {
            shared: Arc::new(Shared {
                id,
                auth: AuthHandshake::new(config.token_placement),
                config,
                metrics: Arc::new(Metrics::new()),
                state_tx,
                link: Mutex::new(Link {
                    sink: None,
                    session: CancellationToken::new(),
                }),
                lifecycle: Mutex::new(()),
                shutdown: CancellationToken::new(),
                inbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
                monitor: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Identifier used in log lines
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Check if the client is currently connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver notified on every state transition
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Get the metrics for this client
    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Connect, retrying with backoff up to `max_retries` attempts.
    ///
    /// Succeeds immediately if already connected.
    ///
    /// # Errors
    ///
    /// - [`Error::Dial`] once every attempt failed (state becomes Failed)
    /// - [`Error::AuthRejected`] on the first rejected handshake, without retrying
    /// - [`Error::Closed`] if the client was closed
    pub async fn connect(&self) -> Result<(), Error> {
        self.connect_with_cancel(&CancellationToken::new()).await
    }

    /// Like [`connect`](Self::connect), aborting when `cancel` fires.
    ///
    /// Cancellation closes any half-open socket, leaves the state
    /// Disconnected (not Failed) and returns [`Error::Cancelled`]. Dropping
    /// the returned future has the same effect on the state.
    pub async fn connect_with_cancel(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let shared = &self.shared;

        let _lifecycle = tokio::select! {
            guard = shared.lifecycle.lock() => guard,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        {
            let mut link = shared.link.lock().await;
            match shared.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closing | ConnectionState::Closed => return Err(Error::Closed),
                _ => {}
            }
            shared.transition(&mut link, ConnectionState::Connecting);
        }

        let mut guard = AttemptGuard {
            shared: shared.as_ref(),
            armed: true,
        };

        info!(
            "[CLIENT-{}] Connecting to {}",
            shared.id,
            redact_url(&shared.config.transport_url)
        );

        match shared.establish(cancel).await {
            Ok((stream, latency)) => {
                let installed = shared.install(stream, latency, false).await;
                guard.armed = false;
                let (source, session) = installed?;

                let monitor = tokio::spawn(Arc::clone(shared).monitor(source, session));
                if let Some(previous) = shared.monitor.lock().replace(monitor) {
                    // Left over from a cycle that ended in Failed
                    previous.abort();
                }
                Ok(())
            }
            Err(err) => {
                let mut link = shared.link.lock().await;
                guard.armed = false;
                match &err {
                    Error::Cancelled => {
                        info!("[CLIENT-{}] Connect cancelled", shared.id);
                        shared.transition(&mut link, ConnectionState::Disconnected);
                    }
                    Error::Closed => {}
                    _ => {
                        error!("[CLIENT-{}] Connect failed: {}", shared.id, err);
                        shared.metrics.set_last_error(&err);
                        shared.transition(&mut link, ConnectionState::Failed);
                    }
                }
                Err(err)
            }
        }
    }

    /// Close the connection. Idempotent: closing a closed client succeeds.
    ///
    /// Interrupts any connect or reconnect cycle in progress, sends a close
    /// frame if connected, and waits for the monitor task to stop.
    pub async fn close(&self) -> Result<(), Error> {
        let shared = &self.shared;
        shared.shutdown.cancel();

        {
            let mut link = shared.link.lock().await;
            if shared.state() == ConnectionState::Closed {
                return Ok(());
            }
            shared.transition(&mut link, ConnectionState::Closing);
            info!("[CLIENT-{}] Closing connection", shared.id);

            if let Some(mut sink) = link.sink.take() {
                match timeout(shared.config.io_timeout, sink.close()).await {
                    Ok(Ok(())) => debug!("[CLIENT-{}] Close frame sent", shared.id),
                    Ok(Err(e)) => debug!("[CLIENT-{}] Close frame failed: {}", shared.id, e),
                    Err(_) => debug!("[CLIENT-{}] Close frame timed out", shared.id),
                }
            }

            shared.metrics.record_disconnect();
            shared.transition(&mut link, ConnectionState::Closed);
        }

        let monitor = shared.monitor.lock().take();
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("[CLIENT-{}] Monitor task panicked: {:?}", shared.id, e);
                }
            }
        }

        info!("[CLIENT-{}] Connection closed", shared.id);
        Ok(())
    }

    /// Write one frame, bounded by `io_timeout`.
    ///
    /// A write failure ends the session so the monitor reconnects.
    pub(crate) async fn send_frame(&self, frame: Message) -> Result<(), Error> {
        self.shared.send_frame(frame).await
    }

    /// Wait up to `wait` for the next inbound data frame.
    pub(crate) async fn recv_frame(&self, wait: Duration) -> Result<Inbound, Error> {
        let shared = &self.shared;
        if shared.state() == ConnectionState::Closed {
            return Err(Error::Closed);
        }

        let received = timeout(wait, async {
            let mut rx = shared.inbound_rx.lock().await;
            tokio::select! {
                frame = rx.recv() => frame.ok_or(Error::Closed),
                _ = shared.shutdown.cancelled() => Err(Error::Closed),
            }
        })
        .await;

        match received {
            Ok(frame) => frame,
            Err(_) => Err(Error::Timeout {
                operation: "receive",
                after: wait,
            }),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        if let Some(handle) = self.shared.monitor.lock().take() {
            handle.abort();
        }
    }
}

/// Returns the state to Disconnected when a connect future is dropped mid-cycle.
///
/// Runs without the link lock: at this point no socket has been installed.
struct AttemptGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.state_tx.send_if_modified(|state| {
                if state.is_connecting() {
                    *state = ConnectionState::Disconnected;
                    true
                } else {
                    false
                }
            });
        }
    }
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Move to `next`. Requires the link lock.
    fn transition(&self, _link: &mut Link, next: ConnectionState) -> bool {
        let current = self.state();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(
                "[CLIENT-{}] Ignoring invalid transition {} -> {}",
                self.id, current, next
            );
            return false;
        }
        debug!("[CLIENT-{}] State {} -> {}", self.id, current, next);
        self.state_tx.send_replace(next);
        true
    }

    /// Run dial attempts until one succeeds, retries run out, or the cycle is interrupted.
    async fn establish(&self, cancel: &CancellationToken) -> Result<(WsStream, Duration), Error> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error: Option<Error> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.backoff.next_delay(attempt - 1);
                self.metrics.record_retry();
                debug!(
                    "[CLIENT-{}] Retrying in {:?} (attempt {}/{})",
                    self.id,
                    delay,
                    attempt + 1,
                    attempts
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = self.shutdown.cancelled() => return Err(Error::Closed),
                }
            }

            let started = Instant::now();
            // Dropping the dial future on cancellation closes any half-open socket
            let result = tokio::select! {
                result = timeout(self.config.connect_timeout, self.dial()) => result,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.shutdown.cancelled() => return Err(Error::Closed),
            };

            let err = match result {
                Ok(Ok(stream)) => return Ok((stream, started.elapsed())),
                Ok(Err(e)) => e,
                Err(_) => Error::dial(format!(
                    "Connection timeout after {:?}",
                    self.config.connect_timeout
                )),
            };

            self.metrics.record_error(&err);
            if !err.is_retryable() {
                warn!(
                    "[CLIENT-{}] Attempt {}/{} failed with non-retryable error: {}",
                    self.id,
                    attempt + 1,
                    attempts,
                    err
                );
                return Err(err);
            }

            debug!(
                "[CLIENT-{}] Attempt {}/{} failed: {}",
                self.id,
                attempt + 1,
                attempts,
                err
            );
            last_error = Some(err);
        }

        let reason = match last_error {
            Some(Error::Dial { reason, .. }) => reason,
            Some(other) => other.to_string(),
            None => "no attempts made".to_string(),
        };
        Err(Error::Dial { attempts, reason })
    }

    /// One dial + authenticated handshake
    async fn dial(&self) -> Result<WsStream, Error> {
        let params = self
            .auth
            .build_connection_params(self.config.auth_token.as_deref())?;
        if params.is_anonymous() {
            debug!("[CLIENT-{}] No credential configured", self.id);
        }
        let request = params.into_request(&self.config.transport_url)?;
        connect_websocket(request, &self.config.transport_url, self.config.verify_tls).await
    }

    /// Hand the write half to the link and mark the client connected.
    async fn install(
        &self,
        stream: WsStream,
        latency: Duration,
        is_reconnect: bool,
    ) -> Result<(WsSource, CancellationToken), Error> {
        let (sink, source) = stream.split();
        let mut link = self.link.lock().await;

        if self.shutdown.is_cancelled() {
            // close() won the race; dropping both halves closes the socket
            return Err(Error::Closed);
        }

        link.sink = Some(sink);
        link.session = CancellationToken::new();
        let session = link.session.clone();
        self.transition(&mut link, ConnectionState::Connected);

        self.metrics.record_connection(latency);
        if is_reconnect {
            self.metrics.record_reconnection();
        }
        info!(
            "[CLIENT-{}] Connected to {} in {:?}",
            self.id,
            redact_url(&self.config.transport_url),
            latency
        );

        Ok((source, session))
    }

    async fn send_frame(&self, frame: Message) -> Result<(), Error> {
        let mut guard = self.link.lock().await;
        let link = &mut *guard;

        let state = self.state();
        if state.is_closed() {
            return Err(Error::Closed);
        }
        let sink = match link.sink.as_mut() {
            Some(sink) if state == ConnectionState::Connected => sink,
            _ => return Err(Error::NotConnected { state }),
        };

        match timeout(self.config.io_timeout, sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("[CLIENT-{}] Failed to send frame: {}", self.id, e);
                link.session.cancel();
                Err(Error::WebSocket(e))
            }
            Err(_) => Err(Error::Timeout {
                operation: "send",
                after: self.config.io_timeout,
            }),
        }
    }

    /// Monitor loop: runs sessions back to back until close or Failed.
    async fn monitor(self: Arc<Self>, source: WsSource, session: CancellationToken) {
        let (mut source, mut session) = (source, session);

        loop {
            let Some(reason) = self.run_session(source, &session).await else {
                break;
            };
            match self.reconnect(reason).await {
                Some((next_source, next_session)) => {
                    source = next_source;
                    session = next_session;
                }
                None => break,
            }
        }

        debug!("[CLIENT-{}] Monitor stopped", self.id);
    }

    /// Read until the session ends.
    ///
    /// Returns `None` on shutdown, otherwise the reason the transport was lost.
    async fn run_session(&self, mut source: WsSource, session: &CancellationToken) -> Option<Error> {
        let mut keepalive = KeepAlive::new(self.config.keepalive.clone());
        // Pre-allocate ping data to avoid allocation in the loop
        let ping_data: Vec<u8> = format!("ping-{}", self.id).into_bytes();

        loop {
            let next_check = keepalive.time_until_next_check();

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,

                _ = session.cancelled() => {
                    return Some(Error::ConnectionLost("write failed".to_string()));
                }

                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.deliver(Inbound::Text(text)),
                    Some(Ok(Message::Binary(data))) => self.deliver(Inbound::Binary(data)),
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite queues the pong reply itself
                        trace!("[CLIENT-{}] Received ping", self.id);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        trace!("[CLIENT-{}] Received pong", self.id);
                        keepalive.record_pong_received();
                        self.metrics.record_pong();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = match frame {
                            Some(f) => format!("peer closed ({}: {})", u16::from(f.code), f.reason),
                            None => "peer closed".to_string(),
                        };
                        info!("[CLIENT-{}] Received close frame: {}", self.id, reason);
                        return Some(Error::ConnectionLost(reason));
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        warn!("[CLIENT-{}] WebSocket error: {}", self.id, e);
                        return Some(Error::WebSocket(e));
                    }
                    None => {
                        info!("[CLIENT-{}] WebSocket stream ended", self.id);
                        return Some(Error::ConnectionLost("stream ended".to_string()));
                    }
                },

                _ = tokio::time::sleep(next_check) => {
                    // Check if pong is overdue (this has side effects - only call once)
                    if keepalive.check_and_record_pong_timeout() {
                        warn!(
                            "[CLIENT-{}] Pong timeout (missed: {})",
                            self.id,
                            keepalive.consecutive_missed()
                        );
                        if keepalive.is_unhealthy() {
                            return Some(Error::ConnectionLost(format!(
                                "{} consecutive pongs missed",
                                keepalive.consecutive_missed()
                            )));
                        }
                    }

                    if keepalive.should_send_ping() {
                        if let Err(e) = self.send_frame(Message::Ping(ping_data.clone())).await {
                            warn!("[CLIENT-{}] Failed to send ping: {}", self.id, e);
                            return Some(e);
                        }
                        keepalive.record_ping_sent();
                        self.metrics.record_ping();
                    }
                }
            }
        }
    }

    /// Hand a data frame to receivers without waiting on them.
    ///
    /// When the buffer is full the oldest unread frame is evicted, so a
    /// receiver that stops reading never stalls the session loop.
    fn deliver(&self, frame: Inbound) {
        self.metrics.record_message_received();
        let frame = match self.inbound_tx.try_send(frame) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(frame)) => frame,
            // The receiver lives as long as `Shared`
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        };

        // A receiver holding the lock is already draining the buffer
        let evicted = match self.inbound_rx.try_lock() {
            Ok(mut rx) => rx.try_recv().is_ok(),
            Err(_) => false,
        };
        let queued = self.inbound_tx.try_send(frame).is_ok();

        let dropped = u64::from(evicted) + u64::from(!queued);
        for _ in 0..dropped {
            self.metrics.record_inbound_dropped();
        }
        if dropped > 0 {
            debug!(
                "[CLIENT-{}] Inbound buffer full, dropped {} frame(s) (total: {})",
                self.id,
                dropped,
                self.metrics.inbound_dropped()
            );
        }
    }

    /// Drive Reconnecting after a lost session.
    ///
    /// Returns the new session, or `None` once the client is closed or Failed.
    async fn reconnect(&self, reason: Error) -> Option<(WsSource, CancellationToken)> {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut link = self.link.lock().await;
            if self.state() != ConnectionState::Connected {
                return None;
            }
            link.sink = None;
            self.metrics.record_error(&reason);
            self.metrics.record_disconnect();
            warn!("[CLIENT-{}] Connection lost: {}, reconnecting", self.id, reason);
            self.transition(&mut link, ConnectionState::Reconnecting);
        }

        // Only close() interrupts a reconnect cycle
        let uncancellable = CancellationToken::new();
        match self.establish(&uncancellable).await {
            Ok((stream, latency)) => self.install(stream, latency, true).await.ok(),
            Err(Error::Closed) => None,
            Err(err) => {
                let mut link = self.link.lock().await;
                if !self.state().is_closed() {
                    error!("[CLIENT-{}] Reconnection failed: {}", self.id, err);
                    self.metrics.set_last_error(&err);
                    self.transition(&mut link, ConnectionState::Failed);
                }
                None
            }
        }
    }
}

/// Open TCP (and TLS for `wss://`) and perform the WebSocket upgrade.
async fn connect_websocket(request: Request, url: &url::Url, verify_tls: bool) -> Result<WsStream, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::dial("No host in URL"))?;

    let is_tls = url.scheme() == "wss";
    let port = url
        .port_or_known_default()
        .unwrap_or(if is_tls { 443 } else { 80 });

    let tcp_stream = connect_tcp(host, port).await?;

    // Set TCP options for low latency
    set_tcp_options(&tcp_stream);

    // TLS connector (if needed)
    let connector = if is_tls {
        let mut builder = native_tls::TlsConnector::builder();
        if !verify_tls {
            builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let tls = builder
            .build()
            .map_err(|e| Error::dial(format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    // WebSocket handshake
    let (ws_stream, _response) = client_async_tls_with_config(request, tcp_stream, None, connector)
        .await
        .map_err(handshake_error)?;

    Ok(ws_stream)
}

/// Classify an upgrade failure. 401/403 are credential rejections, never retried.
fn handshake_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                Error::AuthRejected {
                    status: status.as_u16(),
                }
            } else {
                Error::dial(format!("Handshake rejected with HTTP {}", status))
            }
        }
        other => Error::dial(format!("Handshake failed: {}", other)),
    }
}

/// Resolve and connect, trying each resolved address in order
async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, Error> {
    // Bracketed IPv6 literals come through as "[::1]"
    let dest_str = format!("{}:{}", host, port);
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::dial(format!("DNS lookup failed: {}", e)))?
        .collect();

    let mut last_error = format!("No addresses found for {}", host);
    for addr in addrs {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| Error::dial(format!("Failed to create socket: {}", e)))?;

        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = format!("TCP connect to {} failed: {}", addr, e),
        }
    }

    Err(Error::dial(last_error))
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    // Disable Nagle's algorithm
    let _ = sock2.set_nodelay(true);

    // Set keepalive to detect dead connections
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}
