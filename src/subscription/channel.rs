//! One logical subscription and its background task
//!
//! The task loops over physical connections: authenticate, connect, handshake,
//! stream frames, and on a transport failure back off and start over. Every
//! suspension point races against the channel's cancellation token, so `stop()`
//! interrupts the task wherever it is waiting. The socket lives in a guard that
//! clears the connected flag on drop, which covers the abort path too.
//!
//! Every `start()` opens a new generation. Only the task of the current
//! generation may publish status or the connected flag, and a task does no
//! work until its predecessor has exited, so a restart racing a `stop()` never
//! leaves two tasks talking to the server.

use super::config::SubscriptionConfig;
use super::dispatcher::CallbackDispatcher;
use super::metrics::ChannelMetrics;
use super::SubscriptionRequest;
use crate::client::ClientContext;
use crate::protocol::{
    classify_data, payload_message, DataEvent, ProtocolMessage, StartPayload, SubscriptionId,
    GRAPHQL_WS_PROTOCOL,
};
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of a channel as seen from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Never started
    Idle,
    Connecting {
        attempt: u32,
    },
    /// Handshake done, `start` sent, frames flowing
    Connected,
    /// Transport failed; waiting `delay` before attempt number `attempt`
    Reconnecting {
        attempt: u32,
        delay: Duration,
        error: Error,
    },
    /// Server sent `complete`
    Completed,
    /// Terminal failure; the channel will not retry
    Failed(Error),
    Stopped,
}

impl ChannelStatus {
    /// The task has exited (or was never going to run again)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelStatus::Completed | ChannelStatus::Failed(_) | ChannelStatus::Stopped
        )
    }
}

/// How one physical connection ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Completed,
    Cancelled,
}

struct RunningTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    generation: u64,
}

/// What a background task needs to know about itself
struct TaskScope {
    cancel: CancellationToken,
    generation: u64,
}

/// State shared between the channel handle and its background task
struct ChannelShared {
    name: String,
    id: SubscriptionId,
    context: Arc<ClientContext>,
    payload: StartPayload,
    config: SubscriptionConfig,
    dispatcher: CallbackDispatcher,
    metrics: Arc<ChannelMetrics>,
    running: AtomicBool,
    /// Bumped by every `start()`
    generation: AtomicU64,
    /// Generation whose socket is past the handshake, 0 when none
    connected: Arc<AtomicU64>,
    /// Held by a task for its whole run
    active: tokio::sync::Mutex<()>,
    reconnect_delay: Mutex<Duration>,
    last_error: Mutex<Option<Error>>,
    status: watch::Sender<ChannelStatus>,
}

/// Runtime object managing one subscription's connection lifecycle
pub struct SubscriptionChannel {
    shared: Arc<ChannelShared>,
    task: Mutex<Option<RunningTask>>,
}

impl SubscriptionChannel {
    pub fn new(
        context: Arc<ClientContext>,
        request: SubscriptionRequest,
        config: SubscriptionConfig,
    ) -> Self {
        let id = SubscriptionId::new();
        let name = request.name.clone().unwrap_or_else(|| id.to_string());
        let metrics = Arc::new(ChannelMetrics::new());
        let dispatcher =
            CallbackDispatcher::new(name.clone(), request.callback.clone(), metrics.clone());
        let (status, _) = watch::channel(ChannelStatus::Idle);

        Self {
            shared: Arc::new(ChannelShared {
                name,
                id,
                context,
                payload: request.start_payload(),
                reconnect_delay: Mutex::new(config.backoff.first),
                config,
                dispatcher,
                metrics,
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                connected: Arc::new(AtomicU64::new(0)),
                active: tokio::sync::Mutex::new(()),
                last_error: Mutex::new(None),
                status,
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the background task unless one is already live.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut slot = self.task.lock();
        if let Some(task) = slot.as_ref() {
            if self.shared.running.load(Ordering::SeqCst) && !task.handle.is_finished() {
                debug!(subscription = %self.shared.name, "Subscription already running");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let generation = self.shared.next_generation();
        self.shared.running.store(true, Ordering::SeqCst);

        let scope = TaskScope {
            cancel: cancel.clone(),
            generation,
        };
        let handle = tokio::spawn(Arc::clone(&self.shared).run(scope));
        *slot = Some(RunningTask {
            handle,
            cancel,
            generation,
        });

        info!(subscription = %self.shared.name, "Subscription started");
    }

    /// Cancel the background task and release the socket.
    ///
    /// Idempotent; safe on a channel that was never started. The task gets
    /// `shutdown_timeout` to close its socket cleanly before it is aborted.
    pub async fn stop(&self) {
        let task = {
            let mut slot = self.task.lock();
            self.shared.running.store(false, Ordering::SeqCst);
            slot.take()
        };
        let Some(RunningTask {
            mut handle,
            cancel,
            generation,
        }) = task
        else {
            // Never started: settle the status so `finished()` resolves
            self.shared.status.send_if_modified(|status| {
                if *status == ChannelStatus::Idle {
                    *status = ChannelStatus::Stopped;
                    true
                } else {
                    false
                }
            });
            return;
        };

        cancel.cancel();
        match tokio::time::timeout(self.shared.config.shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => {
                error!(subscription = %self.shared.name, "Subscription task panicked: {}", e);
            }
            Err(_) => {
                warn!(
                    subscription = %self.shared.name,
                    "Subscription task did not stop within {:?}; aborting",
                    self.shared.config.shutdown_timeout
                );
                handle.abort();
                let _ = handle.await;
            }
        }

        self.shared.clear_connected(generation);
        self.shared.status.send_if_modified(|status| {
            if self.shared.generation.load(Ordering::SeqCst) != generation || status.is_terminal() {
                return false;
            }
            *status = ChannelStatus::Stopped;
            true
        });
        info!(subscription = %self.shared.name, "Subscription stopped");
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Request id used on the wire
    pub fn id(&self) -> &SubscriptionId {
        &self.shared.id
    }

    pub fn query(&self) -> &str {
        &self.shared.payload.query
    }

    pub fn variables(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.shared.payload.variables
    }

    /// The channel is wanted and its task has not exited
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && self.has_task()
    }

    /// A background task is held and still live
    pub fn has_task(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |task| !task.handle.is_finished())
    }

    /// A socket is open and past the handshake
    pub fn is_connected(&self) -> bool {
        let connected = self.shared.connected.load(Ordering::SeqCst);
        connected != 0 && connected == self.shared.generation.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ChannelStatus {
        self.shared.status.borrow().clone()
    }

    /// Receiver observing every status change
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.status.subscribe()
    }

    /// Wait until the task has exited and return the final status.
    ///
    /// Does not return for a channel that was neither started nor stopped.
    pub async fn finished(&self) -> ChannelStatus {
        let mut rx = self.shared.status.subscribe();
        let status = match rx.wait_for(ChannelStatus::is_terminal).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        status
    }

    /// Delay that was applied before the latest reconnect
    pub fn reconnect_delay(&self) -> Duration {
        *self.shared.reconnect_delay.lock()
    }

    /// Most recent failure reported by the task, retryable or not
    pub fn last_error(&self) -> Option<Error> {
        self.shared.last_error.lock().clone()
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.shared.metrics
    }
}

impl std::fmt::Debug for SubscriptionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionChannel")
            .field("name", &self.shared.name)
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for SubscriptionChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
            task.handle.abort();
        }
    }
}

impl ChannelShared {
    /// Open a new generation and announce it as connecting.
    fn next_generation(&self) -> u64 {
        let mut generation = 0;
        self.status.send_modify(|status| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *status = ChannelStatus::Connecting { attempt: 0 };
        });
        generation
    }

    /// Replace the status unless a newer generation has started.
    fn publish(&self, generation: u64, next: ChannelStatus) {
        self.status.send_if_modified(|status| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            *status = next;
            true
        });
    }

    fn clear_connected(&self, generation: u64) {
        let _ = self
            .connected
            .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>, scope: TaskScope) {
        // A task left over from a stop() still in progress must exit first
        let active = tokio::select! {
            _ = scope.cancel.cancelled() => None,
            guard = self.active.lock() => Some(guard),
        };

        let final_status = match active {
            Some(_active) => self.supervise(&scope).await,
            None => ChannelStatus::Stopped,
        };

        self.clear_connected(scope.generation);
        self.publish(scope.generation, final_status);
    }

    async fn supervise(&self, scope: &TaskScope) -> ChannelStatus {
        let cancel = &scope.cancel;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() || !self.running.load(Ordering::SeqCst) {
                break ChannelStatus::Stopped;
            }

            self.publish(scope.generation, ChannelStatus::Connecting { attempt });
            ChannelMetrics::incr(&self.metrics.connection_attempts);

            let error = match self.session(scope, &mut attempt).await {
                Ok(SessionEnd::Completed) => {
                    info!(subscription = %self.name, "Subscription completed by server");
                    break ChannelStatus::Completed;
                }
                Ok(SessionEnd::Cancelled) => break ChannelStatus::Stopped,
                Err(error) => error,
            };
            *self.last_error.lock() = Some(error.clone());

            if !error.is_retryable() {
                match &error {
                    Error::Authentication { .. } => error!(
                        subscription = %self.name,
                        "Subscription authentication failed, not retrying: {}", error
                    ),
                    Error::Subscription { .. } => error!(
                        subscription = %self.name,
                        "Subscription failed: {}", error
                    ),
                    _ => error!(
                        subscription = %self.name,
                        "Unexpected subscription failure, giving up: {}", error
                    ),
                }
                break ChannelStatus::Failed(error);
            }

            if cancel.is_cancelled() || !self.running.load(Ordering::SeqCst) {
                debug!(subscription = %self.name, "Connection lost after stop: {}", error);
                break ChannelStatus::Stopped;
            }

            if let Some(max) = self.config.max_reconnect_attempts {
                if attempt >= max {
                    let error = Error::connection(format!(
                        "Giving up after {} reconnect attempts: {}",
                        max, error
                    ));
                    error!(subscription = %self.name, "{}", error);
                    *self.last_error.lock() = Some(error.clone());
                    break ChannelStatus::Failed(error);
                }
            }

            let delay = self.config.backoff.next(attempt);
            attempt = attempt.saturating_add(1);
            *self.reconnect_delay.lock() = delay;
            ChannelMetrics::incr(&self.metrics.reconnects);

            warn!(
                subscription = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "{}; reconnecting",
                error
            );
            self.publish(
                scope.generation,
                ChannelStatus::Reconnecting {
                    attempt,
                    delay,
                    error,
                },
            );

            tokio::select! {
                _ = cancel.cancelled() => break ChannelStatus::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One physical connection, from token lookup to socket close.
    async fn session(&self, scope: &TaskScope, attempt: &mut u32) -> Result<SessionEnd> {
        let cancel = &scope.cancel;
        let token = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            token = self.context.authenticator.access_token() => token?,
        };

        let url = self.context.endpoint.subscription_url()?;
        debug!(subscription = %self.name, "Connecting to {}", url);

        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            stream = open_socket(&url) => stream?,
        };

        let mut socket = Socket::new(stream, Arc::clone(&self.connected), scope.generation);
        let outcome = self.converse(&mut socket, &token, scope, attempt).await;

        if outcome == Ok(SessionEnd::Cancelled) && socket.is_connected() {
            // Let the server drop the operation instead of seeing a bare close
            let farewell = async {
                if socket.send(&ProtocolMessage::stop(&self.id)).await.is_ok() {
                    let _ = socket.send(&ProtocolMessage::ConnectionTerminate).await;
                }
            };
            if tokio::time::timeout(self.config.close_timeout, farewell)
                .await
                .is_err()
            {
                debug!(subscription = %self.name, "Timed out sending stop");
            }
        }
        socket.close(self.config.close_timeout).await;

        outcome
    }

    async fn converse(
        &self,
        socket: &mut Socket,
        token: &str,
        scope: &TaskScope,
        attempt: &mut u32,
    ) -> Result<SessionEnd> {
        let cancel = &scope.cancel;
        socket.send(&ProtocolMessage::connection_init(token)).await?;

        let Some(first) = self.next_frame(socket, cancel, self.config.ack_timeout).await? else {
            return Ok(SessionEnd::Cancelled);
        };
        match first {
            ProtocolMessage::ConnectionAck { .. } => {}
            ProtocolMessage::ConnectionError { payload } => {
                return Err(Error::subscription(format!(
                    "Connection rejected: {}",
                    payload_message(payload.as_ref())
                )));
            }
            ProtocolMessage::Error { payload, .. } => {
                return Err(Error::subscription(format!(
                    "Error before connection_ack: {}",
                    payload_message(payload.as_ref())
                )));
            }
            other => {
                return Err(Error::subscription(format!(
                    "Expected connection_ack, received {}",
                    other.kind()
                )));
            }
        }

        socket.mark_connected();
        *attempt = 0;
        *self.reconnect_delay.lock() = self.config.backoff.first;
        self.publish(scope.generation, ChannelStatus::Connected);
        info!(subscription = %self.name, "Subscription connected");

        socket
            .send(&ProtocolMessage::start(&self.id, self.payload.clone()))
            .await?;

        loop {
            let Some(frame) = self.next_frame(socket, cancel, None).await? else {
                return Ok(SessionEnd::Cancelled);
            };

            match frame {
                ProtocolMessage::Data { payload, .. } => match classify_data(payload.as_ref()) {
                    DataEvent::Deliver(data) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                            _ = self.dispatcher.dispatch(data) => {}
                        }
                    }
                    DataEvent::Failed(message) => return Err(Error::subscription(message)),
                    DataEvent::Empty => {
                        debug!(subscription = %self.name, "Ignoring data frame without data");
                    }
                },
                ProtocolMessage::Error { payload, .. }
                | ProtocolMessage::ConnectionError { payload } => {
                    return Err(Error::subscription(payload_message(payload.as_ref())));
                }
                ProtocolMessage::Complete { .. } => return Ok(SessionEnd::Completed),
                ProtocolMessage::Ping { payload } => {
                    socket.send(&ProtocolMessage::Pong { payload }).await?;
                }
                ProtocolMessage::KeepAlive | ProtocolMessage::Pong { .. } => {}
                other => {
                    debug!(subscription = %self.name, "Ignoring {} frame", other.kind());
                }
            }
        }
    }

    /// Next protocol frame, or `None` once cancelled.
    async fn next_frame(
        &self,
        socket: &mut Socket,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Option<ProtocolMessage>> {
        let receive = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, socket.receive())
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::connection(format!(
                            "Timed out after {:?} waiting for connection_ack",
                            limit
                        )))
                    }),
                None => socket.receive().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            frame = receive => {
                let frame = frame?;
                ChannelMetrics::incr(&self.metrics.frames_received);
                debug!(subscription = %self.name, "Received {} frame", frame.kind());
                Ok(Some(frame))
            }
        }
    }
}

async fn open_socket(url: &Url) -> Result<WsStream> {
    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(GRAPHQL_WS_PROTOCOL),
    );

    let (stream, response) = connect_async(request).await.map_err(|e| match Error::from(e) {
        Error::Connection { message } => Error::connection(format!(
            "Failed to connect to {}: {}",
            url, message
        )),
        other => other,
    })?;
    debug!("WebSocket upgrade completed with status {}", response.status());
    Ok(stream)
}

/// Exclusively owned connection; clears the channel's connected flag however
/// it goes away.
struct Socket {
    stream: WsStream,
    connected: Arc<AtomicU64>,
    generation: u64,
    open: bool,
}

impl Socket {
    fn new(stream: WsStream, connected: Arc<AtomicU64>, generation: u64) -> Self {
        Self {
            stream,
            connected,
            generation,
            open: true,
        }
    }

    fn mark_connected(&self) {
        self.connected.store(self.generation, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.open && self.connected.load(Ordering::SeqCst) == self.generation
    }

    async fn send(&mut self, message: &ProtocolMessage) -> Result<()> {
        let text = message.to_json()?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Next text frame decoded as a protocol message. A close from the server
    /// or the end of the stream is a connection error.
    async fn receive(&mut self) -> Result<ProtocolMessage> {
        loop {
            let message = match self.stream.next().await {
                Some(message) => message?,
                None => return Err(Error::connection("WebSocket connection closed")),
            };

            match message {
                Message::Text(text) => return ProtocolMessage::from_json(&text),
                Message::Close(frame) => {
                    self.open = false;
                    let detail = frame
                        .map(|f| format!(" (code {}, reason '{}')", u16::from(f.code), f.reason))
                        .unwrap_or_default();
                    return Err(Error::connection(format!(
                        "WebSocket connection closed by server{}",
                        detail
                    )));
                }
                // Control frames are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Binary(bytes) => {
                    debug!("Ignoring {} byte binary frame", bytes.len());
                }
            }
        }
    }

    async fn close(&mut self, limit: Duration) {
        self.release();
        if !self.open {
            return;
        }
        self.open = false;
        if let Ok(Err(e)) = tokio::time::timeout(limit, self.stream.close(None)).await {
            debug!("Ignoring error while closing WebSocket: {}", e);
        }
    }
}

impl Socket {
    fn release(&self) {
        let _ = self.connected.compare_exchange(
            self.generation,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::client::Endpoint;

    fn channel() -> SubscriptionChannel {
        let context = Arc::new(ClientContext {
            endpoint: Endpoint::new("test-host", 443, true),
            authenticator: Authenticator::unauthenticated(),
        });
        SubscriptionChannel::new(
            context,
            SubscriptionRequest::new("subscription { test }"),
            SubscriptionConfig::default(),
        )
    }

    #[test]
    fn test_new_channel_is_idle() {
        let channel = channel();
        assert_eq!(channel.status(), ChannelStatus::Idle);
        assert!(!channel.is_running());
        assert!(!channel.has_task());
        assert!(!channel.is_connected());
        assert_eq!(channel.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(channel.name(), channel.id().to_string());
        assert_eq!(channel.query(), "subscription { test }");
        assert!(channel.variables().is_empty());
    }

    #[tokio::test]
    async fn test_stop_never_started_settles_as_stopped() {
        let channel = channel();
        channel.stop().await;
        channel.stop().await;

        assert!(!channel.is_running());
        assert!(!channel.has_task());
        assert_eq!(channel.status(), ChannelStatus::Stopped);

        let status = tokio::time::timeout(Duration::from_secs(1), channel.finished()).await;
        assert_eq!(status.unwrap(), ChannelStatus::Stopped);
    }

    #[test]
    fn test_status_terminal_states() {
        assert!(ChannelStatus::Completed.is_terminal());
        assert!(ChannelStatus::Stopped.is_terminal());
        assert!(ChannelStatus::Failed(Error::subscription("x")).is_terminal());
        assert!(!ChannelStatus::Idle.is_terminal());
        assert!(!ChannelStatus::Connected.is_terminal());
    }
}
