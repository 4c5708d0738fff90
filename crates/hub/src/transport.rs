//! Transport client: the single WebSocket connection.
//!
//! One connection loop task owns the physical connection, the outbound frame
//! queue, and the reconnect/backoff state. Frames sent while disconnected
//! are queued and replayed FIFO once the connection reopens; the
//! re-authentication handshake, when a session is cached, precedes the
//! replay. Exactly one connection-lost notice is emitted per disconnect
//! episode, however many retries it takes.
//!
//! States: Closed → Connecting → Open → Retrying (→ Connecting …). The
//! very first connection is triggered lazily by the first send attempt;
//! afterwards the reconnect timer drives the machine.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{ErrorMsg, Frame};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::auth::SessionAuth;
use crate::broker::FrameSink;
use crate::config::Config;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection state of the transport client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Closed,
    /// A connection attempt is in progress; doubles as the guard against
    /// concurrent duplicate attempts.
    Connecting,
    /// Connected; sends go out immediately.
    Open,
    /// Connection lost; a reconnect timer is pending.
    Retrying,
}

/// Events emitted by the transport client.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Inbound frame for the broker.
    Frame(Frame),
    /// Connection notice for the reserved notification topics.
    Notice(ErrorMsg),
    /// Connection state changed.
    StateChanged(ConnectionState),
}

/// Commands accepted by the transport task.
#[derive(Debug)]
pub enum TransportCommand {
    /// Send a frame; queued while not connected.
    Send(Frame),
    /// Close the connection and stop reconnecting.
    Shutdown,
}

/// Configuration for the transport client.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL of the synchronization server.
    pub server_url: String,
    /// Floor added to every reconnect delay.
    pub min_retry_interval: Duration,
    /// Cap on the reconnect delay.
    pub max_retry_delay: Duration,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Grace period for the heartbeat pong.
    pub heartbeat_timeout: Duration,
}

impl TransportConfig {
    /// Extracts the transport settings from the hub configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_url: config.connection.server_url.clone(),
            min_retry_interval: config.retry.min_interval(),
            max_retry_delay: config.retry.max_delay(),
            heartbeat_interval: config.connection.heartbeat_interval(),
            heartbeat_timeout: config.connection.heartbeat_timeout(),
        }
    }
}

/// Reconnect backoff: randomized, growing linearly with the retry count,
/// capped at a maximum.
pub struct Backoff {
    retry_count: u32,
    min_interval: Duration,
    max_delay: Duration,
}

impl Backoff {
    /// Creates a backoff with the given floor and cap.
    pub fn new(min_interval: Duration, max_delay: Duration) -> Self {
        Self {
            retry_count: 0,
            min_interval,
            max_delay,
        }
    }

    /// Computes the next delay: `random(0,1) * retries * 1s + min_interval`,
    /// capped at the maximum. The retry count grows with every failure and
    /// is halved whenever the cap is hit, so it cannot grow without bound
    /// while the connection stays down.
    pub fn next_delay(&mut self, rng: &mut impl Rng) -> Duration {
        self.retry_count += 1;
        let jitter: f64 = rng.gen();
        let delay = Duration::from_secs_f64(jitter * f64::from(self.retry_count)) + self.min_interval;
        if delay >= self.max_delay {
            self.retry_count = (self.retry_count / 2).max(1);
            self.max_delay
        } else {
            delay
        }
    }

    /// Resets the retry count after a successful connection.
    pub fn reset(&mut self) {
        self.retry_count = 0;
    }

    /// Current retry count.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

/// Cloneable sending side of the transport; the broker uses it as its
/// [`FrameSink`].
#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<TransportCommand>,
    state: Arc<RwLock<ConnectionState>>,
}

impl TransportHandle {
    /// Hands a frame to the connection loop; queued while disconnected.
    pub fn send_frame(&self, frame: Frame) {
        let _ = self.commands.send(TransportCommand::Send(frame));
    }

    /// Closes the connection and stops the loop.
    pub fn shutdown(&self) {
        let _ = self.commands.send(TransportCommand::Shutdown);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FrameSink for TransportHandle {
    fn send(&self, frame: Frame) {
        self.send_frame(frame);
    }
}

/// The connection loop owner.
pub struct TransportClient {
    config: TransportConfig,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    handle: TransportHandle,
    events: mpsc::UnboundedSender<TransportEvent>,
    auth: Arc<TokioMutex<SessionAuth>>,
    state: Arc<RwLock<ConnectionState>>,
}

impl TransportClient {
    /// Creates a transport client emitting into the given event channel.
    pub fn new(
        config: TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
        auth: Arc<TokioMutex<SessionAuth>>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Closed));
        let handle = TransportHandle {
            commands: command_tx,
            state: state.clone(),
        };
        Self {
            config,
            commands: command_rx,
            handle,
            events,
            auth,
            state,
        }
    }

    /// Returns a cloneable handle for sending frames.
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    fn set_state(&self, new_state: ConnectionState) {
        let changed = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let changed = *state != new_state;
            *state = new_state;
            changed
        };
        if changed {
            self.emit(TransportEvent::StateChanged(new_state));
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            tracing::warn!("transport event receiver dropped");
        }
    }

    /// Builds the re-authentication frame if a session is cached.
    async fn reauth_frame(&self) -> Option<Frame> {
        self.auth.lock().await.reconnect_frame()
    }

    /// Runs the connection loop until shutdown.
    pub async fn run(mut self) {
        let mut queue: VecDeque<Frame> = VecDeque::new();
        let mut backoff = Backoff::new(self.config.min_retry_interval, self.config.max_retry_delay);
        let mut attempted = false;
        let mut ever_connected = false;
        let mut loss_reported = false;

        'outer: loop {
            // Closed: the first connection is triggered by the first send.
            while !attempted && queue.is_empty() {
                match self.commands.recv().await {
                    Some(TransportCommand::Send(frame)) => queue.push_back(frame),
                    Some(TransportCommand::Shutdown) | None => break 'outer,
                }
            }
            attempted = true;

            self.set_state(ConnectionState::Connecting);
            tracing::info!(url = %self.config.server_url, "connecting to server");

            match connect_async(&self.config.server_url).await {
                Ok((stream, _response)) => {
                    let (mut sink, mut stream) = stream.split();
                    self.set_state(ConnectionState::Open);
                    backoff.reset();

                    let reconnect = ever_connected;
                    ever_connected = true;
                    loss_reported = false;

                    // The re-authentication handshake precedes the queued
                    // frames, so the server sees a valid session before any
                    // replayed traffic.
                    if reconnect {
                        match self.reauth_frame().await {
                            Some(frame) => {
                                if send_frame(&mut sink, &frame).await.is_err() {
                                    self.enter_retry(&mut backoff, ever_connected, &mut loss_reported)
                                        .await;
                                    continue;
                                }
                                self.emit(TransportEvent::Notice(ErrorMsg::success(
                                    "connection restored",
                                    "session re-authenticated",
                                )));
                            }
                            None => {
                                self.emit(TransportEvent::Notice(ErrorMsg::success(
                                    "connection restored",
                                    "connection to the server was re-established",
                                )));
                            }
                        }
                    }

                    // FIFO replay of everything queued while disconnected.
                    let mut replay_failed = false;
                    while let Some(frame) = queue.front() {
                        if send_frame(&mut sink, frame).await.is_err() {
                            replay_failed = true;
                            break;
                        }
                        queue.pop_front();
                    }

                    if !replay_failed
                        && !self
                            .serve_connection(&mut sink, &mut stream, &mut queue)
                            .await
                    {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break 'outer;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "connection attempt failed");
                }
            }

            self.enter_retry(&mut backoff, ever_connected, &mut loss_reported)
                .await;
        }

        self.set_state(ConnectionState::Closed);
        tracing::debug!("transport loop stopped");
    }

    /// Serves one open connection. Returns false when a shutdown was
    /// requested, true when the connection dropped and a retry is due.
    async fn serve_connection(
        &mut self,
        sink: &mut WsSink,
        stream: &mut WsStream,
        queue: &mut VecDeque<Frame>,
    ) -> bool {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await; // skip the immediate tick
        let mut last_pong = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > self.config.heartbeat_interval + self.config.heartbeat_timeout {
                        tracing::warn!("heartbeat timeout, reconnecting");
                        return true;
                    }
                    if sink.send(WsMessage::Ping(vec![])).await.is_err() {
                        return true;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(TransportCommand::Send(frame)) => {
                        if let Err(e) = send_frame(sink, &frame).await {
                            tracing::error!(error = %e, "send failed, queueing frame for replay");
                            queue.push_back(frame);
                            return true;
                        }
                    }
                    Some(TransportCommand::Shutdown) | None => return false,
                },
                message = stream.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => match Frame::from_json(&text) {
                        Ok(frame) => self.emit(TransportEvent::Frame(frame)),
                        Err(e) => {
                            tracing::warn!(error = %e, raw = %text, "failed to parse inbound frame");
                        }
                    },
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_pong = tokio::time::Instant::now();
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::info!("server closed the connection");
                        return true;
                    }
                    Some(Ok(_)) => {
                        // Binary frames are not part of the protocol.
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "transport receive error");
                        return true;
                    }
                },
            }
        }
    }

    /// Transitions into the retrying state, reporting the loss once per
    /// episode, and sleeps out the backoff delay.
    async fn enter_retry(
        &self,
        backoff: &mut Backoff,
        ever_connected: bool,
        loss_reported: &mut bool,
    ) {
        self.set_state(ConnectionState::Retrying);
        if ever_connected && !*loss_reported {
            *loss_reported = true;
            self.emit(TransportEvent::Notice(ErrorMsg::warning(
                "connection lost",
                "attempting to reconnect to the server",
            )));
        }
        let delay = backoff.next_delay(&mut rand::thread_rng());
        tracing::info!(?delay, retries = backoff.retry_count(), "reconnecting after delay");
        tokio::time::sleep(delay).await;
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> protocol::Result<()> {
    let text = frame.to_json()?;
    sink.send(WsMessage::Text(text))
        .await
        .map_err(|e| protocol::ProtocolError::ConnectionClosed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_backoff_respects_floor_and_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(5));
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..100 {
            let delay = backoff.next_delay(&mut rng);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_backoff_retry_count_grows_and_decays() {
        let mut backoff = Backoff::new(Duration::from_millis(0), Duration::from_secs(3));
        let mut rng = StdRng::seed_from_u64(42);

        let mut seen_decay = false;
        let mut previous = backoff.retry_count();
        for _ in 0..200 {
            backoff.next_delay(&mut rng);
            let current = backoff.retry_count();
            if current < previous {
                seen_decay = true;
                // Halved, not reset.
                assert!(current >= 1);
            }
            previous = current;
        }
        // With a 3s cap the count keeps drifting into it and must decay.
        assert!(seen_decay);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(1);
        backoff.next_delay(&mut rng);
        backoff.next_delay(&mut rng);
        assert!(backoff.retry_count() > 0);

        backoff.reset();
        assert_eq!(backoff.retry_count(), 0);
    }

    #[test]
    fn test_transport_config_from_config() {
        let mut config = Config::default();
        config.retry.min_interval_ms = 10;
        config.retry.max_delay_ms = 100;

        let transport_config = TransportConfig::from_config(&config);
        assert_eq!(transport_config.server_url, config.connection.server_url);
        assert_eq!(transport_config.min_retry_interval, Duration::from_millis(10));
        assert_eq!(transport_config.max_retry_delay, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_handle_reports_initial_state() {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let auth = Arc::new(TokioMutex::new(SessionAuth::new("studio")));
        let client = TransportClient::new(
            TransportConfig::from_config(&Config::default()),
            event_tx,
            auth,
        );
        assert_eq!(client.handle().state(), ConnectionState::Closed);
    }
}
