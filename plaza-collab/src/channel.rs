//! Reconnecting duplex WebSocket.
//!
//! A background task owns the socket and reconnects with bounded
//! exponential backoff. The handle only queues frames and observes state,
//! so callers never block on the network.
//!
//! ```text
//!            open()
//!   ──▸ Connecting ──ok──▸ Connected ──lost──▸ Reconnecting{1,max}
//!            │                ▲                    │   │
//!            │                └─────────ok─────────┘   │ attempt > max
//!            └──fail──▸ Reconnecting{1,max}            ▼
//!                                               Disconnected (terminal)
//! ```

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Channel closed")]
    Closed,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Gave up on {url} after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Random spread applied to each delay, as a fraction (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 10,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Base delay before retry `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0))
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, max: u32 },
}

/// Everything the socket task reports.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    State(ConnectionState),
    /// Socket is open. `resumed` is true after a reconnect.
    Opened { resumed: bool },
    Text(String),
    Binary(Vec<u8>),
    /// Terminal: closed locally or retries exhausted.
    Closed { gave_up: bool },
}

enum Outgoing {
    Frame(Message),
    Close,
}

enum PumpEnd {
    Lost,
    Local,
}

/// Handle to a reconnecting WebSocket.
pub struct Channel {
    url: String,
    out_tx: mpsc::UnboundedSender<Outgoing>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl Channel {
    /// Start connecting in the background.
    pub fn open(url: impl Into<String>, policy: ReconnectPolicy) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let url = url.into();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let task = tokio::spawn(run(url.clone(), policy, out_rx, event_tx, state_tx));
        (
            Self {
                url,
                out_tx,
                state: state_rx,
                task,
            },
            event_rx,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn send(&self, frame: Message) -> Result<(), TransportError> {
        match self.state() {
            ConnectionState::Connected => self
                .out_tx
                .send(Outgoing::Frame(frame))
                .map_err(|_| TransportError::Closed),
            ConnectionState::Disconnected => Err(TransportError::Closed),
            _ => Err(TransportError::NotConnected),
        }
    }

    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.send(Message::Text(text.into()))
    }

    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.send(Message::Binary(bytes.into()))
    }

    /// Wait until the socket is open, or fail if it gives up first.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.state.clone();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected)),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map(|s| *s);

        match reached {
            Ok(ConnectionState::Connected) => Ok(()),
            _ => Err(TransportError::Closed),
        }
    }

    /// Close the socket and stop reconnecting.
    pub fn close(&self) {
        let _ = self.out_tx.send(Outgoing::Close);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    url: String,
    policy: ReconnectPolicy,
    mut out_rx: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: watch::Sender<ConnectionState>,
) {
    let set_state = |s: ConnectionState| {
        state.send_replace(s);
        let _ = events.send(ChannelEvent::State(s));
    };

    let mut attempt: u32 = 0;
    let mut resumed = false;
    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                attempt = 0;
                log::info!("Connected to {url}");
                set_state(ConnectionState::Connected);
                let _ = events.send(ChannelEvent::Opened { resumed });
                resumed = true;

                if let PumpEnd::Local = pump(ws, &mut out_rx, &events).await {
                    set_state(ConnectionState::Disconnected);
                    let _ = events.send(ChannelEvent::Closed { gave_up: false });
                    return;
                }
                log::warn!("Connection to {url} lost");
            }
            Err(e) => log::warn!("Connecting to {url} failed: {e}"),
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            log::error!(
                "{}",
                TransportError::RetriesExhausted {
                    url: url.clone(),
                    attempts: policy.max_attempts,
                }
            );
            set_state(ConnectionState::Disconnected);
            let _ = events.send(ChannelEvent::Closed { gave_up: true });
            return;
        }

        let delay = policy.jittered(attempt);
        log::info!(
            "Reconnecting to {url} (attempt {attempt}/{}) in {delay:?}",
            policy.max_attempts
        );
        set_state(ConnectionState::Reconnecting {
            attempt,
            max: policy.max_attempts,
        });

        // Frames queued while down are dropped; a close still wins.
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                cmd = out_rx.recv() => match cmd {
                    Some(Outgoing::Frame(_)) => log::debug!("Dropping frame for {url} while reconnecting"),
                    Some(Outgoing::Close) | None => {
                        set_state(ConnectionState::Disconnected);
                        let _ = events.send(ChannelEvent::Closed { gave_up: false });
                        return;
                    }
                },
            }
        }
    }
}

async fn pump<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    out_rx: &mut mpsc::UnboundedReceiver<Outgoing>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> PumpEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = ws.split();
    loop {
        tokio::select! {
            cmd = out_rx.recv() => match cmd {
                Some(Outgoing::Frame(frame)) => {
                    if let Err(e) = ws_sender.send(frame).await {
                        log::warn!("Send failed: {e}");
                        return PumpEnd::Lost;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return PumpEnd::Local;
                }
            },

            msg = ws_receiver.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => ChannelEvent::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(data))) => ChannelEvent::Binary(data.into()),
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            return PumpEnd::Lost;
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => return PumpEnd::Lost,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        return PumpEnd::Lost;
                    }
                    Some(Ok(_)) => continue,
                };
                if events.send(event).is_err() {
                    // Nobody is listening any more.
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return PumpEnd::Local;
                }
            }
        }
    }
}
