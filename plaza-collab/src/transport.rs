//! Signaling transport: named JSON events over a reconnecting channel.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelEvent, ConnectionState, ReconnectPolicy, TransportError};
use crate::events::{ClientEvent, ServerEvent};

/// What the signaling transport yields.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    State(ConnectionState),
    Opened { resumed: bool },
    Server(ServerEvent),
    Closed { gave_up: bool },
}

pub struct SignalingTransport {
    channel: Channel,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    subscribers: HashMap<&'static str, Vec<mpsc::UnboundedSender<ServerEvent>>>,
}

/// `ws://host:port` → `ws://host:port/signal`
pub fn signal_url(base: &str) -> String {
    format!("{}/signal", base.trim_end_matches('/'))
}

impl SignalingTransport {
    pub fn connect(base_url: &str, policy: ReconnectPolicy) -> Self {
        let (channel, events) = Channel::open(signal_url(base_url), policy);
        Self {
            channel,
            events,
            subscribers: HashMap::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        self.channel.wait_connected(timeout).await
    }

    pub fn emit(&self, event: &ClientEvent) -> Result<(), TransportError> {
        self.channel.send_text(event.to_json()?)
    }

    /// Receive a copy of every server event named `name` (e.g. `"peer-joined"`).
    pub fn subscribe(&mut self, name: &'static str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(name).or_default().push(tx);
        rx
    }

    fn dispatch(&mut self, event: &ServerEvent) {
        if let Some(subs) = self.subscribers.get_mut(event.name()) {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Next transport event. Returns `None` once the channel task is gone.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            let event = match self.events.recv().await? {
                ChannelEvent::State(s) => TransportEvent::State(s),
                ChannelEvent::Opened { resumed } => TransportEvent::Opened { resumed },
                ChannelEvent::Closed { gave_up } => TransportEvent::Closed { gave_up },
                ChannelEvent::Text(text) => match ServerEvent::from_json(&text) {
                    Ok(event) => {
                        self.dispatch(&event);
                        TransportEvent::Server(event)
                    }
                    Err(e) => {
                        log::warn!("Ignoring malformed signaling frame: {e}");
                        continue;
                    }
                },
                ChannelEvent::Binary(_) => {
                    log::debug!("Ignoring binary frame on signaling channel");
                    continue;
                }
            };
            return Some(event);
        }
    }

    pub fn close(&self) {
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_url() {
        assert_eq!(signal_url("ws://127.0.0.1:9090"), "ws://127.0.0.1:9090/signal");
        assert_eq!(signal_url("ws://127.0.0.1:9090/"), "ws://127.0.0.1:9090/signal");
    }
}
