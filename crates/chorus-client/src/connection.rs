//! Owns the one WebSocket to the chorus backend: connect, forward
//! frames, reconnect on loss, give up after the retry budget.
//!
//! The task forwards inbound text frames verbatim; decoding happens in
//! the session task. Outbound frames submitted while the socket is down
//! are dropped with a warning; only the identity announcement is
//! buffered, as the latest value on a watch channel, and re-announced
//! once per established connection.

use chorus_core::ClientFrame;
use futures_util::{Sink, SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Socket lifecycle as seen from outside the connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Connecting,
    Open,
    Closing,
    Closed,
}

/// What the connection task reports to the session task.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Socket established and identity (if known) announced.
    Open,
    /// Socket lost; a reconnect will follow unless the budget is spent.
    Closed,
    /// One inbound text frame, verbatim.
    Inbound(String),
    /// Retry budget exhausted; the connection task has stopped.
    GaveUp,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: Url,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl ConnectionConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Fixed-delay retry budget. The attempt counter resets to zero on every
/// successful open.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// The delay before the next attempt, or `None` once the budget is
    /// spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Tracks what was announced on the current connection so the identity
/// goes out exactly once per connection, and again only when it changes.
#[derive(Debug, Default)]
pub struct IdentityGate {
    announced: Option<String>,
}

impl IdentityGate {
    /// Called on open and whenever the identity value changes. Returns
    /// the key to send now, or `None` if it is already announced.
    pub fn take_announcement(&mut self, current: Option<&str>) -> Option<String> {
        let current = current?;
        if self.announced.as_deref() == Some(current) {
            return None;
        }
        self.announced = Some(current.to_string());
        Some(current.to_string())
    }

    /// A new connection starts with a clean slate.
    pub fn reset(&mut self) {
        self.announced = None;
    }
}

/// Run the connection until the retry budget is exhausted or both input
/// channels close. One call owns the one socket; there is no way to end
/// up with two live sockets or two pending reconnect timers.
pub async fn run_connection(
    config: ConnectionConfig,
    mut identity_rx: watch::Receiver<Option<String>>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    state_tx: watch::Sender<LinkState>,
) {
    let mut policy = ReconnectPolicy::new(config.reconnect_delay, config.max_reconnect_attempts);
    let mut gate = IdentityGate::default();

    loop {
        let _ = state_tx.send(LinkState::Connecting);
        let (mut ws, _) = match connect_async(config.url.as_str()).await {
            Ok(connected) => connected,
            Err(err) => {
                warn!(url = %config.url, error = %err, "connect failed");
                if !wait_for_retry(&mut policy, &mut outbound_rx, &state_tx).await {
                    let _ = events_tx.send(LinkEvent::GaveUp);
                    return;
                }
                continue;
            }
        };
        policy.reset();
        gate.reset();
        info!(url = %config.url, "connected");

        // Flush the buffered identity before anything else goes out.
        let pending = gate.take_announcement(identity_rx.borrow_and_update().as_deref());
        if let Some(public_key) = pending {
            if send_frame(&mut ws, &ClientFrame::identity(public_key)).await.is_err() {
                let _ = ws.close(None).await;
                if !wait_for_retry(&mut policy, &mut outbound_rx, &state_tx).await {
                    let _ = events_tx.send(LinkEvent::GaveUp);
                    return;
                }
                continue;
            }
        }

        let _ = state_tx.send(LinkState::Open);
        let _ = events_tx.send(LinkEvent::Open);

        loop {
            tokio::select! {
                inbound = ws.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            let _ = events_tx.send(LinkEvent::Inbound(text));
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "socket read failed");
                            break;
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if send_frame(&mut ws, &frame).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // Session gone; close deliberately and stop.
                            let _ = state_tx.send(LinkState::Closing);
                            let _ = ws.close(None).await;
                            let _ = state_tx.send(LinkState::Closed);
                            return;
                        }
                    }
                }
                changed = identity_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let pending = gate.take_announcement(identity_rx.borrow_and_update().as_deref());
                    if let Some(public_key) = pending {
                        if send_frame(&mut ws, &ClientFrame::identity(public_key)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        let _ = state_tx.send(LinkState::Closed);
        let _ = events_tx.send(LinkEvent::Closed);
        let _ = ws.close(None).await;

        if !wait_for_retry(&mut policy, &mut outbound_rx, &state_tx).await {
            let _ = events_tx.send(LinkEvent::GaveUp);
            return;
        }
    }
}

/// Sleep out the fixed reconnect delay, dropping (not queueing) any
/// generic outbound traffic that arrives while the socket is down.
/// Returns false once the retry budget is spent.
async fn wait_for_retry(
    policy: &mut ReconnectPolicy,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    state_tx: &watch::Sender<LinkState>,
) -> bool {
    let Some(delay) = policy.next_delay() else {
        warn!("reconnect budget exhausted");
        let _ = state_tx.send(LinkState::Closed);
        return false;
    };
    debug!(attempt = policy.attempts(), delay_ms = delay.as_millis() as u64, "reconnect scheduled");

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            dropped = outbound_rx.recv() => {
                match dropped {
                    Some(frame) => {
                        warn!(kind = frame.kind(), "socket down; outbound frame dropped");
                    }
                    None => return true,
                }
            }
        }
    }
}

async fn send_frame<S>(ws: &mut S, frame: &ClientFrame) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let encoded = match frame.encode() {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(kind = frame.kind(), error = %err, "frame encode failed");
            return Ok(());
        }
    };
    ws.send(Message::Text(encoded)).await.map_err(|err| {
        warn!(kind = frame.kind(), error = %err, "socket write failed");
    })
}
