//! Subscription bridge for Rollstream.
//!
//! Relays a room's two pub/sub channels (history and updates) into a
//! bounded per-client queue, interleaving keepalives, until the client
//! goes away or the caller cancels.
//!
//! # Lifecycle
//!
//! ```text
//! Attaching ──subscribe ok──> Active ──cancel / client gone / store closed──> Canceling ──> Closed
//!     │
//!     └──subscribe failed──> Closed   (attach returns BridgeError::Subscribe)
//! ```
//!
//! The relay loop never blocks indefinitely on the store: each receive is
//! bounded by [`BridgeConfig::receive_timeout`], so cancellation is observed
//! within one timeout. Releasing the subscription happens exactly once,
//! either through the explicit close at the end of the loop or through the
//! subscription's own `Drop` if the task is aborted.
//!
//! # Integration
//!
//! ```ignore
//! let cancel = CancellationToken::new();
//! let (bridge, mut rx) = Bridge::attach(&backend, &room, BridgeConfig::default(), cancel.clone()).await?;
//! while let Some(message) = rx.recv().await {
//!     match message {
//!         BridgeMessage::Event(json) => { /* SSE "event" */ }
//!         BridgeMessage::Update(json) => { /* SSE "update" */ }
//!         BridgeMessage::Keepalive => { /* SSE "ping" */ }
//!     }
//! }
//! let reason = bridge.closed().await;
//! ```

use std::fmt;
use std::time::Duration;

use rollstream_protocol::RoomId;
use rollstream_store::{Backend, Notification, StoreError, Subscription, keys};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Floor for [`BridgeConfig::receive_timeout`]; anything lower would spin.
const MIN_RECEIVE_TIMEOUT: Duration = Duration::from_millis(10);

/// Tuning for one bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound on a single wait for a store message. Also the worst-case
    /// delay before a cancellation is noticed.
    pub receive_timeout: Duration,
    /// How often a [`BridgeMessage::Keepalive`] is offered to the client.
    pub keepalive_interval: Duration,
    /// Capacity of the outbound queue.
    pub queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(20),
            queue_capacity: 32,
        }
    }
}

impl BridgeConfig {
    /// Clamps values that would make the relay loop misbehave.
    fn sanitized(mut self) -> Self {
        if self.receive_timeout < MIN_RECEIVE_TIMEOUT {
            warn!(
                requested = ?self.receive_timeout,
                "receive timeout too small, clamping"
            );
            self.receive_timeout = MIN_RECEIVE_TIMEOUT;
        }
        if self.keepalive_interval.is_zero() {
            self.keepalive_interval = BridgeConfig::default().keepalive_interval;
        }
        self.queue_capacity = self.queue_capacity.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// Messages and state
// ---------------------------------------------------------------------------

/// One item delivered to the client, carrying the store payload verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeMessage {
    /// A serialized event from the history channel.
    Event(String),
    /// A serialized update from the updates channel.
    Update(String),
    Keepalive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Attaching,
    Active,
    Canceling,
    Closed,
}

/// Why a bridge stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The cancellation token fired.
    Cancelled,
    /// The client dropped its end of the queue.
    ReceiverDropped,
    /// The store ended the subscription.
    SubscriptionClosed,
    /// Receiving from the store failed.
    ReceiveFailed(String),
    /// The relay task panicked or was aborted.
    Aborted,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::ReceiverDropped => f.write_str("receiver dropped"),
            Self::SubscriptionClosed => f.write_str("subscription closed"),
            Self::ReceiveFailed(e) => write!(f, "receive failed: {e}"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to subscribe to room {room}: {source}")]
    Subscribe {
        room: RoomId,
        #[source]
        source: StoreError,
    },
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Handle to a running relay task.
///
/// Dropping the handle does not stop the relay; cancel the token or drop
/// the receiver for that.
#[derive(Debug)]
pub struct Bridge {
    room: RoomId,
    state: watch::Receiver<BridgeState>,
    cancel: CancellationToken,
    task: JoinHandle<CloseReason>,
}

impl Bridge {
    /// Subscribes to `room`'s history and update channels and starts
    /// relaying into a fresh queue.
    ///
    /// On subscribe failure nothing is spawned and the bridge never
    /// becomes [`BridgeState::Active`].
    pub async fn attach<B: Backend>(
        backend: &B,
        room: &RoomId,
        config: BridgeConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<BridgeMessage>), BridgeError> {
        let config = config.sanitized();
        let (state_tx, state) = watch::channel(BridgeState::Attaching);
        let history = keys::history(room.as_str());
        let updates = keys::updates(room.as_str());

        let subscription = match backend.subscribe(&[history.clone(), updates]).await {
            Ok(subscription) => subscription,
            Err(source) => {
                state_tx.send_replace(BridgeState::Closed);
                warn!(room = %room, error = %source, "bridge subscribe failed");
                return Err(BridgeError::Subscribe {
                    room: room.clone(),
                    source,
                });
            }
        };

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        state_tx.send_replace(BridgeState::Active);
        debug!(room = %room, "bridge active");

        let relay = Relay {
            room: room.clone(),
            history,
            config,
            tx,
            cancel: cancel.clone(),
            state: state_tx,
        };
        let task = tokio::spawn(relay.run(subscription));

        Ok((
            Self {
                room: room.clone(),
                state,
                cancel,
                task,
            },
            rx,
        ))
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    /// Requests shutdown. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the relay task to finish and reports why it stopped.
    pub async fn closed(self) -> CloseReason {
        match self.task.await {
            Ok(reason) => reason,
            Err(e) => {
                warn!(room = %self.room, error = %e, "bridge task did not finish cleanly");
                CloseReason::Aborted
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Relay loop
// ---------------------------------------------------------------------------

struct Relay {
    room: RoomId,
    history: String,
    config: BridgeConfig,
    tx: mpsc::Sender<BridgeMessage>,
    cancel: CancellationToken,
    state: watch::Sender<BridgeState>,
}

impl Relay {
    async fn run<S: Subscription>(self, mut subscription: S) -> CloseReason {
        let interval = self.config.keepalive_interval;
        let mut keepalive = time::interval_at(Instant::now() + interval, interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break CloseReason::Cancelled,
                _ = self.tx.closed() => break CloseReason::ReceiverDropped,
                _ = keepalive.tick() => {
                    // Keepalives never wait for queue space.
                    match self.tx.try_send(BridgeMessage::Keepalive) {
                        Ok(()) => trace!(room = %self.room, "keepalive queued"),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            trace!(room = %self.room, "queue full, keepalive skipped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            break CloseReason::ReceiverDropped;
                        }
                    }
                }
                received = subscription.recv(self.config.receive_timeout) => match received {
                    Ok(None) => {}
                    Ok(Some(note)) => {
                        if let Some(reason) = self.forward(note).await {
                            break reason;
                        }
                    }
                    Err(StoreError::Closed) => break CloseReason::SubscriptionClosed,
                    Err(e) => break CloseReason::ReceiveFailed(e.to_string()),
                },
            }
        };

        self.state.send_replace(BridgeState::Canceling);
        subscription.close().await;
        self.state.send_replace(BridgeState::Closed);
        debug!(room = %self.room, reason = %reason, "bridge closed");
        reason
    }

    /// Enqueues one store message, waiting for queue space unless the
    /// bridge is cancelled meanwhile.
    async fn forward(&self, note: Notification) -> Option<CloseReason> {
        let message = if note.channel == self.history {
            BridgeMessage::Event(note.payload)
        } else {
            BridgeMessage::Update(note.payload)
        };

        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Some(CloseReason::Cancelled),
            sent = self.tx.send(message) => match sent {
                Ok(()) => None,
                Err(_) => Some(CloseReason::ReceiverDropped),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
