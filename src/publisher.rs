//! Event delivery to observers
//!
//! The engine only sees [`TickPublisher`]. Publishing is fire-and-forget:
//! implementations must return immediately, and a slow or missing observer
//! shows up as an error value the engine logs and drops.

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::PublishError;
use crate::models::TickEvent;

/// Capability to push tick events to whoever is listening
pub trait TickPublisher: Send + Sync {
    fn publish(&self, event: TickEvent) -> Result<(), PublishError>;
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl TickPublisher for NullPublisher {
    fn publish(&self, _event: TickEvent) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Fan-out to any number of subscribers over a bounded broadcast channel
///
/// A subscriber that falls behind by more than the capacity loses the oldest
/// events; it never slows the sender down.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<TickEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every athlete's events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TickEvent> {
        self.tx.subscribe()
    }

    /// Receive one athlete's events from now on
    pub fn subscribe_athlete(&self, athlete_id: impl Into<String>) -> AthleteSubscription {
        AthleteSubscription {
            athlete_id: athlete_id.into(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl TickPublisher for BroadcastPublisher {
    fn publish(&self, event: TickEvent) -> Result<(), PublishError> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| PublishError::NoSubscribers)
    }
}

/// Live event stream filtered to a single athlete
#[derive(Debug)]
pub struct AthleteSubscription {
    athlete_id: String,
    rx: broadcast::Receiver<TickEvent>,
}

impl AthleteSubscription {
    pub fn athlete_id(&self) -> &str {
        &self.athlete_id
    }

    /// Next event for this athlete; skips over missed events
    pub async fn recv(&mut self) -> Result<TickEvent, PublishError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.athlete_id == self.athlete_id => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(athlete_id = %self.athlete_id, missed, "Subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(PublishError::Closed),
            }
        }
    }
}

/// Forwards events into a bounded mpsc channel, dropping them when it is full
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<TickEvent>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TickEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl TickPublisher for ChannelPublisher {
    fn publish(&self, event: TickEvent) -> Result<(), PublishError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(event) => {
                debug!(athlete_id = %event.athlete_id, "Event channel full, dropping event");
                PublishError::Full
            }
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }
}
