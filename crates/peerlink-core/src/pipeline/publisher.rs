//! Publisher: the single path from native callbacks to subscribers
//!
//! `publish` is synchronous and never waits on a subscriber, so it is safe to
//! call from transport-owned threads. Buffering follows [`BufferPolicy`]:
//! - `Unbounded`: one unbounded mpsc queue per subscriber
//! - `DropOldest`: a tokio broadcast channel; lagging subscribers skip the
//!   oldest events and log how many they missed

use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{self, Stream};
use tokio::sync::{broadcast, mpsc};
use tracing::{trace, warn};

use super::PipelineStats;
use crate::config::BufferPolicy;
use crate::event::DomainEvent;

// ----------------------------------------------------------------------------
// Fan-out
// ----------------------------------------------------------------------------

enum Fanout {
    Broadcast(broadcast::Sender<DomainEvent>),
    Unbounded(Vec<mpsc::UnboundedSender<DomainEvent>>),
}

/// Multi-producer, multi-consumer event publisher
pub struct EventPublisher {
    policy: BufferPolicy,
    /// `None` once closed
    fanout: Mutex<Option<Fanout>>,
    stats: Arc<PipelineStats>,
}

impl EventPublisher {
    pub fn new(policy: BufferPolicy, stats: Arc<PipelineStats>) -> Self {
        let fanout = match policy {
            BufferPolicy::Unbounded => Fanout::Unbounded(Vec::new()),
            BufferPolicy::DropOldest { capacity } => {
                let (sender, _) = broadcast::channel(capacity.max(1));
                Fanout::Broadcast(sender)
            }
        };
        Self {
            policy,
            fanout: Mutex::new(Some(fanout)),
            stats,
        }
    }

    fn fanout(&self) -> MutexGuard<'_, Option<Fanout>> {
        self.fanout.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    /// Hand `event` to every current subscriber.
    ///
    /// Returns `false` only when the publisher is closed; publishing with no
    /// subscribers is not a failure.
    pub fn publish(&self, event: DomainEvent) -> bool {
        let mut fanout = self.fanout();
        match fanout.as_mut() {
            None => {
                trace!("Publish after close ignored: {}", event.name());
                self.stats.record_publish_after_close();
                false
            }
            Some(Fanout::Broadcast(sender)) => {
                // Err only means nobody is listening right now.
                let _ = sender.send(event);
                self.stats.record_published();
                true
            }
            Some(Fanout::Unbounded(senders)) => {
                senders.retain(|sender| sender.send(event.clone()).is_ok());
                self.stats.record_published();
                true
            }
        }
    }

    /// Subscribe to every event published from now on
    pub fn subscribe(&self) -> Subscription {
        let mut fanout = self.fanout();
        let receiver = match fanout.as_mut() {
            Some(Fanout::Broadcast(sender)) => Receiver::Broadcast(sender.subscribe()),
            Some(Fanout::Unbounded(senders)) => {
                let (sender, receiver) = mpsc::unbounded_channel();
                senders.push(sender);
                Receiver::Unbounded(receiver)
            }
            // Closed: hand out a subscription that ends immediately
            None => {
                let (_, receiver) = mpsc::unbounded_channel();
                Receiver::Unbounded(receiver)
            }
        };
        Subscription {
            receiver,
            stats: self.stats.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        match self.fanout().as_ref() {
            Some(Fanout::Broadcast(sender)) => sender.receiver_count(),
            Some(Fanout::Unbounded(senders)) => {
                senders.iter().filter(|s| !s.is_closed()).count()
            }
            None => 0,
        }
    }

    /// Dispose the publisher. Subscribers drain what is buffered, then end.
    pub fn close(&self) {
        if self.fanout().take().is_some() {
            trace!("Publisher closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.fanout().is_none()
    }
}

impl core::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("policy", &self.policy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Subscription
// ----------------------------------------------------------------------------

enum Receiver {
    Broadcast(broadcast::Receiver<DomainEvent>),
    Unbounded(mpsc::UnboundedReceiver<DomainEvent>),
}

/// One subscriber's ordered view of the event stream
pub struct Subscription {
    receiver: Receiver,
    stats: Arc<PipelineStats>,
}

impl Subscription {
    /// Next event, or `None` once the publisher is closed and drained
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        match &mut self.receiver {
            Receiver::Unbounded(receiver) => receiver.recv().await,
            Receiver::Broadcast(receiver) => loop {
                match receiver.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Subscriber lagged, {} events skipped", skipped);
                        self.stats.record_lagged(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    /// Next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<DomainEvent> {
        match &mut self.receiver {
            Receiver::Unbounded(receiver) => receiver.try_recv().ok(),
            Receiver::Broadcast(receiver) => loop {
                match receiver.try_recv() {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        warn!("Subscriber lagged, {} events skipped", skipped);
                        self.stats.record_lagged(skipped);
                    }
                    Err(_) => return None,
                }
            },
        }
    }

    /// Drain every event currently buffered
    pub fn drain(&mut self) -> Vec<DomainEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn into_stream(self) -> impl Stream<Item = DomainEvent> + Send {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|event| (event, subscription))
        })
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self.receiver {
            Receiver::Broadcast(_) => "broadcast",
            Receiver::Unbounded(_) => "unbounded",
        };
        f.debug_struct("Subscription").field("receiver", &kind).finish()
    }
}
