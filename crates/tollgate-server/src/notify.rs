//! Payment-completed notification fan-out.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// A completed payment, identified the way subscribers wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub session_id: String,
    pub reference: String,
}

/// Per-context subscriber table plus the bus connecting worker contexts.
///
/// Subscribers register against a (session, reference) key and receive one
/// message when that invoice completes, after which their channel closes.
/// Completions are published to the bus as well as delivered locally, so a
/// payment landing on one worker context wakes subscribers parked on
/// another; contexts share nothing but the bus handle they were built with.
pub struct NotificationHub {
    bus: broadcast::Sender<PaymentEvent>,
    subscribers: Mutex<HashMap<(String, String), Vec<mpsc::Sender<()>>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(64);
        NotificationHub::with_bus(bus)
    }

    /// Attach a hub to an existing bus, joining the publishing group of
    /// every other hub built on the same sender.
    pub fn with_bus(bus: broadcast::Sender<PaymentEvent>) -> Self {
        NotificationHub {
            bus,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> broadcast::Sender<PaymentEvent> {
        self.bus.clone()
    }

    /// Wait for an invoice to complete. Any number of subscriptions may be
    /// open against the same key at once.
    pub fn subscribe(&self, session_id: &str, reference: &str) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let mut subscribers = self.subscribers.lock().unwrap();
        let list = subscribers
            .entry((session_id.to_string(), reference.to_string()))
            .or_default();
        list.retain(|sender| !sender.is_closed());
        list.push(tx);
        rx
    }

    /// Announce a completion: deliver to local subscribers and rebroadcast
    /// on the bus for the other worker contexts.
    pub fn publish(&self, event: PaymentEvent) {
        self.deliver_local(&event);
        // No receivers just means no other context is listening.
        let _ = self.bus.send(event);
    }

    fn deliver_local(&self, event: &PaymentEvent) {
        let senders = {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.remove(&(event.session_id.clone(), event.reference.clone()))
        };

        let Some(senders) = senders else {
            // Nobody waiting; the client sees paid_at on its next poll.
            return;
        };

        tracing::debug!(
            "notifying {} subscriber(s) for invoice {}",
            senders.len(),
            event.reference
        );
        for sender in senders {
            let _ = sender.try_send(());
        }
        // Dropping the senders closes every subscriber stream.
    }

    /// Forward bus events into this hub's local subscriber table until
    /// cancelled. Each worker context runs one forwarder.
    pub async fn forward(&self, cancel: CancellationToken) {
        let mut rx = self.bus.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => self.deliver_local(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("notification bus lagged, {skipped} event(s) dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        NotificationHub::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn event(session: &str, reference: &str) -> PaymentEvent {
        PaymentEvent {
            session_id: session.into(),
            reference: reference.into(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_gets_one_message_then_closes() {
        let hub = NotificationHub::new();
        let mut first = hub.subscribe("s", "r");
        let mut second = hub.subscribe("s", "r");

        hub.publish(event("s", "r"));

        assert_eq!(first.recv().await, Some(()));
        assert_eq!(first.recv().await, None);
        assert_eq!(second.recv().await, Some(()));
        assert_eq!(second.recv().await, None);
    }

    #[tokio::test]
    async fn publishing_with_no_subscribers_is_dropped() {
        let hub = NotificationHub::new();
        hub.publish(event("s", "r"));

        // A later subscriber does not see historical events.
        let mut late = hub.subscribe("s", "r");
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let hub = NotificationHub::new();
        let mut target = hub.subscribe("s", "r1");
        let mut bystander = hub.subscribe("s", "r2");

        hub.publish(event("s", "r1"));

        assert_eq!(target.recv().await, Some(()));
        assert!(bystander.try_recv().is_err());
    }

    #[tokio::test]
    async fn completions_cross_worker_contexts_over_the_bus() {
        let first = Arc::new(NotificationHub::new());
        let second = Arc::new(NotificationHub::with_bus(first.bus()));

        let cancel = CancellationToken::new();
        let forwarder = {
            let second = Arc::clone(&second);
            let cancel = cancel.clone();
            tokio::spawn(async move { second.forward(cancel).await })
        };

        let mut sub = second.subscribe("s", "r");
        first.publish(event("s", "r"));

        assert_eq!(sub.recv().await, Some(()));
        cancel.cancel();
        forwarder.await.unwrap();
    }
}
