//! Typed event topics.
//!
//! Publications go through a broadcast channel, so a `publish` from inside
//! the serializer (via a commit hook) never blocks; slow subscribers drop
//! old events rather than applying backpressure to the writer.

use hoard_core::ServiceId;
use hoard_core::id::AccountKey;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A repository published new update bundles.
    UpdateCreated { service_id: ServiceId },
    /// The nullifier advanced past an update window.
    NullificationAdvanced { service_id: ServiceId },
    /// Account state changed; session caches must refresh these accounts.
    AccountsChanged {
        service_id: ServiceId,
        account_keys: Vec<AccountKey>,
    },
    /// An account type changed; every session of the service must refresh.
    AccountTypesChanged { service_id: ServiceId },
}

#[derive(Debug, Clone)]
pub struct PubSub {
    tx: broadcast::Sender<Event>,
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let pubsub = PubSub::new();
        let mut rx = pubsub.subscribe();

        let event = Event::UpdateCreated {
            service_id: ServiceId::new(3),
        };
        pubsub.publish(event.clone());
        assert_eq!(rx.recv().await.expect("subscribed"), event);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let pubsub = PubSub::new();
        pubsub.publish(Event::AccountTypesChanged {
            service_id: ServiceId::new(1),
        });
    }
}
