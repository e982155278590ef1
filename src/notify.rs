use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-specialist broadcast of committed events.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a specialist's events. Creates the channel if needed.
    pub fn subscribe(&self, specialist_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(specialist_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening. A channel whose last receiver has gone
    /// away is dropped.
    pub fn send(&self, specialist_id: Ulid, event: &Event) {
        let closed = match self.channels.get(&specialist_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => return,
        };
        if closed {
            self.channels
                .remove_if(&specialist_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancelled(specialist_id: Ulid) -> Event {
        Event::BookingCancelled {
            id: Ulid::new(),
            specialist_id,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        let mut rx = hub.subscribe(sid);

        let event = cancelled(sid);
        hub.send(sid, &event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn events_stay_per_specialist() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);
        let _rx_b = hub.subscribe(b);

        hub.send(b, &cancelled(b));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        hub.send(sid, &cancelled(sid));
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn dropped_receivers_release_channel() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        drop(hub.subscribe(sid));
        assert_eq!(hub.channel_count(), 1);
        hub.send(sid, &cancelled(sid));
        assert_eq!(hub.channel_count(), 0);
    }
}
