use crate::subscriber::Subscriber;
use conductor_core::Envelope;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct Subscription {
    id: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// In-process publish/subscribe bus.
///
/// Every subscription owns an unbounded queue drained by its own task, so
/// `publish` never waits on a consumer and a slow consumer only delays
/// itself. Order is preserved per channel per publisher. There is no
/// de-duplication and no redelivery: a subscriber whose queue has closed is
/// dropped, and re-subscribing is the owner's job.
pub struct MessageBus {
    topics: RwLock<HashMap<String, Vec<Subscription>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Register `subscriber` on `channel`.
    ///
    /// Returns `false` if a subscriber with the same id is already
    /// registered there. Must be called from within a Tokio runtime: the
    /// delivery loop is spawned onto it.
    pub fn subscribe(&self, channel: &str, subscriber: Arc<dyn Subscriber>) -> bool {
        let mut topics = self.topics.write();
        let subs = topics.entry(channel.to_string()).or_default();
        if subs.iter().any(|s| s.id == subscriber.id() && !s.tx.is_closed()) {
            return false;
        }
        subs.retain(|s| s.id != subscriber.id());

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let channel_name = channel.to_string();
        let handler = subscriber.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let kind = envelope.message.kind();
                if let Err(e) = handler.handle(envelope).await {
                    warn!(
                        channel = %channel_name,
                        subscriber = %handler.id(),
                        kind,
                        error = %e,
                        "Subscriber failed to handle message"
                    );
                }
            }
            debug!(channel = %channel_name, subscriber = %handler.id(), "Delivery loop ended");
        });

        subs.push(Subscription {
            id: subscriber.id().to_string(),
            tx,
        });
        debug!(channel = %channel, subscriber = %subscriber.id(), "Subscribed");
        true
    }

    /// Register a stream-style listener and hand back its receiving end.
    ///
    /// Returns `None` if `id` is already listening on `channel`. Dropping the
    /// receiver disconnects the listener.
    pub fn listen(&self, channel: &str, id: &str) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        let mut topics = self.topics.write();
        let subs = topics.entry(channel.to_string()).or_default();
        if subs.iter().any(|s| s.id == id && !s.tx.is_closed()) {
            return None;
        }
        subs.retain(|s| s.id != id);
        let (tx, rx) = mpsc::unbounded_channel();
        subs.push(Subscription {
            id: id.to_string(),
            tx,
        });
        Some(rx)
    }

    /// Remove a subscriber. Its delivery loop finishes the messages already
    /// queued and then stops.
    pub fn unsubscribe(&self, channel: &str, id: &str) -> bool {
        let mut topics = self.topics.write();
        match topics.get_mut(channel) {
            Some(subs) => {
                let before = subs.len();
                subs.retain(|s| s.id != id);
                before != subs.len()
            }
            None => false,
        }
    }

    /// Deliver `envelope` to every current subscriber of `channel`.
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, channel: &str, envelope: Envelope) -> usize {
        let mut delivered = 0;
        let mut saw_closed = false;
        {
            let topics = self.topics.read();
            let Some(subs) = topics.get(channel) else {
                return 0;
            };
            for sub in subs {
                if sub.tx.send(envelope.clone()).is_ok() {
                    delivered += 1;
                } else {
                    saw_closed = true;
                }
            }
        }
        if saw_closed {
            self.prune(channel);
        }
        delivered
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.topics
            .read()
            .get(channel)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Names of channels that have at least one subscriber.
    pub fn channel_names(&self) -> Vec<String> {
        self.topics
            .read()
            .iter()
            .filter(|(_, subs)| !subs.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn prune(&self, channel: &str) {
        let mut topics = self.topics.write();
        if let Some(subs) = topics.get_mut(channel) {
            subs.retain(|s| {
                let open = !s.tx.is_closed();
                if !open {
                    debug!(channel = %channel, subscriber = %s.id, "Dropping disconnected subscriber");
                }
                open
            });
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
