//! Broadcast hub fanning serialized envelopes out to subscribers.
//!
//! Producers push into one bounded inbound queue. A single relay task takes
//! messages in arrival order and offers each to every registered subscriber
//! through that subscriber's own bounded queue. The relay never waits on a
//! subscriber: one whose queue is full is disconnected and has to subscribe
//! again. New subscribers only see messages relayed after they registered.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use kubelog_core::{Error, Result};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::HubConfig;

type Subscribers = Arc<Mutex<HashMap<Uuid, mpsc::Sender<Bytes>>>>;

/// The running hub. Owns the relay task.
pub struct BroadcastHub {
    handle: HubHandle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    relay: Option<JoinHandle<()>>,
}

impl BroadcastHub {
    /// Start the relay task.
    ///
    /// Must be called from within a Tokio runtime. Dropping the hub without
    /// calling [`shutdown`](Self::shutdown) also stops the relay.
    pub fn start(config: HubConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let subscribers: Subscribers = Arc::default();

        let relay = tokio::spawn(relay(inbound_rx, Arc::clone(&subscribers), shutdown_rx));

        tracing::debug!(
            inbound_buffer = config.inbound_buffer,
            subscriber_buffer = config.subscriber_buffer,
            "Broadcast hub started"
        );

        Self {
            handle: HubHandle {
                inbound: inbound_tx,
                subscribers,
                subscriber_buffer: config.subscriber_buffer.max(1),
            },
            shutdown_tx: Some(shutdown_tx),
            relay: Some(relay),
        }
    }

    /// A cloneable handle for producers and the session layer.
    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Stop accepting messages, relay what is already queued, then
    /// disconnect every subscriber.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(relay) = self.relay.take() {
            if let Err(e) = relay.await {
                tracing::error!(error = %e, "Broadcast relay task failed");
            }
        }
    }
}

/// Producer and subscriber side of a [`BroadcastHub`].
#[derive(Clone)]
pub struct HubHandle {
    inbound: mpsc::Sender<Bytes>,
    subscribers: Subscribers,
    subscriber_buffer: usize,
}

impl HubHandle {
    /// Queue a serialized message for every subscriber.
    ///
    /// Waits while the inbound queue is full. Fails once the hub has shut down.
    pub async fn broadcast(&self, message: Bytes) -> Result<()> {
        self.inbound
            .send(message)
            .await
            .map_err(|_| Error::HubClosed)
    }

    /// Register a new subscriber.
    ///
    /// After shutdown the returned subscription is already ended.
    pub async fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);

        let mut subscribers = self.subscribers.lock().await;
        if self.inbound.is_closed() {
            tracing::debug!(subscriber = %id, "Subscribe after hub shutdown");
        } else {
            subscribers.insert(id, tx);
            tracing::debug!(subscriber = %id, total = subscribers.len(), "Subscriber connected");
        }

        Subscription { id, rx }
    }

    /// Remove a subscriber. Its subscription ends after the messages already
    /// queued for it.
    pub async fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self.subscribers.lock().await.remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber = %id, "Subscriber disconnected");
        }
        removed
    }

    /// Number of registered subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Whether the hub has stopped accepting messages.
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

/// One subscriber's feed.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<Bytes>,
}

impl Subscription {
    /// Subscriber id, used to unsubscribe.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Next message, or `None` once the subscriber has been disconnected
    /// and its queue is drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

async fn relay(
    mut inbound: mpsc::Receiver<Bytes>,
    subscribers: Subscribers,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            message = inbound.recv() => match message {
                Some(message) => fan_out(&subscribers, message).await,
                None => break,
            },
        }
    }

    inbound.close();
    let mut drained = 0usize;
    while let Ok(message) = inbound.try_recv() {
        fan_out(&subscribers, message).await;
        drained += 1;
    }

    let mut subscribers = subscribers.lock().await;
    let disconnected = subscribers.len();
    subscribers.clear();

    tracing::debug!(drained, disconnected, "Broadcast hub stopped");
}

async fn fan_out(subscribers: &Subscribers, message: Bytes) {
    let targets: Vec<(Uuid, mpsc::Sender<Bytes>)> = subscribers
        .lock()
        .await
        .iter()
        .map(|(id, tx)| (*id, tx.clone()))
        .collect();

    let mut dropped = Vec::new();
    for (id, tx) in targets {
        match tx.try_send(message.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = %id, "Subscriber queue full, disconnecting");
                dropped.push(id);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = %id, "Subscriber went away");
                dropped.push(id);
            }
        }
    }

    if !dropped.is_empty() {
        let mut subscribers = subscribers.lock().await;
        for id in dropped {
            subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    fn msg(n: usize) -> Bytes {
        Bytes::from(format!("message-{n}"))
    }

    async fn next(sub: &mut Subscription) -> Option<Bytes> {
        timeout(WAIT, sub.recv()).await.expect("timed out waiting for message")
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let hub = BroadcastHub::start(HubConfig::default());
        let handle = hub.handle();
        let mut a = handle.subscribe().await;
        let mut b = handle.subscribe().await;

        for n in 0..5 {
            handle.broadcast(msg(n)).await.unwrap();
        }

        for n in 0..5 {
            assert_eq!(next(&mut a).await, Some(msg(n)));
            assert_eq!(next(&mut b).await, Some(msg(n)));
        }
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_backfill() {
        let hub = BroadcastHub::start(HubConfig::default());
        let handle = hub.handle();
        let mut early = handle.subscribe().await;

        for n in 0..3 {
            handle.broadcast(msg(n)).await.unwrap();
        }
        for n in 0..3 {
            assert_eq!(next(&mut early).await, Some(msg(n)));
        }

        let mut late = handle.subscribe().await;
        for n in 3..6 {
            handle.broadcast(msg(n)).await.unwrap();
        }
        for n in 3..6 {
            assert_eq!(next(&mut late).await, Some(msg(n)));
        }

        hub.shutdown().await;
        assert_eq!(next(&mut late).await, None);
    }

    #[tokio::test]
    async fn test_saturated_subscriber_dropped_without_stalling_others() {
        let hub = BroadcastHub::start(HubConfig {
            inbound_buffer: 16,
            subscriber_buffer: 2,
        });
        let handle = hub.handle();
        let mut slow = handle.subscribe().await;
        let mut healthy = handle.subscribe().await;

        for n in 0..10 {
            handle.broadcast(msg(n)).await.unwrap();
            assert_eq!(next(&mut healthy).await, Some(msg(n)));
        }

        assert_eq!(handle.subscriber_count().await, 1);
        assert_eq!(next(&mut slow).await, Some(msg(0)));
        assert_eq!(next(&mut slow).await, Some(msg(1)));
        assert_eq!(next(&mut slow).await, None);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_feed() {
        let hub = BroadcastHub::start(HubConfig::default());
        let handle = hub.handle();
        let mut sub = handle.subscribe().await;

        assert!(handle.unsubscribe(sub.id()).await);
        assert!(!handle.unsubscribe(sub.id()).await);
        handle.broadcast(msg(0)).await.unwrap();

        assert_eq!(next(&mut sub).await, None);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let hub = BroadcastHub::start(HubConfig::default());
        let handle = hub.handle();
        let mut keep = handle.subscribe().await;
        let gone = handle.subscribe().await;
        drop(gone);

        handle.broadcast(msg(0)).await.unwrap();
        assert_eq!(next(&mut keep).await, Some(msg(0)));
        assert_eq!(handle.subscriber_count().await, 1);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_hub() {
        let hub = BroadcastHub::start(HubConfig::default());
        let handle = hub.handle();
        let mut sub = handle.subscribe().await;

        handle.broadcast(msg(0)).await.unwrap();
        hub.shutdown().await;

        assert_eq!(next(&mut sub).await, Some(msg(0)));
        assert_eq!(next(&mut sub).await, None);
        assert!(handle.is_closed());
        assert!(matches!(handle.broadcast(msg(1)).await, Err(Error::HubClosed)));

        let mut after = handle.subscribe().await;
        assert_eq!(next(&mut after).await, None);
        assert_eq!(handle.subscriber_count().await, 0);
    }
}
