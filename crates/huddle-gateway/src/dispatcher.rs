use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

use huddle_types::events::GatewayEvent;

/// One live connection's handle inside the dispatcher. Outbound events go
/// through an unbounded queue drained by the connection's own send task, so
/// a slow consumer can never stall a broadcaster.
struct ConnectionHandle {
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// Registry of live connections and per-channel subscriber sets. All
/// cross-connection mutation goes through this object; per-channel state is
/// serialized by the table locks plus a per-channel send lock that keeps
/// message fan-out in store commit order.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// conn_id -> handle
    connections: RwLock<HashMap<Uuid, ConnectionHandle>>,

    /// channel_id -> conn_ids currently subscribed
    subscribers: RwLock<HashMap<Uuid, HashSet<Uuid>>>,

    /// channel_id -> lock held across append + fan-out for that channel
    send_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connections: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(HashMap::new()),
                send_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a connection. Returns its id and the receiver its send task
    /// drains into the socket.
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .await
            .insert(conn_id, ConnectionHandle { tx });
        (conn_id, rx)
    }

    /// Remove a connection and every subscription it holds. Returns the
    /// channels it was subscribed to so callers can finish per-channel
    /// cleanup (typing state).
    pub async fn unregister(&self, conn_id: Uuid) -> Vec<Uuid> {
        self.inner.connections.write().await.remove(&conn_id);

        let mut subscribers = self.inner.subscribers.write().await;
        let mut was_in = Vec::new();
        subscribers.retain(|&channel_id, conns| {
            if conns.remove(&conn_id) {
                was_in.push(channel_id);
            }
            !conns.is_empty()
        });
        was_in
    }

    pub async fn subscribe(&self, conn_id: Uuid, channel_id: Uuid) {
        self.inner
            .subscribers
            .write()
            .await
            .entry(channel_id)
            .or_default()
            .insert(conn_id);
    }

    /// Idempotent: unsubscribing a connection that is not subscribed is a
    /// no-op.
    pub async fn unsubscribe(&self, conn_id: Uuid, channel_id: Uuid) {
        let mut subscribers = self.inner.subscribers.write().await;
        if let Some(conns) = subscribers.get_mut(&channel_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                subscribers.remove(&channel_id);
            }
        }
    }

    pub async fn is_subscribed(&self, conn_id: Uuid, channel_id: Uuid) -> bool {
        self.inner
            .subscribers
            .read()
            .await
            .get(&channel_id)
            .is_some_and(|conns| conns.contains(&conn_id))
    }

    /// Targeted send to one connection. A send to a closed queue is simply
    /// dropped; the connection is being torn down anyway.
    pub async fn send_to(&self, conn_id: Uuid, event: GatewayEvent) {
        let connections = self.inner.connections.read().await;
        if let Some(handle) = connections.get(&conn_id) {
            let _ = handle.tx.send(event);
        }
    }

    /// Deliver an event to every connection subscribed to the channel.
    pub async fn fan_out(&self, channel_id: Uuid, event: GatewayEvent) {
        self.fan_out_inner(channel_id, None, event).await;
    }

    /// Deliver to every subscriber except one connection (used for typing
    /// indicators, which the typer never needs to see).
    pub async fn fan_out_except(&self, channel_id: Uuid, skip: Uuid, event: GatewayEvent) {
        self.fan_out_inner(channel_id, Some(skip), event).await;
    }

    async fn fan_out_inner(&self, channel_id: Uuid, skip: Option<Uuid>, event: GatewayEvent) {
        let subscribers = self.inner.subscribers.read().await;
        let Some(conns) = subscribers.get(&channel_id) else {
            return;
        };

        let connections = self.inner.connections.read().await;
        for &conn_id in conns.iter() {
            if skip == Some(conn_id) {
                continue;
            }
            if let Some(handle) = connections.get(&conn_id) {
                let _ = handle.tx.send(event.clone());
            }
        }
    }

    /// Lock held across append + fan-out for one channel so concurrent
    /// senders cannot interleave between a store commit and its broadcast.
    pub async fn channel_lock(&self, channel_id: Uuid) -> Arc<Mutex<()>> {
        self.inner
            .send_locks
            .lock()
            .await
            .entry(channel_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_types::events::GatewayEvent;

    fn error_event(message: &str) -> GatewayEvent {
        GatewayEvent::Error {
            message: message.into(),
        }
    }

    fn event_message(event: &GatewayEvent) -> &str {
        match event {
            GatewayEvent::Error { message } => message,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_all_subscribers_and_nobody_else() {
        let dispatcher = Dispatcher::new();
        let channel = Uuid::new_v4();

        let (a, mut rx_a) = dispatcher.register().await;
        let (b, mut rx_b) = dispatcher.register().await;
        let (_c, mut rx_c) = dispatcher.register().await;

        dispatcher.subscribe(a, channel).await;
        dispatcher.subscribe(b, channel).await;
        // c never subscribes

        dispatcher.fan_out(channel, error_event("hello")).await;

        assert_eq!(event_message(&rx_a.recv().await.unwrap()), "hello");
        assert_eq!(event_message(&rx_b.recv().await.unwrap()), "hello");
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn fan_out_except_skips_the_originator() {
        let dispatcher = Dispatcher::new();
        let channel = Uuid::new_v4();

        let (typer, mut rx_typer) = dispatcher.register().await;
        let (peer, mut rx_peer) = dispatcher.register().await;
        dispatcher.subscribe(typer, channel).await;
        dispatcher.subscribe(peer, channel).await;

        dispatcher
            .fan_out_except(channel, typer, error_event("typing"))
            .await;

        assert!(rx_typer.try_recv().is_err());
        assert_eq!(event_message(&rx_peer.recv().await.unwrap()), "typing");
    }

    #[tokio::test]
    async fn subscribers_observe_events_in_publish_order() {
        let dispatcher = Dispatcher::new();
        let channel = Uuid::new_v4();

        let (a, mut rx_a) = dispatcher.register().await;
        let (b, mut rx_b) = dispatcher.register().await;
        dispatcher.subscribe(a, channel).await;
        dispatcher.subscribe(b, channel).await;

        for i in 0..20 {
            dispatcher.fan_out(channel, error_event(&i.to_string())).await;
        }

        for rx in [&mut rx_a, &mut rx_b] {
            for i in 0..20 {
                let event = rx.recv().await.unwrap();
                assert_eq!(event_message(&event), i.to_string());
            }
        }
    }

    #[tokio::test]
    async fn unregister_removes_every_subscription() {
        let dispatcher = Dispatcher::new();
        let ch1 = Uuid::new_v4();
        let ch2 = Uuid::new_v4();

        let (conn, _rx) = dispatcher.register().await;
        dispatcher.subscribe(conn, ch1).await;
        dispatcher.subscribe(conn, ch2).await;

        let mut was_in = dispatcher.unregister(conn).await;
        was_in.sort();
        let mut expected = vec![ch1, ch2];
        expected.sort();
        assert_eq!(was_in, expected);

        assert!(!dispatcher.is_subscribed(conn, ch1).await);
        assert!(!dispatcher.is_subscribed(conn, ch2).await);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let dispatcher = Dispatcher::new();
        let channel = Uuid::new_v4();
        let (conn, _rx) = dispatcher.register().await;

        dispatcher.subscribe(conn, channel).await;
        dispatcher.unsubscribe(conn, channel).await;
        dispatcher.unsubscribe(conn, channel).await;
        assert!(!dispatcher.is_subscribed(conn, channel).await);
    }
}
