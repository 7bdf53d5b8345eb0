use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use huddle_types::events::GatewayEvent;

use crate::dispatcher::Dispatcher;

/// Default inactivity window before a typing indicator expires on its own.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(1);

struct TypingEntry {
    conn_id: Uuid,
    /// Bumped on every refresh; an expiry timer only fires if its captured
    /// generation still matches, so stale timers become no-ops.
    generation: u64,
}

/// Ephemeral per-(channel, user) "is typing" state. The server-side timer is
/// authoritative: an indicator is always cleared within the timeout even if
/// the client never sends stop_typing or disconnects mid-keystroke.
#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<TypingInner>,
}

struct TypingInner {
    dispatcher: Dispatcher,
    states: Mutex<HashMap<(Uuid, Uuid), TypingEntry>>,
    timeout: Duration,
}

impl TypingTracker {
    pub fn new(dispatcher: Dispatcher, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                dispatcher,
                states: Mutex::new(HashMap::new()),
                timeout,
            }),
        }
    }

    /// Idle -> Typing broadcasts user_typing to the channel's other
    /// subscribers and arms the inactivity timer. Repeated calls while
    /// already Typing refresh the timer without re-broadcasting.
    pub async fn start(&self, channel_id: Uuid, user_id: Uuid, username: &str, conn_id: Uuid) {
        let generation = {
            let mut states = self.inner.states.lock().await;
            match states.get_mut(&(channel_id, user_id)) {
                Some(entry) => {
                    entry.generation += 1;
                    entry.conn_id = conn_id;
                    entry.generation
                }
                None => {
                    states.insert(
                        (channel_id, user_id),
                        TypingEntry {
                            conn_id,
                            generation: 0,
                        },
                    );
                    self.inner
                        .dispatcher
                        .fan_out_except(
                            channel_id,
                            conn_id,
                            GatewayEvent::UserTyping {
                                channel_id,
                                user_id,
                                username: username.to_string(),
                            },
                        )
                        .await;
                    0
                }
            }
        };

        // One timer per start/refresh; only the latest generation fires.
        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.inner.timeout).await;
            tracker.expire(channel_id, user_id, generation).await;
        });
    }

    /// Typing -> Idle. Idempotent: stopping an already-idle user does
    /// nothing and broadcasts nothing.
    pub async fn stop(&self, channel_id: Uuid, user_id: Uuid) {
        let removed = self
            .inner
            .states
            .lock()
            .await
            .remove(&(channel_id, user_id))
            .is_some();
        if removed {
            self.broadcast_stop(channel_id, user_id).await;
        }
    }

    /// Clear every typing state owned by a closing connection, broadcasting
    /// stop on its behalf so peers never see a permanently stuck indicator.
    pub async fn clear_connection(&self, conn_id: Uuid) {
        let owned: Vec<(Uuid, Uuid)> = {
            let mut states = self.inner.states.lock().await;
            let keys: Vec<_> = states
                .iter()
                .filter(|(_, entry)| entry.conn_id == conn_id)
                .map(|(&key, _)| key)
                .collect();
            for key in &keys {
                states.remove(key);
            }
            keys
        };

        for (channel_id, user_id) in owned {
            debug!("clearing typing state for {} in {} on disconnect", user_id, channel_id);
            self.broadcast_stop(channel_id, user_id).await;
        }
    }

    async fn expire(&self, channel_id: Uuid, user_id: Uuid, generation: u64) {
        let removed = {
            let mut states = self.inner.states.lock().await;
            match states.get(&(channel_id, user_id)) {
                Some(entry) if entry.generation == generation => {
                    states.remove(&(channel_id, user_id));
                    true
                }
                // Refreshed since this timer was armed, or already stopped
                _ => false,
            }
        };
        if removed {
            self.broadcast_stop(channel_id, user_id).await;
        }
    }

    async fn broadcast_stop(&self, channel_id: Uuid, user_id: Uuid) {
        self.inner
            .dispatcher
            .fan_out(
                channel_id,
                GatewayEvent::UserStopTyping {
                    channel_id,
                    user_id,
                },
            )
            .await;
    }
}
