use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use huddle_db::Database;
use huddle_registry::ChannelRegistry;
use huddle_types::error::ChatError;
use huddle_types::events::{GatewayCommand, GatewayEvent};
use huddle_types::models::Message;

use crate::dispatcher::Dispatcher;
use crate::typing::TypingTracker;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Deadline for the client to identify after the socket opens.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection needs to serve commands.
#[derive(Clone)]
pub struct GatewayContext {
    pub dispatcher: Dispatcher,
    pub typing: TypingTracker,
    pub registry: ChannelRegistry,
    pub db: Arc<Database>,
}

/// Handle a single WebSocket connection end to end:
/// Connecting -> Authenticated (identify handshake) -> Active (command loop)
/// -> Closed (full cleanup, including typing state).
pub async fn handle_connection(socket: WebSocket, ctx: GatewayContext, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    // Connecting -> Authenticated: first frame must be a valid Identify.
    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            let failure = GatewayEvent::Error {
                message: ChatError::AuthenticationFailure.to_string(),
            };
            if let Ok(text) = serde_json::to_string(&failure) {
                let _ = sender.send(WsMessage::Text(text.into())).await;
            }
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    let Ok(ready_text) = serde_json::to_string(&ready) else {
        return;
    };
    if sender.send(WsMessage::Text(ready_text.into())).await.is_err() {
        return;
    }

    // Authenticated -> Active: register with the dispatcher and start the
    // send/recv task pair.
    let (conn_id, mut outbound_rx) = ctx.dispatcher.register().await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Drain the per-connection queue into the socket, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = outbound_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("failed to serialize gateway event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client.
    let ctx_recv = ctx.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                WsMessage::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&ctx_recv, conn_id, user_id, &username_recv, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            frame_preview(&text)
                        );
                        let invalid = ChatError::invalid("unrecognized command");
                        ctx_recv
                            .dispatcher
                            .send_to(conn_id, error_event(&invalid))
                            .await;
                    }
                },
                WsMessage::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Active -> Closed: drop all subscriptions, then clear typing state this
    // connection owned so peers receive user_stop_typing on its behalf.
    ctx.dispatcher.unregister(conn_id).await;
    ctx.typing.clear_connection(conn_id).await;

    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use huddle_types::api::Claims;
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let deadline = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let WsMessage::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    deadline.await.ok().flatten()
}

async fn handle_command(
    ctx: &GatewayContext,
    conn_id: Uuid,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
) {
    if let Err(err) = dispatch_command(ctx, conn_id, user_id, username, cmd).await {
        if let ChatError::Storage(ref inner) = err {
            error!("{} ({}) command failed: {:#}", username, user_id, inner);
        }
        ctx.dispatcher.send_to(conn_id, error_event(&err)).await;
    }
}

/// A contract violation on a single command never terminates the
/// connection: it comes back here as an error and is reported to the
/// offending client only.
async fn dispatch_command(
    ctx: &GatewayContext,
    conn_id: Uuid,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
) -> Result<(), ChatError> {
    match cmd {
        // The handshake consumed the real Identify; a repeat is a protocol
        // violation and gets an error response rather than a silent drop.
        GatewayCommand::Identify { .. } => {
            return Err(ChatError::invalid("already identified"));
        }

        GatewayCommand::JoinChannel { channel_id } => {
            // Membership check on every subscribe; implicit join is only
            // offered for open channel kinds.
            let registry = ctx.registry.clone();
            run_blocking(move || {
                if !registry.is_member(channel_id, user_id)? {
                    registry.join_open(channel_id, user_id)?;
                }
                Ok(())
            })
            .await?;

            ctx.dispatcher.subscribe(conn_id, channel_id).await;
            info!("{} ({}) joined channel {}", username, user_id, channel_id);
        }

        GatewayCommand::LeaveChannel { channel_id } => {
            ctx.dispatcher.unsubscribe(conn_id, channel_id).await;
            ctx.typing.stop(channel_id, user_id).await;
        }

        GatewayCommand::SendMessage {
            channel_id,
            message,
        } => {
            let body = message.trim().to_string();
            if body.is_empty() {
                return Err(ChatError::invalid("message body must not be empty"));
            }
            if !ctx.dispatcher.is_subscribed(conn_id, channel_id).await {
                return Err(ChatError::forbidden("not subscribed to this channel"));
            }

            // Serialize append + fan-out per channel so every subscriber
            // observes messages in store commit order.
            let send_lock = ctx.dispatcher.channel_lock(channel_id).await;
            let _guard = send_lock.lock().await;

            let registry = ctx.registry.clone();
            let db = ctx.db.clone();
            let row = run_blocking(move || {
                // Membership can change between operations; re-check on
                // every send.
                if !registry.is_member(channel_id, user_id)? {
                    return Err(ChatError::forbidden("not a member of this channel"));
                }
                Ok(db.append_message(
                    &channel_id.to_string(),
                    &user_id.to_string(),
                    &body,
                )?)
            })
            .await?;

            let persisted = Message::try_from(row)?;

            // Sending a message ends composing
            ctx.typing.stop(channel_id, user_id).await;
            ctx.dispatcher
                .fan_out(channel_id, GatewayEvent::NewMessage(persisted))
                .await;
        }

        GatewayCommand::Typing { channel_id } => {
            if !ctx.dispatcher.is_subscribed(conn_id, channel_id).await {
                return Err(ChatError::forbidden("not subscribed to this channel"));
            }
            ctx.typing.start(channel_id, user_id, username, conn_id).await;
        }

        GatewayCommand::StopTyping { channel_id } => {
            if !ctx.dispatcher.is_subscribed(conn_id, channel_id).await {
                return Err(ChatError::forbidden("not subscribed to this channel"));
            }
            ctx.typing.stop(channel_id, user_id).await;
        }
    }

    Ok(())
}

/// Log-safe preview of an unparseable client frame: at most 200 characters,
/// always cut on a char boundary so multibyte frames cannot panic the recv
/// task.
fn frame_preview(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn error_event(err: &ChatError) -> GatewayEvent {
    let message = match err {
        // Don't leak storage internals to clients
        ChatError::Storage(_) => "internal error".to_string(),
        other => other.to_string(),
    };
    GatewayEvent::Error { message }
}

async fn run_blocking<T>(
    f: impl FnOnce() -> Result<T, ChatError> + Send + 'static,
) -> Result<T, ChatError>
where
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChatError::Storage(anyhow::anyhow!("blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typing::DEFAULT_TYPING_TIMEOUT;

    const GENERAL: &str = "00000000-0000-0000-0000-000000000001";

    fn context() -> GatewayContext {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new();
        GatewayContext {
            typing: TypingTracker::new(dispatcher.clone(), DEFAULT_TYPING_TIMEOUT),
            registry: ChannelRegistry::new(db.clone()),
            dispatcher,
            db,
        }
    }

    async fn register_user(ctx: &GatewayContext, username: &str) -> Uuid {
        let user_id = Uuid::new_v4();
        let db = ctx.db.clone();
        let name = username.to_string();
        let id = user_id.to_string();
        tokio::task::spawn_blocking(move || db.create_user(&id, &name, "hash"))
            .await
            .unwrap()
            .unwrap();
        user_id
    }

    #[tokio::test]
    async fn join_implicitly_joins_open_channels_and_subscribes() {
        let ctx = context();
        let general: Uuid = GENERAL.parse().unwrap();
        let user = register_user(&ctx, "alice").await;
        let (conn, _rx) = ctx.dispatcher.register().await;

        dispatch_command(
            &ctx,
            conn,
            user,
            "alice",
            GatewayCommand::JoinChannel { channel_id: general },
        )
        .await
        .unwrap();

        assert!(ctx.dispatcher.is_subscribed(conn, general).await);
        assert!(ctx.registry.is_member(general, user).unwrap());
    }

    #[tokio::test]
    async fn join_refuses_invite_only_channels_for_non_members() {
        let ctx = context();
        let creator = register_user(&ctx, "alice").await;
        let outsider = register_user(&ctx, "bob").await;
        let project = ctx
            .registry
            .create("apollo", huddle_types::models::ChannelKind::Project, "", creator)
            .unwrap();

        let (conn, _rx) = ctx.dispatcher.register().await;
        let err = dispatch_command(
            &ctx,
            conn,
            outsider,
            "bob",
            GatewayCommand::JoinChannel {
                channel_id: project.id,
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChatError::Forbidden(_)));
        assert!(!ctx.dispatcher.is_subscribed(conn, project.id).await);
    }

    #[tokio::test]
    async fn join_unknown_channel_is_not_found() {
        let ctx = context();
        let user = register_user(&ctx, "alice").await;
        let (conn, _rx) = ctx.dispatcher.register().await;

        let err = dispatch_command(
            &ctx,
            conn,
            user,
            "alice",
            GatewayCommand::JoinChannel {
                channel_id: Uuid::new_v4(),
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn send_fans_out_to_all_subscribers_including_sender() {
        let ctx = context();
        let general: Uuid = GENERAL.parse().unwrap();
        let alice = register_user(&ctx, "alice").await;
        let bob = register_user(&ctx, "bob").await;

        let (conn_a, mut rx_a) = ctx.dispatcher.register().await;
        let (conn_b, mut rx_b) = ctx.dispatcher.register().await;
        for (conn, user, name) in [(conn_a, alice, "alice"), (conn_b, bob, "bob")] {
            dispatch_command(
                &ctx,
                conn,
                user,
                name,
                GatewayCommand::JoinChannel { channel_id: general },
            )
            .await
            .unwrap();
        }

        dispatch_command(
            &ctx,
            conn_a,
            alice,
            "alice",
            GatewayCommand::SendMessage {
                channel_id: general,
                message: "hello".into(),
            },
        )
        .await
        .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                GatewayEvent::NewMessage(msg) => {
                    assert_eq!(msg.body, "hello");
                    assert_eq!(msg.author_id, alice);
                    assert_eq!(msg.author_username, "alice");
                    assert_ne!(msg.id, Uuid::nil());
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn empty_body_is_rejected_without_broadcast_or_append() {
        let ctx = context();
        let general: Uuid = GENERAL.parse().unwrap();
        let alice = register_user(&ctx, "alice").await;

        let (conn, mut rx) = ctx.dispatcher.register().await;
        dispatch_command(
            &ctx,
            conn,
            alice,
            "alice",
            GatewayCommand::JoinChannel { channel_id: general },
        )
        .await
        .unwrap();

        let err = dispatch_command(
            &ctx,
            conn,
            alice,
            "alice",
            GatewayCommand::SendMessage {
                channel_id: general,
                message: "   \n\t ".into(),
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChatError::InvalidInput(_)));
        assert!(rx.try_recv().is_err());
        assert!(ctx.db.list_messages(GENERAL, 10, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_without_join_is_forbidden_and_nothing_is_appended() {
        let ctx = context();
        let general: Uuid = GENERAL.parse().unwrap();
        let alice = register_user(&ctx, "alice").await;
        let (conn, _rx) = ctx.dispatcher.register().await;

        let err = dispatch_command(
            &ctx,
            conn,
            alice,
            "alice",
            GatewayCommand::SendMessage {
                channel_id: general,
                message: "hi".into(),
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChatError::Forbidden(_)));
        assert!(ctx.db.list_messages(GENERAL, 10, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_senders_are_observed_in_one_total_order() {
        let ctx = context();
        let general: Uuid = GENERAL.parse().unwrap();
        let alice = register_user(&ctx, "alice").await;
        let bob = register_user(&ctx, "bob").await;

        let (conn_a, mut rx_a) = ctx.dispatcher.register().await;
        let (conn_b, mut rx_b) = ctx.dispatcher.register().await;
        for (conn, user, name) in [(conn_a, alice, "alice"), (conn_b, bob, "bob")] {
            dispatch_command(
                &ctx,
                conn,
                user,
                name,
                GatewayCommand::JoinChannel { channel_id: general },
            )
            .await
            .unwrap();
        }

        let mut tasks = Vec::new();
        for i in 0..10 {
            let ctx = ctx.clone();
            let (conn, user, name) = if i % 2 == 0 {
                (conn_a, alice, "alice")
            } else {
                (conn_b, bob, "bob")
            };
            tasks.push(tokio::spawn(async move {
                dispatch_command(
                    &ctx,
                    conn,
                    user,
                    name,
                    GatewayCommand::SendMessage {
                        channel_id: general,
                        message: format!("msg-{}", i),
                    },
                )
                .await
                .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut order_a = Vec::new();
        let mut order_b = Vec::new();
        for _ in 0..10 {
            if let GatewayEvent::NewMessage(msg) = rx_a.recv().await.unwrap() {
                order_a.push(msg.id);
            }
            if let GatewayEvent::NewMessage(msg) = rx_b.recv().await.unwrap() {
                order_b.push(msg.id);
            }
        }
        assert_eq!(order_a, order_b);
    }

    #[test]
    fn frame_preview_truncates_on_char_boundaries() {
        // 199 ASCII bytes then multibyte chars: a byte-indexed slice at 200
        // would split the euro sign and panic
        let frame = format!("{}{}", "x".repeat(199), "€€€€€");
        let preview = frame_preview(&frame);
        assert_eq!(preview.chars().count(), 200);
        assert!(preview.ends_with('€'));

        let short = "tiny frame";
        assert_eq!(frame_preview(short), short);
    }

    #[tokio::test]
    async fn repeated_identify_is_rejected_not_swallowed() {
        let ctx = context();
        let alice = register_user(&ctx, "alice").await;
        let (conn, _rx) = ctx.dispatcher.register().await;

        let err = dispatch_command(
            &ctx,
            conn,
            alice,
            "alice",
            GatewayCommand::Identify {
                token: "again".into(),
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChatError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn typing_requires_subscription() {
        let ctx = context();
        let general: Uuid = GENERAL.parse().unwrap();
        let alice = register_user(&ctx, "alice").await;
        let (conn, _rx) = ctx.dispatcher.register().await;

        let err = dispatch_command(
            &ctx,
            conn,
            alice,
            "alice",
            GatewayCommand::Typing { channel_id: general },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChatError::Forbidden(_)));
    }
}
