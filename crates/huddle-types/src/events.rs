use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Events sent from the server to clients over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A message was appended to a channel. Delivered to every subscriber
    /// of the channel, including the author's own connection.
    NewMessage(Message),

    /// A user started typing. Never delivered to the typer's own connection.
    UserTyping {
        channel_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    /// A user stopped typing (explicit stop, inactivity, or disconnect).
    UserStopTyping { channel_id: Uuid, user_id: Uuid },

    /// A command from this client violated a contract. Scoped to the
    /// offending client only; the connection stays open.
    Error { message: String },
}

impl GatewayEvent {
    /// Returns the channel this event is scoped to, if any.
    pub fn channel_id(&self) -> Option<Uuid> {
        match self {
            Self::NewMessage(msg) => Some(msg.channel_id),
            Self::UserTyping { channel_id, .. } => Some(*channel_id),
            Self::UserStopTyping { channel_id, .. } => Some(*channel_id),
            Self::Ready { .. } | Self::Error { .. } => None,
        }
    }
}

/// Commands sent from clients to the server over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Authenticate the connection. Must be the first command; nothing else
    /// is processed until it succeeds.
    Identify { token: String },

    /// Subscribe to a channel's events. Requires membership; open-join
    /// channels are joined implicitly.
    JoinChannel { channel_id: Uuid },

    /// Drop the subscription. Does not delete the membership.
    LeaveChannel { channel_id: Uuid },

    /// Append a message and fan it out to all subscribers.
    SendMessage { channel_id: Uuid, message: String },

    /// Indicate the user is composing a message.
    Typing { channel_id: Uuid },

    /// Indicate the user stopped composing.
    StopTyping { channel_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_snake_case_wire_names() {
        let cmd = GatewayCommand::SendMessage {
            channel_id: Uuid::nil(),
            message: "hello".into(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "send_message");
        assert_eq!(json["data"]["message"], "hello");

        let parsed: GatewayCommand = serde_json::from_str(
            r#"{"type":"typing","data":{"channel_id":"00000000-0000-0000-0000-000000000001"}}"#,
        )
        .unwrap();
        assert!(matches!(parsed, GatewayCommand::Typing { .. }));
    }

    #[test]
    fn events_report_their_channel_scope() {
        let event = GatewayEvent::UserStopTyping {
            channel_id: Uuid::nil(),
            user_id: Uuid::nil(),
        };
        assert_eq!(event.channel_id(), Some(Uuid::nil()));

        let error = GatewayEvent::Error {
            message: "forbidden".into(),
        };
        assert_eq!(error.channel_id(), None);
    }
}
