use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Channel, ChannelKind, Message};

// -- JWT Claims --

/// JWT claims shared across huddle-api (REST middleware) and huddle-gateway
/// (WebSocket identify handshake). Canonical definition lives here in
/// huddle-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Channels --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateChannelRequest {
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub description: String,
}

/// One row of the channel directory: every channel is listed (not just
/// joined ones) so users can discover and join new channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOverview {
    #[serde(flatten)]
    pub channel: Channel,
    pub is_member: bool,
    pub member_count: u64,
}

#[derive(Debug, Serialize)]
pub struct JoinChannelResponse {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

// -- Messages --

#[derive(Debug, Serialize)]
pub struct MessageHistoryResponse {
    pub messages: Vec<Message>,
    /// Cursor for the next (older) page: the created_at of the oldest
    /// message returned, or None when the page was not full.
    pub next_before: Option<String>,
}

// -- Errors --

/// Conventional error envelope for the REST surface.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
